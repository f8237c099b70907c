//! Test data and a minimal client for the upload/download protocol.

use super::TestServer;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use iotafs_core::chunker::chunk_bytes;
use iotafs_core::packfile::{CompressionMode, PackBuilder, decode_block};
use iotafs_core::Fingerprint;
use serde_json::{Value, json};
use tower::ServiceExt;

/// Deterministic test content: `data[i] = i mod 251`.
#[allow(dead_code)]
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Deterministic incompressible content (xorshift64 stream); stored block
/// sizes track raw sizes, which vacuum waste-ratio tests rely on.
#[allow(dead_code)]
pub fn noise_data(len: usize) -> Vec<u8> {
    let mut state = 0x6a09_e667_f3bc_c908u64;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Make a JSON request against the router.
#[allow(dead_code)]
pub async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// POST raw bytes (a packfile) against the router.
#[allow(dead_code)]
pub async fn raw_post(router: &axum::Router, uri: &str, body: Vec<u8>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/octet-stream")
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// What an [`upload_file`] run observed: how much the server already had.
#[allow(dead_code)]
#[derive(Debug)]
pub struct UploadOutcome {
    /// The registered file version sum (hex).
    pub version_sum: String,
    /// Total chunks the file split into.
    pub num_chunks: usize,
    /// Distinct chunks the server reported missing.
    pub missing_chunks: usize,
}

/// Run the full client-side upload protocol: chunk locally with the server's
/// parameters, query the presence bitmap, pack and upload only the missing
/// chunks, then register the version under `name`.
#[allow(dead_code)]
pub async fn upload_file(server: &TestServer, name: &str, data: &[u8]) -> UploadOutcome {
    // Fetch the repository-scoped chunker params.
    let (status, params) = json_request(&server.router, "GET", "/v1/params", None).await;
    assert_eq!(status, StatusCode::OK);
    let params: iotafs_core::ChunkerParams = serde_json::from_value(params).unwrap();

    let chunks = chunk_bytes(data, &params);
    let sums: Vec<Fingerprint> = chunks.iter().map(|c| Fingerprint::compute(c)).collect();
    let sum_strings: Vec<String> = sums.iter().map(|s| s.to_hex()).collect();

    // Presence bitmap.
    let (status, response) = json_request(
        &server.router,
        "POST",
        "/v1/chunks/exist",
        Some(json!({ "sums": sum_strings })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let exists: Vec<bool> = serde_json::from_value(response["exists"].clone()).unwrap();
    assert_eq!(exists.len(), sums.len());

    // Pack the missing chunks, each distinct sum once.
    let mut packed = std::collections::HashSet::new();
    let mut builder = PackBuilder::new(params.max_chunk_size);
    let mut missing_chunks = 0;
    for (chunk, (sum, present)) in chunks.iter().zip(sums.iter().zip(exists.iter().copied())) {
        if !present && packed.insert(*sum) {
            builder.add_chunk(chunk).unwrap();
            missing_chunks += 1;
        }
    }

    if !builder.is_empty() {
        let (pack, pack_sum, _) = builder.finish();
        let (status, response) = raw_post(&server.router, "/packfile", pack.to_vec()).await;
        assert_eq!(status, StatusCode::OK, "packfile upload failed: {response}");
        assert_eq!(response["sum"], pack_sum.to_hex());
    }

    // Register the version.
    let (status, response) = json_request(
        &server.router,
        "POST",
        "/v1/files",
        Some(json!({ "name": name, "sums": sum_strings })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create file failed: {response}");
    let version_sum = response["sum"].as_str().unwrap().to_string();

    UploadOutcome {
        version_sum,
        num_chunks: chunks.len(),
        missing_chunks,
    }
}

/// Run the client side of Download: fetch the section plan, issue one ranged
/// read per section against the presigned `file://` URL, slice and decode
/// each chunk, and concatenate in logical order.
#[allow(dead_code)]
pub async fn download_file(server: &TestServer, version_sum: &str) -> Result<Vec<u8>, StatusCode> {
    let (status, response) = json_request(
        &server.router,
        "GET",
        &format!("/v1/download/{version_sum}"),
        None,
    )
    .await;
    if status != StatusCode::OK {
        return Err(status);
    }

    let mut pieces: Vec<(u64, Vec<u8>)> = Vec::new();
    for section in response["sections"].as_array().unwrap() {
        let url = section["url"].as_str().unwrap();
        let path = url.strip_prefix("file://").expect("test store presigns file:// URLs");
        let object = std::fs::read(path).unwrap();

        let range_start = section["range_start"].as_u64().unwrap() as usize;
        let range_end = section["range_end"].as_u64().unwrap() as usize;
        let range = &object[range_start..range_end];

        for chunk in section["chunks"].as_array().unwrap() {
            let sequence = chunk["sequence"].as_u64().unwrap();
            let size = chunk["size"].as_u64().unwrap();
            let offset = chunk["offset"].as_u64().unwrap() as usize;
            let stored_size = chunk["stored_size"].as_u64().unwrap() as usize;
            let mode = CompressionMode::from_u8(chunk["mode"].as_u64().unwrap() as u8).unwrap();
            let sum = Fingerprint::from_hex(chunk["sum"].as_str().unwrap()).unwrap();

            let stored = &range[offset..offset + stored_size];
            let raw = decode_block(stored, mode, size, &sum).unwrap();
            pieces.push((sequence, raw.to_vec()));
        }
    }

    pieces.sort_by_key(|(sequence, _)| *sequence);
    for (expected, (sequence, _)) in pieces.iter().enumerate() {
        assert_eq!(*sequence, expected as u64, "section plan skipped a sequence");
    }
    Ok(pieces.into_iter().flat_map(|(_, bytes)| bytes).collect())
}
