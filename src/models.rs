use serde::{Deserialize, Serialize};

// request headers of the chunk protocol
pub const HEADER_CONTENT_NAME: &str = "x-content-name";
pub const HEADER_CONTENT_LENGTH: &str = "x-content-length";
pub const HEADER_CHUNKS_QUANTITY: &str = "x-chunks-quantity";
pub const HEADER_CONTENT_ID: &str = "x-content-id";
pub const HEADER_CHUNK_ID: &str = "x-chunk-id";

/// error text for a session id the server does not know
pub const UNKNOWN_SESSION_ERROR: &str = "Wrong content id header";

// response for upload initialization
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub status: u16,
    pub file_id: String,
}

// response for a stored chunk
#[derive(Serialize, Deserialize, Debug)]
pub struct ChunkResponse {
    pub status: u16,
    pub size: u64,
}

// response for the session status endpoint
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub status: u16,
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub chunks_quantity: usize,
    pub chunks_done: usize,
}

// generic error response
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
}

/// any reply of the upload endpoints, as seen by the client
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerReply {
    pub status: u16,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}
