use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}
