use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid key encoding: {0}")]
    Encoding(#[from] hex::FromHexError),

    #[error("Expected {expected} key bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Malformed token")]
    Malformed,

    #[error("Unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token has expired")]
    Expired,

    #[error("Token issued in the future")]
    NotYetValid,

    #[error("Invalid verification key: {0}")]
    Key(#[from] KeyError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
