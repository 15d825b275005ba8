use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model config error: {field} — {reason}")]
    Config { field: String, reason: String },

    #[error("Weight '{name}' not found in {source_desc}")]
    MissingWeight { name: String, source_desc: String },

    #[error(
        "Checkpoint keys do not match the model: {} missing, {} unexpected (missing: {missing:?}, unexpected: {unexpected:?})",
        missing.len(),
        unexpected.len()
    )]
    CheckpointMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
