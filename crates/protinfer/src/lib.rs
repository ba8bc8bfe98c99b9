pub mod engine;
pub mod error;
pub mod factor;
pub mod fdr;
pub mod graph;
pub mod grid;
pub mod infer;
pub mod inference;
pub mod pmf;
pub mod scheduler;

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn read_json<T: DeserializeOwned, S: AsRef<str>>(path: S) -> Result<T, ReadError> {
    let bytes = std::fs::read(path.as_ref())?;
    Ok(serde_json::from_slice(&bytes)?)
}
