//! Error types for the merge engine and its baseline collaborators.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Baseline request to {url} failed with status {status}")]
    Status { status: u16, url: String },

    #[error(transparent)]
    Stream(#[from] common::Error),
}

pub type Result<T> = std::result::Result<T, MergeError>;
