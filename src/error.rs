//! Errors surfaced at the edges of the inspector.
//!
//! Recording itself never fails; only turning a snapshot into bytes can.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("failed to serialize recording: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = InspectorError> = std::result::Result<T, E>;
