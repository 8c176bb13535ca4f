use async_trait::async_trait;
use thiserror::Error;

use crate::batch::{HistoryBatch, OutputBatch};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A destination for output batches. Each delivery is independent; failed batches are not retried.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, batch: &OutputBatch) -> Result<(), SinkError>;

    /// Logged history, written with the logger's own timestamps. Live-only sinks ignore it.
    async fn deliver_history(&self, _history: &HistoryBatch) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
