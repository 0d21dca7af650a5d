use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("render root `{}` is unusable: {reason}", root.display())]
    RenderRoot { root: PathBuf, reason: String },
}

impl InfraError {
    pub fn render_root(root: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RenderRoot {
            root: root.into(),
            reason: reason.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
