//! Engine-level errors.
//!
//! An engine that runs and reports failure is not an error: that is an
//! [`InvocationOutcome`](crate::InvocationOutcome) with a failed exit. Only
//! the two infrastructure conditions below are.

use std::io;

use crate::engine::Backend;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The backend could not be started (spawn failed, module failed to load).
    #[error("{backend} engine unavailable: {message}")]
    Unavailable { backend: Backend, message: String },

    /// The scratch filesystem could not be prepared or read back.
    #[error("engine scratch I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn unavailable(backend: Backend, message: impl Into<String>) -> Self {
        EngineError::Unavailable {
            backend,
            message: message.into(),
        }
    }
}

impl From<EngineError> for webmforge_common::Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable { backend, message } => {
                webmforge_common::Error::environment(backend.as_str(), message)
            }
            EngineError::Io(source) => webmforge_common::Error::from(source),
        }
    }
}
