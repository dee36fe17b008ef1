//! Request Context
//!
//! Per-request state carried through every boundary call: a request id for
//! log correlation and a cancellation token raced against each suspension
//! point.

use std::future::Future;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// Context carried through a read or write pipeline
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID for tracing
    pub request_id: Uuid,

    /// Cancelled when the caller abandons the request
    cancel: CancellationToken,

    /// Start time for duration tracking
    started_at: Instant,
}

impl RequestContext {
    /// Create a new request context
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Create a context bound to an existing cancellation token
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel,
            started_at: Instant::now(),
        }
    }

    /// Context for a nested operation; cancelled with its parent
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id,
            cancel: self.cancel.child_token(),
            started_at: Instant::now(),
        }
    }

    /// The token observed by this request
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Run a boundary call, giving up with `Timeout` once cancelled
    pub async fn guard<T, E, F>(&self, call: F) -> EngineResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<EngineError>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Timeout),
            result = call => result.map_err(Into::into),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
