//! Request/response payload logging.
//!
//! The function layer hands every exchange to a [`CommunicationLogger`].
//! Payload dumps are off by default; install [`TracingCommunicationLogger`]
//! to get hex dumps at TRACE level or [`CallbackLogger`] to route them
//! elsewhere.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::bytes::format_hex;

/// Records raw request and response bytes of one exchange.
///
/// `context` identifies the exchange, e.g. `[12] 1.TotalPower(0x00)`.
pub trait CommunicationLogger: Send + Sync {
    fn log_communication(&self, context: &str, request: &[u8], response: &[u8]);
}

/// Logger that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCommunicationLogger;

impl CommunicationLogger for NoopCommunicationLogger {
    fn log_communication(&self, _context: &str, _request: &[u8], _response: &[u8]) {}
}

/// Hex dumps through `tracing` at TRACE level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCommunicationLogger;

impl CommunicationLogger for TracingCommunicationLogger {
    fn log_communication(&self, context: &str, request: &[u8], response: &[u8]) {
        trace!(
            "{} request: [{}] response: [{}]",
            context,
            format_hex(request),
            format_hex(response)
        );
    }
}

/// Signature of a user payload callback.
pub type LogCallback = Arc<dyn Fn(&str, &[u8], &[u8]) + Send + Sync>;

/// Forwards payloads to a user callback.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: LogCallback,
}

impl CallbackLogger {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str, &[u8], &[u8]) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl CommunicationLogger for CallbackLogger {
    fn log_communication(&self, context: &str, request: &[u8], response: &[u8]) {
        (self.callback)(context, request, response);
    }
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger").finish_non_exhaustive()
    }
}
