//! Initialization options for the worker.

use crate::handler::{Handler, LogHandler};
use crate::transport::{NatsTransport, Transport};
use std::sync::Arc;

/// Collaborators a [`Worker`](crate::Worker) is built with.
///
/// Starts from `{handler: LogHandler, transport: NatsTransport}`; each setter
/// replaces the previous value, so the last call wins.
///
/// # Example
///
/// ```rust
/// use natsq::{InitOptions, LogHandler, MemoryTransport, MetricsHandler};
/// use std::sync::Arc;
///
/// let options = InitOptions::new()
///     .with_handler(Arc::new(MetricsHandler::new(LogHandler)))
///     .with_transport(Arc::new(MemoryTransport::new()));
/// ```
#[derive(Clone)]
pub struct InitOptions {
    handler: Arc<dyn Handler>,
    transport: Arc<dyn Transport>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            handler: Arc::new(LogHandler),
            transport: Arc::new(NatsTransport),
        }
    }
}

impl InitOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the handler.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    /// Override the transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Configured handler.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Configured transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}
