//! Per-operation execution context.
//!
//! A [`Context`] is created for every publish call and every inbound delivery
//! and threaded explicitly through handlers. It only carries trace metadata;
//! it is not a cancellation signal.

use chrono::{DateTime, Utc};

/// Immutable trace metadata for a single publish or delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    started_at: Option<DateTime<Utc>>,
    publish_id: Option<String>,
    request_id: Option<String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the ambient request id used for log correlation.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a publish id.
    pub fn with_publish_id(mut self, publish_id: impl Into<String>) -> Self {
        self.publish_id = Some(publish_id.into());
        self
    }

    /// Attach the time the operation started.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// When handling of this operation started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Publish id of the message being published or handled.
    pub fn publish_id(&self) -> Option<&str> {
        self.publish_id.as_deref()
    }

    /// Ambient request id, if the caller is already part of a trace.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

/// Reuse the ambient request id as publish id, or generate a new one.
///
/// The returned context carries the id both as publish id and as request id,
/// so logs emitted further down the call chain correlate with the message.
pub fn new_publish_id(ctx: &Context) -> (Context, String) {
    let publish_id = match ctx.request_id() {
        Some(request_id) if !request_id.is_empty() => request_id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    let ctx = ctx
        .clone()
        .with_request_id(publish_id.clone())
        .with_publish_id(publish_id.clone());
    (ctx, publish_id)
}
