//! Per-request context handed in by the front-end

use super::request_id::effective_request_id;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Request context carried from the front-end into the orchestrator
///
/// Holds everything the core needs about the caller: the effective
/// request id, the opaque auth principal, the deadline, and the
/// cancellation token that propagates into every suspension point.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Effective request id (validated client id or generated)
    pub request_id: String,
    /// Opaque API key identifier, if the front-end authenticated one
    pub api_key_id: Option<String>,
    /// Opaque end-user identifier
    pub user_id: Option<String>,
    /// Request tags for tag-based routing
    pub tags: Vec<String>,
    /// Absolute deadline for the whole request
    pub deadline: Option<Instant>,
    /// Cancellation token; cancelled by the front-end on client disconnect
    pub cancellation: CancellationToken,
}

impl RequestContext {
    /// Build a context, adopting or substituting the client request id
    pub fn new(client_request_id: Option<&str>) -> Self {
        Self {
            request_id: effective_request_id(client_request_id),
            api_key_id: None,
            user_id: None,
            tags: Vec::new(),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach an authenticated API key id
    pub fn with_api_key(mut self, api_key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self
    }

    /// Attach an end-user id
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach routing tags
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set a deadline relative to now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Time remaining until the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the caller has given up, by cancellation or deadline
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
            || self.remaining().is_some_and(|left| left.is_zero())
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let ctx = RequestContext::new(Some("client-id"))
            .with_api_key("key-1")
            .with_user("user-1")
            .with_tags(vec!["fast".into()]);
        assert_eq!(ctx.request_id, "client-id");
        assert_eq!(ctx.api_key_id.as_deref(), Some("key-1"));
        assert_eq!(ctx.tags, vec!["fast"]);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_deadline_expiry() {
        let ctx = RequestContext::new(None).with_timeout(Duration::ZERO);
        assert!(ctx.is_cancelled());

        let ctx = RequestContext::new(None).with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() > Duration::from_secs(59));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_cancellation_token() {
        let ctx = RequestContext::new(None);
        ctx.cancellation.cancel();
        assert!(ctx.is_cancelled());
    }
}
