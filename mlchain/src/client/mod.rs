//! The remote platform client contract.
//!
//! The engine depends only on three operations: create a resource, read its
//! status, and fetch its payload. Transport, authentication and payload
//! schema belong to the implementor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{RemoteId, ResourceKind};

/// Build state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    /// Still building.
    Pending,
    /// Finished successfully.
    Ready,
    /// Finished with an error.
    Failed,
}

/// A status reading for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    /// The build state.
    pub state: RemoteState,
    /// Optional platform detail (progress message or failure reason).
    pub detail: Option<String>,
}

impl RemoteStatus {
    /// A pending status.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: RemoteState::Pending,
            detail: None,
        }
    }

    /// A ready status.
    #[must_use]
    pub fn ready() -> Self {
        Self {
            state: RemoteState::Ready,
            detail: None,
        }
    }

    /// A failed status with a reason.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            state: RemoteState::Failed,
            detail: Some(detail.into()),
        }
    }
}

/// Errors surfaced by a remote client.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network or protocol failure talking to the platform.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// The platform did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The platform refused the request; retrying with the same input repeats the refusal.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Returns true if the error may go away on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

/// Client for the remote ML platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Starts building a resource and returns its id.
    async fn create(
        &self,
        kind: ResourceKind,
        params: serde_json::Value,
    ) -> Result<RemoteId, RemoteError>;

    /// Reads the current build state of a resource.
    async fn status(&self, remote_id: &RemoteId) -> Result<RemoteStatus, RemoteError>;

    /// Downloads a finished resource's payload.
    async fn fetch(&self, remote_id: &RemoteId) -> Result<serde_json::Value, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Transport(anyhow::anyhow!("connection reset")).is_transient());
        assert!(!RemoteError::Rejected("bad params".to_string()).is_transient());
    }

    #[test]
    fn test_status_constructors() {
        assert_eq!(RemoteStatus::ready().state, RemoteState::Ready);
        let failed = RemoteStatus::failed("no objective");
        assert_eq!(failed.state, RemoteState::Failed);
        assert_eq!(failed.detail.as_deref(), Some("no objective"));
    }

    #[tokio::test]
    async fn test_mock_client_contract() {
        let mut client = MockRemoteClient::new();
        client
            .expect_create()
            .returning(|kind, _| Ok(RemoteId::new(format!("{kind}/1"))));

        let id = client
            .create(ResourceKind::Dataset, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "dataset/1");
    }
}
