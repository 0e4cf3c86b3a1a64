//! User/connection directory collaborator
//!
//! The directory resolves emails to user identities and records approved
//! connections. It is owned by the surrounding application; this crate only
//! consumes it through the [`Directory`] trait. An in-memory implementation
//! is provided for tests and for embedders without a user service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};

/// A resolved user identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
}

/// Resolves emails to identities and records approved connections
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve an email to a user identity
    ///
    /// Returns [`WorkflowError::IdentityNotFound`] when no user matches.
    async fn resolve_identity(&self, email: &str) -> Result<Identity>;

    /// Record an approved connection between two users with a strength value
    async fn record_approved_connection(&self, a: Uuid, b: Uuid, strength: u32) -> Result<()>;
}

/// In-memory directory keyed by email
#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<String, Identity>>,
    connections: RwLock<Vec<(Uuid, Uuid, u32)>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and return their identity
    pub async fn register(&self, email: impl Into<String>) -> Identity {
        let email = email.into();
        let identity = Identity {
            id: Uuid::new_v4(),
            email: email.clone(),
        };
        let mut users = self.users.write().await;
        users.insert(email, identity.clone());
        identity
    }

    /// Connections recorded so far, in recording order
    pub async fn connections(&self) -> Vec<(Uuid, Uuid, u32)> {
        self.connections.read().await.clone()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resolve_identity(&self, email: &str) -> Result<Identity> {
        let users = self.users.read().await;
        users
            .get(email)
            .cloned()
            .ok_or_else(|| WorkflowError::IdentityNotFound(email.to_string()))
    }

    async fn record_approved_connection(&self, a: Uuid, b: Uuid, strength: u32) -> Result<()> {
        let mut connections = self.connections.write().await;
        connections.push((a, b, strength));
        Ok(())
    }
}
