//! Caller identity and the explicit authorization checks every operation runs.
//!
//! There is no ambient "current user": each engine call receives a [`Caller`]
//! resolved once by the [`IdentityProvider`] at authentication time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{ActorType, Dossier, UploaderType, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Client,
    Agent,
    Admin,
    /// Internal privileged path (provisioning, reconciliation). Never issued
    /// to an external caller.
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId(id.into()),
            role,
        }
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(id, Role::Client)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(id, Role::Agent)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn system() -> Self {
        Self::new("system", Role::System)
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Agent | Role::Admin | Role::System)
    }

    pub fn actor_type(&self) -> ActorType {
        match self.role {
            Role::Client => ActorType::User,
            Role::Agent | Role::Admin => ActorType::Agent,
            Role::System => ActorType::System,
        }
    }

    pub fn uploader_type(&self) -> UploaderType {
        if self.is_staff() {
            UploaderType::Agent
        } else {
            UploaderType::Client
        }
    }

    pub fn require_staff(&self, action: &str) -> WorkflowResult<()> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(WorkflowError::forbidden(format!(
                "{action} requires an agent or admin role"
            )))
        }
    }

    pub fn require_admin(&self, action: &str) -> WorkflowResult<()> {
        match self.role {
            Role::Admin | Role::System => Ok(()),
            _ => Err(WorkflowError::forbidden(format!(
                "{action} requires the admin role"
            ))),
        }
    }

    /// Staff may act on any dossier, clients only on their own.
    pub fn require_access(&self, dossier: &Dossier) -> WorkflowResult<()> {
        if self.is_staff() || dossier.owner_id == self.id {
            Ok(())
        } else {
            Err(WorkflowError::forbidden(format!(
                "dossier {} does not belong to caller",
                dossier.id
            )))
        }
    }
}

/// Resolves the authenticated caller for a request.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_caller(&self, token: &str) -> WorkflowResult<Caller>;
}
