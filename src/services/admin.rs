use std::sync::Arc;

use crate::db::tokens::TokenDatabase;
use crate::error::ApiError;
use crate::models::admin::{Admin, BOOTSTRAP_ACTOR};
use crate::services::token::validate_username;

/// Manages the token administrator list.
///
/// Only an existing admin (or the bootstrap actor) may change the list, and
/// the final admin can never be removed. The bootstrap actor itself is
/// always treated as an admin but never stored.
#[derive(Clone)]
pub struct AdminService {
    db: Arc<dyn TokenDatabase>,
}

impl AdminService {
    pub fn new(db: Arc<dyn TokenDatabase>) -> Self {
        Self { db }
    }

    pub async fn get_admins(&self) -> Result<Vec<Admin>, ApiError> {
        self.db.list_admins().await
    }

    pub async fn is_admin(&self, username: &str) -> Result<bool, ApiError> {
        if username == BOOTSTRAP_ACTOR {
            return Ok(true);
        }
        self.db.is_admin(username).await
    }

    pub async fn add_admin(&self, username: &str, actor: &str) -> Result<(), ApiError> {
        self.require_admin(actor).await?;
        validate_username(username)?;
        if self.db.add_admin(username).await? {
            tracing::info!(admin = username, actor, "added admin");
        }
        Ok(())
    }

    pub async fn delete_admin(&self, username: &str, actor: &str) -> Result<bool, ApiError> {
        self.require_admin(actor).await?;
        if self.db.is_admin(username).await? && self.db.count_admins().await? <= 1 {
            return Err(ApiError::permission_denied("cannot delete last admin"));
        }
        let deleted = self.db.delete_admin(username).await?;
        if deleted {
            tracing::info!(admin = username, actor, "deleted admin");
        }
        Ok(deleted)
    }

    /// Merge the configured bootstrap admins into the database. Called once
    /// at startup; admins removed at runtime are only re-added on restart
    /// if they are still in the configuration.
    pub async fn ensure_initial_admins(&self, initial_admins: &[String]) -> Result<(), ApiError> {
        for username in initial_admins {
            if self.db.add_admin(username).await? {
                tracing::info!(admin = %username, "added initial admin");
            }
        }
        Ok(())
    }

    async fn require_admin(&self, actor: &str) -> Result<(), ApiError> {
        if self.is_admin(actor).await? {
            Ok(())
        } else {
            Err(ApiError::permission_denied(format!(
                "{} is not an admin",
                actor
            )))
        }
    }
}
