pub mod github;
pub mod jwks;
pub mod ldap;
pub mod oidc;

use async_trait::async_trait;

use crate::error::ApiError;
use crate::models::token::Group;

/// Identity established by an upstream authentication provider.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    /// Canonical (lower-case) username.
    pub username: String,
    /// Full name, if the provider exposes it.
    pub name: Option<String>,
    pub email: Option<String>,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
    pub groups: Vec<Group>,
}

/// An upstream authentication provider (GitHub or an OIDC issuer).
///
/// The login route redirects the browser to `login_url`; the callback route
/// hands the returned code back to `exchange` to resolve an identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// URL to redirect the user to for authentication.
    fn login_url(&self, state: &str) -> String;

    /// Redeem the authorization code for the user's identity.
    async fn exchange(&self, code: &str, state: &str) -> Result<UserInfo, ApiError>;
}
