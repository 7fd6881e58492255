pub mod admin;
pub mod oidc;
pub mod token;
