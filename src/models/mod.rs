pub mod admin;
pub mod history;
pub mod oidc;
pub mod token;
