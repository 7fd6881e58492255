use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GitHubConfig;
use crate::error::ApiError;
use crate::models::token::Group;
use crate::providers::{AuthProvider, UserInfo};

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const API_BASE: &str = "https://api.github.com";

/// OAuth scopes requested from GitHub.
const SCOPES: &str = "read:user,read:org,user:email";

/// Teams-as-groups are truncated to this length.
const GROUP_NAME_MAX: usize = 32;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
    id: i64,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubTeam {
    slug: String,
    id: i64,
    organization: GitHubOrganization,
}

#[derive(Debug, Deserialize)]
struct GitHubOrganization {
    login: String,
}

/// GitHub OAuth2 adapter.
///
/// The callback exchanges the code for an access token, then resolves the
/// user, primary email, and team memberships. Team membership becomes the
/// group list: `<org>-<team-slug>`, cleaned and truncated.
pub struct GitHubProvider {
    config: GitHubConfig,
    http: reqwest::Client,
}

impl GitHubProvider {
    pub fn new(config: GitHubConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    async fn get_access_token(&self, code: &str, state: &str) -> Result<String, ApiError> {
        let response: AccessTokenResponse = self
            .http
            .post(TOKEN_URL)
            .header("Accept", "application/json")
            .timeout(HTTP_TIMEOUT)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("state", state),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.access_token.ok_or_else(|| {
            tracing::error!(
                error = response.error_description.as_deref().unwrap_or("unknown"),
                "GitHub rejected the authorization code"
            );
            ApiError::permission_denied("GitHub authentication failed")
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
    ) -> Result<T, ApiError> {
        Ok(self
            .http
            .get(format!("{}{}", API_BASE, path))
            .header("Authorization", format!("token {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "gafaelfawr")
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn get_teams(&self, token: &str) -> Result<Vec<GitHubTeam>, ApiError> {
        let mut teams = Vec::new();
        let per_page = 100;
        let mut page = 1;
        loop {
            let batch: Vec<GitHubTeam> = self
                .get_json(token, &format!("/user/teams?per_page={per_page}&page={page}"))
                .await?;
            let done = batch.len() < per_page;
            teams.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(teams)
    }
}

#[async_trait]
impl AuthProvider for GitHubProvider {
    fn login_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&scope={}&state={}",
            AUTHORIZE_URL,
            urlencode(&self.config.client_id),
            urlencode(SCOPES),
            urlencode(state),
        )
    }

    async fn exchange(&self, code: &str, state: &str) -> Result<UserInfo, ApiError> {
        let access_token = self.get_access_token(code, state).await?;

        let user: GitHubUser = self.get_json(&access_token, "/user").await?;
        let emails: Vec<GitHubEmail> = self.get_json(&access_token, "/user/emails").await?;
        let teams = self.get_teams(&access_token).await?;

        let email = emails
            .iter()
            .find(|e| e.primary)
            .or(emails.first())
            .map(|e| e.email.clone());
        let groups = teams
            .iter()
            .map(|team| Group {
                name: group_name_for_team(&team.organization.login, &team.slug),
                id: Some(team.id),
            })
            .collect();

        Ok(UserInfo {
            username: user.login.to_lowercase(),
            name: user.name,
            email,
            uid: Some(user.id),
            gid: None,
            groups,
        })
    }
}

/// Build a group name from an organization and team slug.
///
/// Forbidden characters become dashes and the result is truncated to 32
/// characters so it stays a valid group name.
pub fn group_name_for_team(organization: &str, slug: &str) -> String {
    let name: String = format!("{}-{}", organization.to_lowercase(), slug.to_lowercase())
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    name.chars().take(GROUP_NAME_MAX).collect()
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
