use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::Deserialize;

use crate::models::oidc::OidcClient;
use crate::models::token::Group;

/// Default configuration path, overridable via `GAFAELFAWR_CONFIG`.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/gafaelfawr/gafaelfawr.yaml";

/// Error raised while loading or validating the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, err) => write!(f, "cannot read {}: {}", path.display(), err),
            ConfigError::Yaml(err) => write!(f, "malformed configuration: {}", err),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

// ---------------------------------------------------------------------------
// Raw settings file
// ---------------------------------------------------------------------------

/// The YAML settings file as written by the operator. Secrets are referenced
/// by file path here and resolved into [`Config`] at load time.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    realm: String,
    #[serde(default = "default_loglevel")]
    loglevel: String,
    session_secret_file: PathBuf,
    #[serde(default = "default_redis_url")]
    redis_url: String,
    redis_password_file: Option<PathBuf>,
    database_url: String,
    bootstrap_token: Option<String>,
    #[serde(default = "default_token_lifetime_minutes")]
    token_lifetime_minutes: i64,
    #[serde(default = "default_expiry_sweep_minutes")]
    expiry_sweep_minutes: u64,
    #[serde(default = "default_proxies")]
    proxies: Vec<String>,
    after_logout_url: String,
    #[serde(default)]
    allowed_return_hosts: Vec<String>,
    #[serde(default)]
    known_scopes: HashMap<String, String>,
    #[serde(default)]
    group_mapping: HashMap<String, Vec<String>>,
    #[serde(default)]
    initial_admins: Vec<String>,
    issuer: IssuerSettings,
    github: Option<GitHubSettings>,
    oidc: Option<OidcSettings>,
    oidc_server: Option<OidcServerSettings>,
    ldap: Option<LdapSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IssuerSettings {
    iss: String,
    aud: String,
    key_file: PathBuf,
    kid: Option<String>,
    #[serde(default = "default_exp_minutes")]
    exp_minutes: i64,
    influxdb_secret_file: Option<PathBuf>,
    influxdb_username: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitHubSettings {
    client_id: String,
    client_secret_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OidcSettings {
    client_id: String,
    client_secret_file: PathBuf,
    login_url: String,
    redirect_url: String,
    token_url: String,
    issuer: String,
    audience: String,
    jwks_uri: String,
    #[serde(default = "default_oidc_scopes")]
    scopes: Vec<String>,
    #[serde(default = "default_username_claim")]
    username_claim: String,
    #[serde(default = "default_uid_claim")]
    uid_claim: String,
    #[serde(default = "default_algorithms")]
    algorithms: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OidcServerSettings {
    secrets_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LdapSettings {
    url: String,
    user_dn: String,
    password_file: PathBuf,
    group_base_dn: String,
    #[serde(default = "default_ldap_cache_ttl_minutes")]
    cache_ttl_minutes: u64,
}

fn default_ldap_cache_ttl_minutes() -> u64 {
    5
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_token_lifetime_minutes() -> i64 {
    // 23 hours, comfortably under a daily re-login cadence.
    60 * 23
}

fn default_expiry_sweep_minutes() -> u64 {
    60
}

fn default_proxies() -> Vec<String> {
    vec!["10.0.0.0/8".to_string()]
}

fn default_exp_minutes() -> i64 {
    5
}

fn default_oidc_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_username_claim() -> String {
    "uid".to_string()
}

fn default_uid_claim() -> String {
    "uidNumber".to_string()
}

fn default_algorithms() -> Vec<String> {
    vec!["RS256".to_string()]
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully-resolved configuration with all secret files read.
#[derive(Debug, Clone)]
pub struct Config {
    pub realm: String,
    pub loglevel: String,
    pub session_secret: String,
    pub redis_url: String,
    pub database_url: String,
    pub bootstrap_token: Option<String>,
    pub token_lifetime: chrono::Duration,
    pub expiry_sweep_minutes: u64,
    pub proxies: Vec<IpNet>,
    pub after_logout_url: String,
    pub allowed_return_hosts: Vec<String>,
    pub known_scopes: HashMap<String, String>,
    pub group_mapping: HashMap<String, Vec<String>>,
    pub initial_admins: Vec<String>,
    pub issuer: IssuerConfig,
    pub github: Option<GitHubConfig>,
    pub oidc: Option<OidcConfig>,
    pub oidc_server: Option<OidcServerConfig>,
    pub ldap: Option<LdapConfig>,
}

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    pub iss: String,
    pub aud: String,
    pub key_pem: String,
    pub kid: Option<String>,
    pub exp_minutes: i64,
    pub influxdb_secret: Option<String>,
    pub influxdb_username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub client_id: String,
    pub client_secret: String,
    pub login_url: String,
    pub redirect_url: String,
    pub token_url: String,
    pub issuer: String,
    pub audience: String,
    pub jwks_uri: String,
    pub scopes: Vec<String>,
    pub username_claim: String,
    pub uid_claim: String,
    pub algorithms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OidcServerConfig {
    pub clients: Vec<OidcClient>,
}

#[derive(Debug, Clone)]
pub struct LdapConfig {
    pub url: String,
    pub user_dn: String,
    pub password: String,
    pub group_base_dn: String,
    pub cache_ttl: std::time::Duration,
}

impl Config {
    /// Path of the settings file, from `GAFAELFAWR_CONFIG` or the default.
    pub fn settings_path() -> PathBuf {
        std::env::var("GAFAELFAWR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    /// Load and validate the configuration, reading every referenced secret.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = read_file(path)?;
        let settings: Settings = serde_yaml::from_str(&raw)?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        if settings.github.is_some() == settings.oidc.is_some() {
            return Err(ConfigError::Invalid(
                "exactly one of github or oidc must be configured".to_string(),
            ));
        }
        for scope in settings.group_mapping.keys() {
            if !settings.known_scopes.contains_key(scope) {
                return Err(ConfigError::Invalid(format!(
                    "group_mapping refers to unknown scope {}",
                    scope
                )));
            }
        }

        let mut proxies = Vec::with_capacity(settings.proxies.len());
        for cidr in &settings.proxies {
            let net: IpNet = cidr
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bad proxy CIDR {}", cidr)))?;
            proxies.push(net);
        }

        let session_secret = read_secret(&settings.session_secret_file)?;
        let redis_url = match settings.redis_password_file {
            Some(ref path) => with_redis_password(&settings.redis_url, &read_secret(path)?)?,
            None => settings.redis_url.clone(),
        };

        let issuer = IssuerConfig {
            iss: settings.issuer.iss,
            aud: settings.issuer.aud,
            key_pem: read_secret(&settings.issuer.key_file)?,
            kid: settings.issuer.kid,
            exp_minutes: settings.issuer.exp_minutes,
            influxdb_secret: settings
                .issuer
                .influxdb_secret_file
                .as_ref()
                .map(|p| read_secret(p))
                .transpose()?,
            influxdb_username: settings.issuer.influxdb_username,
        };

        let github = settings
            .github
            .map(|g| {
                Ok::<_, ConfigError>(GitHubConfig {
                    client_id: g.client_id,
                    client_secret: read_secret(&g.client_secret_file)?,
                })
            })
            .transpose()?;

        let oidc = settings
            .oidc
            .map(|o| {
                Ok::<_, ConfigError>(OidcConfig {
                    client_id: o.client_id,
                    client_secret: read_secret(&o.client_secret_file)?,
                    login_url: o.login_url,
                    redirect_url: o.redirect_url,
                    token_url: o.token_url,
                    issuer: o.issuer,
                    audience: o.audience,
                    jwks_uri: o.jwks_uri,
                    scopes: o.scopes,
                    username_claim: o.username_claim,
                    uid_claim: o.uid_claim,
                    algorithms: o.algorithms,
                })
            })
            .transpose()?;

        let oidc_server = settings
            .oidc_server
            .map(|o| {
                let raw = read_file(&o.secrets_file)?;
                let clients: Vec<OidcClient> = serde_json::from_str(&raw).map_err(|e| {
                    ConfigError::Invalid(format!("malformed OIDC client secrets: {}", e))
                })?;
                Ok::<_, ConfigError>(OidcServerConfig { clients })
            })
            .transpose()?;

        let ldap = settings
            .ldap
            .map(|l| {
                Ok::<_, ConfigError>(LdapConfig {
                    url: l.url,
                    user_dn: l.user_dn,
                    password: read_secret(&l.password_file)?,
                    group_base_dn: l.group_base_dn,
                    cache_ttl: std::time::Duration::from_secs(l.cache_ttl_minutes * 60),
                })
            })
            .transpose()?;

        Ok(Config {
            realm: settings.realm,
            loglevel: settings.loglevel,
            session_secret,
            redis_url,
            database_url: settings.database_url,
            bootstrap_token: settings.bootstrap_token,
            token_lifetime: chrono::Duration::minutes(settings.token_lifetime_minutes),
            expiry_sweep_minutes: settings.expiry_sweep_minutes,
            proxies,
            after_logout_url: settings.after_logout_url,
            allowed_return_hosts: settings.allowed_return_hosts,
            known_scopes: settings.known_scopes,
            group_mapping: settings.group_mapping,
            initial_admins: settings.initial_admins,
            issuer,
            github,
            oidc,
            oidc_server,
            ldap,
        })
    }

    /// Map a user's group memberships to scopes via `group_mapping`.
    pub fn scopes_for_groups(&self, groups: &[Group]) -> Vec<String> {
        let mut scopes: Vec<String> = self
            .group_mapping
            .iter()
            .filter(|(_, members)| {
                groups
                    .iter()
                    .any(|g| members.iter().any(|m| m == &g.name))
            })
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        scopes
    }

    /// Whether an IP address belongs to one of the configured proxy ranges.
    pub fn is_proxy(&self, addr: std::net::IpAddr) -> bool {
        self.proxies.iter().any(|net| net.contains(&addr))
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
}

/// Read a secret file, stripping the trailing newline editors leave behind.
fn read_secret(path: &Path) -> Result<String, ConfigError> {
    Ok(read_file(path)?.trim_end_matches(['\r', '\n']).to_string())
}

fn with_redis_password(redis_url: &str, password: &str) -> Result<String, ConfigError> {
    let mut url = url::Url::parse(redis_url)
        .map_err(|_| ConfigError::Invalid(format!("bad redis URL {}", redis_url)))?;
    url.set_password(Some(password))
        .map_err(|_| ConfigError::Invalid("cannot apply redis password".to_string()))?;
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_secret(dir: &Path, name: &str, value: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{}", value).unwrap();
        path
    }

    fn base_yaml(dir: &Path) -> String {
        let session = write_secret(dir, "session", "session-secret");
        let github = write_secret(dir, "github", "github-secret");
        let key = write_secret(
            dir,
            "issuer-key",
            include_str!("../tests/data/issuer_key.pem").trim_end(),
        );
        format!(
            "realm: example.com\n\
             session_secret_file: {session}\n\
             database_url: postgresql://gafaelfawr@localhost/gafaelfawr\n\
             after_logout_url: https://example.com/\n\
             known_scopes:\n  exec:admin: Admin access\n  user:token: Token management\n\
             group_mapping:\n  exec:admin: [admins]\n\
             initial_admins: [admin]\n\
             issuer:\n  iss: https://example.com\n  aud: https://example.com\n  key_file: {key}\n\
             github:\n  client_id: some-client\n  client_secret_file: {github}\n",
            session = session.display(),
            github = github.display(),
            key = key.display(),
        )
    }

    #[test]
    fn load_resolves_secret_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("gafaelfawr.yaml");
        std::fs::write(&config_path, base_yaml(dir.path())).unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.realm, "example.com");
        assert_eq!(config.session_secret, "session-secret");
        assert_eq!(config.github.as_ref().unwrap().client_secret, "github-secret");
        assert!(config.issuer.key_pem.starts_with("-----BEGIN"));
        assert_eq!(config.token_lifetime, chrono::Duration::minutes(60 * 23));
        assert_eq!(config.proxies.len(), 1);
    }

    #[test]
    fn redis_password_is_applied_to_url() {
        let url = with_redis_password("redis://localhost:6379/0", "some-password").unwrap();
        assert_eq!(url, "redis://:some-password@localhost:6379/0");
    }

    #[test]
    fn group_mapping_must_use_known_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let mut yaml = base_yaml(dir.path());
        yaml.push_str("token_lifetime_minutes: 60\n");
        yaml = yaml.replace("exec:admin: [admins]", "exec:unknown: [admins]");
        let config_path = dir.path().join("gafaelfawr.yaml");
        std::fs::write(&config_path, yaml).unwrap();
        assert!(matches!(
            Config::load(&config_path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn scopes_for_groups_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("gafaelfawr.yaml");
        std::fs::write(&config_path, base_yaml(dir.path())).unwrap();
        let config = Config::load(&config_path).unwrap();

        let groups = vec![Group {
            name: "admins".to_string(),
            id: Some(1000),
        }];
        assert_eq!(config.scopes_for_groups(&groups), vec!["exec:admin"]);
        assert!(config.scopes_for_groups(&[]).is_empty());
    }
}
