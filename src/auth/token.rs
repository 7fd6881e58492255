use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix for user-facing authentication tokens.
pub const TOKEN_PREFIX: &str = "gt";

/// Prefix for OpenID Connect authorization codes.
pub const CODE_PREFIX: &str = "gc";

/// Why a printed token failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormatError {
    WrongPrefix,
    MissingSecret,
    InvalidKey,
    InvalidSecret,
}

impl std::fmt::Display for TokenFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenFormatError::WrongPrefix => write!(f, "Token does not start with gt-"),
            TokenFormatError::MissingSecret => write!(f, "Token is missing the secret component"),
            TokenFormatError::InvalidKey => write!(f, "Token key is malformed"),
            TokenFormatError::InvalidSecret => write!(f, "Token secret is malformed"),
        }
    }
}

impl std::error::Error for TokenFormatError {}

/// An opaque token in the form `gt-<key>.<secret>`.
///
/// The key is the public lookup handle; the secret is only ever compared
/// against the stored record and never logged. Both components are the
/// URL-safe base64 encoding of 16 random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Token {
    pub key: String,
    pub secret: String,
}

impl Token {
    /// Generate a new token with a random key and secret.
    pub fn generate() -> Self {
        Self {
            key: random_component(),
            secret: random_component(),
        }
    }

    /// Generate a token with a caller-supplied key (derived tokens) and a
    /// random secret.
    pub fn with_key(key: String) -> Self {
        Self {
            key,
            secret: random_component(),
        }
    }

    /// Parse the printed form of a token.
    pub fn parse(value: &str) -> Result<Self, TokenFormatError> {
        Self::parse_with_prefix(value, TOKEN_PREFIX)
    }

    /// Parse the printed form of an authorization code (`gc-` prefix).
    pub fn parse_code(value: &str) -> Result<Self, TokenFormatError> {
        Self::parse_with_prefix(value, CODE_PREFIX)
    }

    fn parse_with_prefix(value: &str, prefix: &str) -> Result<Self, TokenFormatError> {
        let rest = value
            .strip_prefix(prefix)
            .and_then(|v| v.strip_prefix('-'))
            .ok_or(TokenFormatError::WrongPrefix)?;
        let (key, secret) = rest.split_once('.').ok_or(TokenFormatError::MissingSecret)?;
        if !is_component(key) {
            return Err(TokenFormatError::InvalidKey);
        }
        if !is_component(secret) {
            return Err(TokenFormatError::InvalidSecret);
        }
        Ok(Self {
            key: key.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Printed form with the standard `gt-` prefix.
    pub fn printable(&self) -> String {
        format!("{}-{}.{}", TOKEN_PREFIX, self.key, self.secret)
    }

    /// Printed form with the authorization-code `gc-` prefix.
    pub fn printable_code(&self) -> String {
        format!("{}-{}.{}", CODE_PREFIX, self.key, self.secret)
    }

    /// SHA-256 hash of the secret, as stored in the database so the rebuild
    /// path can verify a presented secret without keeping it in cleartext.
    pub fn secret_hash(&self) -> String {
        hash_secret(&self.secret)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.printable())
    }
}

impl From<Token> for String {
    fn from(token: Token) -> String {
        token.printable()
    }
}

impl TryFrom<String> for Token {
    type Error = TokenFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Token::parse(&value)
    }
}

/// Hash a token secret for at-rest storage in the database.
pub fn hash_secret(secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes()))
}

/// 16 random bytes, URL-safe base64 without padding (22 characters).
pub fn random_component() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

fn is_component(value: &str) -> bool {
    if value.len() != 22 {
        return false;
    }
    URL_SAFE_NO_PAD
        .decode(value)
        .map(|b| b.len() == 16)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let token = Token::generate();
        let printed = token.printable();
        assert!(printed.starts_with("gt-"));
        assert_eq!(Token::parse(&printed).unwrap(), token);
    }

    #[test]
    fn code_round_trip() {
        let code = Token::generate();
        let printed = code.printable_code();
        assert!(printed.starts_with("gc-"));
        assert_eq!(Token::parse_code(&printed).unwrap(), code);
    }

    #[test]
    fn components_have_sixteen_bytes_of_entropy() {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        let token = Token::generate();
        assert_eq!(URL_SAFE_NO_PAD.decode(&token.key).unwrap().len(), 16);
        assert_eq!(URL_SAFE_NO_PAD.decode(&token.secret).unwrap().len(), 16);
    }

    #[test]
    fn parse_rejects_malformed_tokens() {
        assert_eq!(
            Token::parse("blah").unwrap_err(),
            TokenFormatError::WrongPrefix
        );
        assert_eq!(
            Token::parse("gt-invalid").unwrap_err(),
            TokenFormatError::MissingSecret
        );
        let token = Token::generate();
        let printed = format!("gt-short.{}", token.secret);
        assert_eq!(
            Token::parse(&printed).unwrap_err(),
            TokenFormatError::InvalidKey
        );
        let printed = format!("gt-{}.!!!", token.key);
        assert_eq!(
            Token::parse(&printed).unwrap_err(),
            TokenFormatError::InvalidSecret
        );
    }

    #[test]
    fn code_prefix_is_not_a_token() {
        let code = Token::generate().printable_code();
        assert!(Token::parse(&code).is_err());
    }
}
