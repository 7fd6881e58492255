use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ApiError;

/// Error raised while loading the issuer signing key.
#[derive(Debug)]
pub struct KeyError(pub String);

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot load issuer key: {}", self.0)
    }
}

impl std::error::Error for KeyError {}

/// Holds the issuer RSA keypair and derived `jsonwebtoken` encoding and
/// decoding keys.
///
/// The key is read from the PEM file named in the configuration. The `kid`
/// is derived from the public modulus so it stays stable across restarts
/// with the same key, and changes whenever the key is rotated.
#[derive(Clone)]
pub struct SigningKeys {
    /// Key ID published in JWKS and stamped into token headers.
    pub kid: String,
    /// The `jsonwebtoken` encoding key (private).
    pub encoding: EncodingKey,
    /// The `jsonwebtoken` decoding key (public).
    pub decoding: DecodingKey,
    /// Base64url public modulus (JWKS `n`).
    pub modulus_b64: String,
    /// Base64url public exponent (JWKS `e`).
    pub exponent_b64: String,
}

impl SigningKeys {
    /// Parse an RSA private key in PKCS#8 or PKCS#1 PEM form.
    pub fn from_pem(pem: &str, kid_override: Option<&str>) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| KeyError(e.to_string()))?;
        let public = private.to_public_key();
        let n = public.n().to_bytes_be();
        let e = public.e().to_bytes_be();

        let encoding =
            EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| KeyError(e.to_string()))?;
        let decoding = DecodingKey::from_rsa_raw_components(&n, &e);

        // Stable kid: first 8 hex characters of the SHA-256 of the modulus.
        let kid = match kid_override {
            Some(kid) => kid.to_string(),
            None => {
                let digest = Sha256::digest(&n);
                hex_prefix(&digest, 8)
            }
        };

        Ok(Self {
            kid,
            encoding,
            decoding,
            modulus_b64: URL_SAFE_NO_PAD.encode(&n),
            exponent_b64: URL_SAFE_NO_PAD.encode(&e),
        })
    }

    /// Sign a claims object as an RS256 JWT with this key's `kid`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, ApiError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding).map_err(|e| {
            tracing::error!(?e, "failed to sign token");
            ApiError::internal("Token signing failed")
        })
    }

    /// The JWKS document exposing the public key.
    pub fn jwks(&self) -> serde_json::Value {
        serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "kid": self.kid,
                "n": self.modulus_b64,
                "e": self.exponent_b64,
            }]
        })
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()[..chars]
        .to_string()
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeys")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}
