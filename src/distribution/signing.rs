//! Time-limited URL signatures
//!
//! `signature = base64url(HMAC-SHA256(secret, path + "\n" + expires))`, where
//! `expires` is a unix timestamp in seconds. The origin recomputes the MAC
//! and compares in constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::error::{BundlecastError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Generate a random signing secret
pub fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| BundlecastError::Config(format!("Invalid signing key: {}", e)))?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, path: &str, expires: i64) -> Result<String> {
        let tag = self.mac(path, expires)?.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(tag))
    }

    /// Check a signature at the current time
    pub fn verify(&self, path: &str, expires: i64, signature: &str) -> Result<()> {
        self.verify_at(path, expires, signature, Utc::now().timestamp())
    }

    pub fn verify_at(&self, path: &str, expires: i64, signature: &str, now: i64) -> Result<()> {
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| BundlecastError::InvalidSignature)?;
        self.mac(path, expires)?
            .verify_slice(&provided)
            .map_err(|_| BundlecastError::InvalidSignature)?;

        // Expiry is checked after the MAC so a forged timestamp reads as forged
        if now > expires {
            return Err(BundlecastError::Expired);
        }
        Ok(())
    }
}
