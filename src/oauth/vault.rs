// =============================================================================
// Token vault — encryption-at-rest for broker tokens
// =============================================================================
//
// Tokens must never sit on disk in the clear. The vault runs a keystream
// cipher built from the primitives already in the crypto stack: block `i` of
// the keystream is HMAC-SHA256(key, nonce || i), XORed over the plaintext.
// A fresh 16-byte nonce is drawn per encryption, prepended to the
// ciphertext, and the whole blob is base64-encoded.
//
// The 32-byte key is generated once and written with owner-only permissions;
// losing the key file just means re-running the interactive auth.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const BLOCK_LEN: usize = 32;

/// Keystream cipher keyed from a file on disk.
pub struct TokenVault {
    key: [u8; KEY_LEN],
}

impl TokenVault {
    /// Load the key from `key_path`, generating it on first use.
    pub fn open(key_path: impl Into<PathBuf>) -> Result<Self> {
        let key_path = key_path.into();
        if key_path.exists() {
            let encoded = std::fs::read_to_string(&key_path)
                .with_context(|| format!("failed to read key file {}", key_path.display()))?;
            let bytes = B64
                .decode(encoded.trim())
                .context("key file is not valid base64")?;
            let key: [u8; KEY_LEN] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("key file has the wrong length"))?;
            return Ok(Self { key });
        }

        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&key_path, B64.encode(key))
            .with_context(|| format!("failed to write key file {}", key_path.display()))?;
        restrict_permissions(&key_path)?;

        info!(path = %key_path.display(), "encryption key generated");
        Ok(Self { key })
    }

    /// Build a vault from raw key bytes (tests).
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    fn keystream_block(&self, nonce: &[u8], counter: u64) -> [u8; BLOCK_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size");
        mac.update(nonce);
        mac.update(&counter.to_be_bytes());
        mac.finalize().into_bytes().into()
    }

    fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
        for (i, chunk) in data.chunks_mut(BLOCK_LEN).enumerate() {
            let block = self.keystream_block(nonce, i as u64);
            for (byte, k) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= k;
            }
        }
    }

    /// Encrypt to base64(`nonce || ciphertext`).
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut data = plaintext.as_bytes().to_vec();
        self.apply_keystream(&nonce, &mut data);

        let mut blob = Vec::with_capacity(NONCE_LEN + data.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&data);
        B64.encode(blob)
    }

    /// Decrypt a blob produced by [`encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let blob = B64.decode(encoded.trim()).context("ciphertext is not valid base64")?;
        if blob.len() < NONCE_LEN {
            anyhow::bail!("ciphertext too short");
        }
        let (nonce, data) = blob.split_at(NONCE_LEN);
        let mut data = data.to_vec();
        self.apply_keystream(nonce, &mut data);
        String::from_utf8(data).context("decrypted token data is not UTF-8 (wrong key?)")
    }
}

/// Owner-only file permissions (0600). No-op off unix.
pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> TokenVault {
        TokenVault::from_key([7u8; KEY_LEN])
    }

    #[test]
    fn roundtrip() {
        let v = vault();
        let secret = "oauth_token_secret_value_1234567890";
        let blob = v.encrypt(secret);
        assert_ne!(blob, secret);
        assert_eq!(v.decrypt(&blob).unwrap(), secret);
    }

    #[test]
    fn nonce_makes_ciphertext_unique() {
        let v = vault();
        let a = v.encrypt("same input");
        let b = v.encrypt("same input");
        assert_ne!(a, b, "fresh nonce per encryption");
        assert_eq!(v.decrypt(&a).unwrap(), v.decrypt(&b).unwrap());
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let v = vault();
        let blob = v.encrypt("plaintext secret");
        let other = TokenVault::from_key([9u8; KEY_LEN]);
        match other.decrypt(&blob) {
            Ok(out) => assert_ne!(out, "plaintext secret"),
            Err(_) => {} // invalid UTF-8 is the common outcome
        }
    }

    #[test]
    fn handles_long_plaintext_across_blocks() {
        let v = vault();
        let long = "x".repeat(1000);
        assert_eq!(v.decrypt(&v.encrypt(&long)).unwrap(), long);
    }

    #[test]
    fn open_generates_and_reloads_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join(".keys/token.key");

        let first = TokenVault::open(&key_path).unwrap();
        let blob = first.encrypt("persisted");
        drop(first);

        let second = TokenVault::open(&key_path).unwrap();
        assert_eq!(second.decrypt(&blob).unwrap(), "persisted");
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("token.key");
        let _ = TokenVault::open(&key_path).unwrap();
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
