// =============================================================================
// FEDERATION NODE — keystore.rs
// =============================================================================
//
// Per-node keypair on disk:
//   <base>/security/<endpoint>       private key, PKCS#8 PEM
//   <base>/security/<endpoint>.pub   public key, SPKI PEM
// =============================================================================

use crate::constants::SECURITY_DIR;
use crate::error::{FederationError, FederationResult};
use crate::node::Node;
use crate::signature::sign_payload;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};

/// Parse an SPKI or PKCS#1 public key.
pub fn load_public_key(pem: &[u8]) -> FederationResult<RsaPublicKey> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| FederationError::KeyFormat("public key is not UTF-8".into()))?
        .trim();
    RsaPublicKey::from_public_key_pem(text)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(text))
        .map_err(|e| FederationError::KeyFormat(e.to_string()))
}

pub fn parse_private_key(pem: &str) -> Option<RsaPrivateKey> {
    let text = pem.trim();
    RsaPrivateKey::from_pkcs8_pem(text)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(text))
        .ok()
}

pub fn public_pem(key: &RsaPrivateKey) -> FederationResult<String> {
    key.to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| FederationError::KeyFormat(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    security_dir: PathBuf,
    key_bits: usize,
}

impl KeyStore {
    pub fn new(base_dir: &Path, key_bits: usize) -> Self {
        KeyStore {
            security_dir: base_dir.join(SECURITY_DIR),
            key_bits,
        }
    }

    pub fn private_key_path(&self, node: &Node) -> PathBuf {
        self.security_dir.join(&node.public_endpoint)
    }

    pub fn public_key_path(&self, node: &Node) -> PathBuf {
        self.security_dir.join(format!("{}.pub", node.public_endpoint))
    }

    /// `None` when the file is missing or unparseable.
    pub fn load_private_key(&self, node: &Node) -> Option<RsaPrivateKey> {
        let path = self.private_key_path(node);
        let pem = match std::fs::read_to_string(&path) {
            Ok(pem) => pem,
            Err(e) => {
                log::debug!("no private key at {}: {}", path.display(), e);
                return None;
            }
        };
        let key = parse_private_key(&pem);
        if key.is_none() {
            log::warn!("⚠️ unparseable private key at {}", path.display());
        }
        key
    }

    pub fn read_public_pem(&self, node: &Node) -> Option<String> {
        std::fs::read_to_string(self.public_key_path(node)).ok()
    }

    /// Load or generate the node's keypair and return the public PEM.
    pub fn ensure_keypair(&self, node: &Node) -> FederationResult<String> {
        if let Some(key) = self.load_private_key(node) {
            let pem = public_pem(&key)?;
            if self.read_public_pem(node).as_deref() != Some(pem.as_str()) {
                std::fs::write(self.public_key_path(node), &pem)?;
            }
            return Ok(pem);
        }

        log::info!(
            "🔑 generating {}-bit keypair for [{}]",
            self.key_bits,
            node.hostname
        );
        std::fs::create_dir_all(&self.security_dir)?;
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), self.key_bits)
            .map_err(|e| FederationError::Internal(format!("key generation: {}", e)))?;
        let private = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| FederationError::KeyFormat(e.to_string()))?;
        let pem = public_pem(&key)?;

        let private_path = self.private_key_path(node);
        std::fs::write(&private_path, private.as_bytes())?;
        restrict_permissions(&private_path)?;
        std::fs::write(self.public_key_path(node), &pem)?;
        Ok(pem)
    }

    /// Sign with the node's private key; `None` when the key is unavailable.
    pub fn sign(&self, node: &Node, payload: &[u8]) -> Option<String> {
        let key = self.load_private_key(node)?;
        match sign_payload(&key, payload) {
            Ok(sig) => Some(sig),
            Err(e) => {
                log::warn!("⚠️ signing as [{}] failed: {}", node.hostname, e);
                None
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> FederationResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> FederationResult<()> {
    Ok(())
}
