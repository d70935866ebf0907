use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use tracing::info;

use crate::models::node::NodePubKey;

const KEY_FILE_HEADER: &str = "\
# Node identity key. Controls this node's identity and reputation on the
# overlay network. It does not hold or protect any funds.
";

/// The node's cryptographic identity: an Ed25519 signing key whose verifying
/// key is the node's public identity on the network.
pub struct NodeKey {
    signing_key: SigningKey,
}

impl NodeKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&bytes),
        }
    }

    /// Read the identity key from `path`, generating and saving a fresh one
    /// if the file does not exist. The file holds a commented hex encoding of
    /// the 32-byte secret.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("failed to read node key file")?;
            let encoded = content
                .lines()
                .find(|line| !line.trim().starts_with('#') && !line.trim().is_empty())
                .context("no key data found in node key file")?;
            let bytes = hex::decode(encoded.trim()).context("failed to decode node key hex")?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("node key must be 32 bytes"))?;
            info!("Using node key file '{}'", path.to_string_lossy());
            return Ok(Self::from_bytes(bytes));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create node key directory")?;
        }
        let key = Self::generate();
        let file_content = format!(
            "{}{}\n",
            KEY_FILE_HEADER,
            hex::encode(key.signing_key.to_bytes())
        );
        fs::write(path, file_content).context("failed to save node key file")?;
        info!("Saved new node key file to '{}'", path.to_string_lossy());
        Ok(key)
    }

    pub fn pub_key(&self) -> NodePubKey {
        NodePubKey::new(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeKey({})", self.pub_key())
    }
}

/// Verify that `signature` is a valid signature by `pub_key` over `message`.
pub fn verify_signature(pub_key: &NodePubKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(pub_key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify_strict(message, &signature).is_ok()
}
