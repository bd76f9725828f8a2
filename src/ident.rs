//! The protocol identity: a long-lived P-256 keypair, distinct from any
//! Bitcoin key the peer may also control. `NodeId` is the public half,
//! encoded for the wire; `Credential` holds the private half and signs.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use ecdsa::signature::hazmat::{PrehashVerifier, RandomizedPrehashSigner};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;

pub const OC_ID_PREFIX: char = 'c';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub enum CredentialError {
    Io(io::Error),
    KeyMalformed(String),
    BadIdSig,
    UnknownPrefix(char),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CredentialError::Io(e) => write!(f, "i/o error accessing identity file: {}", e),
            CredentialError::KeyMalformed(s) => write!(f, "malformed private key: {}", s),
            CredentialError::BadIdSig => write!(f, "signature does not verify against id"),
            CredentialError::UnknownPrefix(c) => write!(f, "unknown identity prefix '{}'", c),
        }
    }
}

impl std::error::Error for CredentialError {}

impl From<io::Error> for CredentialError {
    fn from(e: io::Error) -> Self {
        CredentialError::Io(e)
    }
}

/// Encode an uncompressed P-256 public key as `c<hex-X>,<hex-Y>`.
fn encode_node_id(vk: &VerifyingKey) -> NodeId {
    let point = vk.to_encoded_point(false);
    let x = point.x().expect("uncompressed point always has x");
    let y = point.y().expect("uncompressed point always has y");
    NodeId(format!(
        "{}{},{}",
        OC_ID_PREFIX,
        hex::encode(x),
        hex::encode(y)
    ))
}

/// Parse a `c<hex-X>,<hex-Y>` node id back into a verifying key.
pub fn decode_node_id(id: &str) -> Result<VerifyingKey, CredentialError> {
    let mut chars = id.chars();
    let prefix = chars
        .next()
        .ok_or_else(|| CredentialError::KeyMalformed("empty id".into()))?;
    if prefix != OC_ID_PREFIX {
        return Err(CredentialError::UnknownPrefix(prefix));
    }
    let rest = chars.as_str();
    let (x_hex, y_hex) = rest
        .split_once(',')
        .ok_or_else(|| CredentialError::KeyMalformed("missing ',' in id".into()))?;
    let x = hex::decode(x_hex).map_err(|e| CredentialError::KeyMalformed(e.to_string()))?;
    let y = hex::decode(y_hex).map_err(|e| CredentialError::KeyMalformed(e.to_string()))?;
    let mut sec1 = Vec::with_capacity(1 + x.len() + y.len());
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    VerifyingKey::from_sec1_bytes(&sec1)
        .map_err(|e| CredentialError::KeyMalformed(e.to_string()))
}

/// Encode an ECDSA signature as `<hex-r>,<hex-s>`.
pub fn encode_sig(sig: &Signature) -> String {
    let bytes = sig.to_bytes();
    let (r, s) = bytes.split_at(bytes.len() / 2);
    format!("{},{}", hex::encode(r), hex::encode(s))
}

pub fn decode_sig(s: &str) -> Result<Signature, CredentialError> {
    let (r_hex, s_hex) = s
        .split_once(',')
        .ok_or_else(|| CredentialError::KeyMalformed("missing ',' in sig".into()))?;
    let r = hex::decode(r_hex).map_err(|e| CredentialError::KeyMalformed(e.to_string()))?;
    let s_part = hex::decode(s_hex).map_err(|e| CredentialError::KeyMalformed(e.to_string()))?;
    let mut buf = Vec::with_capacity(r.len() + s_part.len());
    buf.extend_from_slice(&r);
    buf.extend_from_slice(&s_part);
    Signature::from_slice(&buf).map_err(|e| CredentialError::KeyMalformed(e.to_string()))
}

/// The process's long-lived identity: a P-256 keypair held in memory and
/// persisted to disk as a hex-encoded scalar.
pub struct Credential {
    signing_key: SigningKey,
    node_id: NodeId,
}

impl Credential {
    /// Load the private key at `path` if it exists, otherwise generate a
    /// fresh one and persist it with mode `0600`.
    pub fn init_or_load(path: &Path) -> Result<Credential, CredentialError> {
        if path.exists() {
            Self::load(path)
        } else {
            let cred = Self::generate();
            cred.store(path)?;
            Ok(cred)
        }
    }

    fn generate() -> Credential {
        let signing_key = SigningKey::random(&mut OsRng);
        let node_id = encode_node_id(signing_key.verifying_key());
        Credential {
            signing_key,
            node_id,
        }
    }

    fn load(path: &Path) -> Result<Credential, CredentialError> {
        let hex_scalar = fs::read_to_string(path)?;
        let bytes = hex::decode(hex_scalar.trim())
            .map_err(|e| CredentialError::KeyMalformed(e.to_string()))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| CredentialError::KeyMalformed(e.to_string()))?;
        let node_id = encode_node_id(signing_key.verifying_key());
        Ok(Credential {
            signing_key,
            node_id,
        })
    }

    fn store(&self, path: &Path) -> Result<(), CredentialError> {
        let hex_scalar = hex::encode(self.signing_key.to_bytes());
        crate::datadir::write_file_0600(path, hex_scalar.as_bytes())?;
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sign a pre-hashed (SHA-256) digest, drawing `k` from a CSPRNG rather
    /// than deterministically (RFC6979), per the protocol's requirement.
    pub fn sign_prehash(&self, digest: &[u8; 32]) -> Signature {
        self.signing_key
            .sign_prehash_with_rng(&mut OsRng, digest)
            .expect("prehash is exactly 32 bytes, signing cannot fail")
    }

    pub fn sign_prehash_encoded(&self, digest: &[u8; 32]) -> String {
        encode_sig(&self.sign_prehash(digest))
    }
}

/// Verify an encoded `(id, sig)` pair against a pre-hashed digest.
pub fn verify_prehash(id: &str, sig: &str, digest: &[u8; 32]) -> Result<bool, CredentialError> {
    let vk = decode_node_id(id)?;
    let signature = decode_sig(sig)?;
    Ok(vk.verify_prehash(digest, &signature).is_ok())
}
