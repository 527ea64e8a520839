use std::fmt;
use std::sync::OnceLock;

use fluxd_consensus::Network;
use fluxd_primitives::{hash160, secret_key_to_wif, wif_to_secret_key, Destination};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use zeroize::Zeroize;

use crate::error::WalletError;

/// Hash160 of a serialized public key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct KeyId(pub [u8; 20]);

impl KeyId {
    pub fn of_pubkey(pubkey: &[u8]) -> Self {
        KeyId(hash160(pubkey))
    }

    pub fn destination(&self) -> Destination {
        Destination::KeyHash(self.0)
    }
}

/// Hash160 of a redeem script.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ScriptId(pub [u8; 20]);

impl ScriptId {
    pub fn of_script(script: &[u8]) -> Self {
        ScriptId(hash160(script))
    }

    pub fn destination(&self) -> Destination {
        Destination::ScriptHash(self.0)
    }
}

/// A decoded private key. The bytes are wiped when the value is dropped.
#[derive(Clone, Eq, PartialEq)]
pub struct Secret {
    bytes: [u8; 32],
    compressed: bool,
}

impl Secret {
    pub fn new(bytes: [u8; 32], compressed: bool) -> Result<Self, WalletError> {
        SecretKey::from_slice(&bytes).map_err(|_| WalletError::InvalidData("invalid secret key"))?;
        Ok(Self { bytes, compressed })
    }

    pub fn from_wif(wif: &str, network: Network) -> Option<Self> {
        let (mut bytes, compressed) = wif_to_secret_key(wif.trim(), network).ok()?;
        let secret = Self::new(bytes, compressed).ok();
        bytes.zeroize();
        secret
    }

    pub fn to_wif(&self, network: Network) -> String {
        secret_key_to_wif(&self.bytes, network, self.compressed)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn secret_key(&self) -> Result<SecretKey, WalletError> {
        SecretKey::from_slice(&self.bytes).map_err(|_| WalletError::InvalidData("invalid secret key"))
    }

    pub fn pubkey_bytes(&self) -> Result<Vec<u8>, WalletError> {
        let pubkey = PublicKey::from_secret_key(secp(), &self.secret_key()?);
        Ok(serialize_pubkey(&pubkey, self.compressed))
    }

    pub fn key_id(&self) -> Result<KeyId, WalletError> {
        Ok(KeyId::of_pubkey(&self.pubkey_bytes()?))
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("compressed", &self.compressed)
            .finish_non_exhaustive()
    }
}

/// BIP32 origin of a key: master fingerprint plus derivation path.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyOrigin {
    pub fingerprint: [u8; 4],
    pub path: Vec<u32>,
}

impl KeyOrigin {
    pub fn format_path(&self) -> String {
        format_key_path(&self.path)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyMetadata {
    /// Creation time in unix seconds; `0` means unknown.
    pub create_time: i64,
    pub hd_keypath: Option<String>,
    pub hd_seed_id: Option<KeyId>,
    pub origin: Option<KeyOrigin>,
}

impl KeyMetadata {
    pub fn with_time(create_time: i64) -> Self {
        Self {
            create_time,
            ..Self::default()
        }
    }
}

/// A key known to the wallet. Without a secret it is a watch-only pubkey.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyRecord {
    pub pubkey: Vec<u8>,
    pub secret: Option<Secret>,
    pub meta: KeyMetadata,
}

impl KeyRecord {
    pub fn from_secret(secret: Secret, meta: KeyMetadata) -> Result<Self, WalletError> {
        Ok(Self {
            pubkey: secret.pubkey_bytes()?,
            secret: Some(secret),
            meta,
        })
    }

    pub fn watch_only(pubkey: Vec<u8>, meta: KeyMetadata) -> Self {
        Self {
            pubkey,
            secret: None,
            meta,
        }
    }

    pub fn id(&self) -> KeyId {
        KeyId::of_pubkey(&self.pubkey)
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }
}

pub const HARDENED: u32 = 0x8000_0000;

/// Formats a derivation path as `m/0'/1`.
pub fn format_key_path(path: &[u32]) -> String {
    let mut out = String::from("m");
    for index in path {
        out.push('/');
        if index & HARDENED != 0 {
            out.push_str(&(index & !HARDENED).to_string());
            out.push('\'');
        } else {
            out.push_str(&index.to_string());
        }
    }
    out
}

/// Accepts 33/65 byte keys that lie on the curve.
pub fn parse_pubkey(bytes: &[u8]) -> Option<PublicKey> {
    if bytes.len() != 33 && bytes.len() != 65 {
        return None;
    }
    PublicKey::from_slice(bytes).ok()
}

pub fn serialize_pubkey(pubkey: &PublicKey, compressed: bool) -> Vec<u8> {
    if compressed {
        pubkey.serialize().to_vec()
    } else {
        pubkey.serialize_uncompressed().to_vec()
    }
}

/// Non-empty even-length hex, as accepted for scripts and pubkeys.
pub fn parse_hex(input: &str) -> Option<Vec<u8>> {
    if input.is_empty() {
        return None;
    }
    hex::decode(input).ok()
}

pub(crate) fn secp() -> &'static Secp256k1<secp256k1::All> {
    static SECP: OnceLock<Secp256k1<secp256k1::All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}
