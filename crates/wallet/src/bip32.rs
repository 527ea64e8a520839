//! BIP32 extended keys.

use fluxd_consensus::{chain_params, Network};
use fluxd_primitives::{base58check_decode, base58check_encode, hash160};
use ring::hmac::{self, Context, Key};
use secp256k1::{PublicKey, Scalar, SecretKey};
use zeroize::Zeroize;

use crate::error::WalletError;
use crate::keys::{secp, HARDENED};

const SERIALIZED_LEN: usize = 78;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtendedPrivKey {
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    pub secret: SecretKey,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExtendedPubKey {
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
    pub chain_code: [u8; 32],
    pub public_key: PublicKey,
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> [u8; 64] {
    let signing_key = Key::new(hmac::HMAC_SHA512, key);
    let mut ctx = Context::with_key(&signing_key);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(ctx.sign().as_ref());
    out
}

fn split_tag(mut tag: [u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&tag[..32]);
    right.copy_from_slice(&tag[32..]);
    tag.zeroize();
    (left, right)
}

fn invalid_child() -> WalletError {
    WalletError::InvalidData("invalid BIP32 child key")
}

fn fingerprint_of(public_key: &PublicKey) -> [u8; 4] {
    let id = hash160(&public_key.serialize());
    [id[0], id[1], id[2], id[3]]
}

impl ExtendedPrivKey {
    pub fn from_seed(seed: &[u8]) -> Result<Self, WalletError> {
        let (mut key, chain_code) = split_tag(hmac_sha512(b"Bitcoin seed", &[seed]));
        let secret = SecretKey::from_slice(&key).map_err(|_| invalid_child());
        key.zeroize();
        Ok(Self {
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
            chain_code,
            secret: secret?,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(secp(), &self.secret)
    }

    pub fn fingerprint(&self) -> [u8; 4] {
        fingerprint_of(&self.public_key())
    }

    pub fn to_public(&self) -> ExtendedPubKey {
        ExtendedPubKey {
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
            chain_code: self.chain_code,
            public_key: self.public_key(),
        }
    }

    pub fn derive_child(&self, index: u32) -> Result<Self, WalletError> {
        let index_bytes = index.to_be_bytes();
        let tag = if index & HARDENED != 0 {
            hmac_sha512(
                &self.chain_code,
                &[&[0u8], &self.secret.secret_bytes(), &index_bytes],
            )
        } else {
            hmac_sha512(
                &self.chain_code,
                &[&self.public_key().serialize(), &index_bytes],
            )
        };
        let (mut tweak, chain_code) = split_tag(tag);
        let scalar = Scalar::from_be_bytes(tweak).map_err(|_| invalid_child());
        tweak.zeroize();
        let secret = self
            .secret
            .add_tweak(&scalar?)
            .map_err(|_| invalid_child())?;
        Ok(Self {
            depth: self.depth.checked_add(1).ok_or_else(invalid_child)?,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
            chain_code,
            secret,
        })
    }

    pub fn derive_path(&self, path: &[u32]) -> Result<Self, WalletError> {
        let mut key = self.clone();
        for index in path {
            key = key.derive_child(*index)?;
        }
        Ok(key)
    }

    pub fn encode(&self, network: Network) -> String {
        let mut key = [0u8; 33];
        key[1..].copy_from_slice(&self.secret.secret_bytes());
        let out = serialize(
            chain_params(network).base58.ext_secret_key,
            self.depth,
            self.parent_fingerprint,
            self.child_number,
            &self.chain_code,
            &key,
        );
        key.zeroize();
        out
    }

    pub fn decode(input: &str, network: Network) -> Option<Self> {
        let mut payload = base58check_decode(input).ok()?;
        let parsed = parse(&payload, chain_params(network).base58.ext_secret_key).and_then(
            |(depth, parent_fingerprint, child_number, chain_code, key)| {
                if key[0] != 0 {
                    return None;
                }
                let secret = SecretKey::from_slice(&key[1..]).ok()?;
                Some(Self {
                    depth,
                    parent_fingerprint,
                    child_number,
                    chain_code,
                    secret,
                })
            },
        );
        payload.zeroize();
        parsed
    }
}

impl ExtendedPubKey {
    pub fn fingerprint(&self) -> [u8; 4] {
        fingerprint_of(&self.public_key)
    }

    /// Non-hardened child derivation; hardened indexes are rejected.
    pub fn derive_child(&self, index: u32) -> Result<Self, WalletError> {
        if index & HARDENED != 0 {
            return Err(WalletError::InvalidData(
                "hardened derivation requires a private key",
            ));
        }
        let tag = hmac_sha512(
            &self.chain_code,
            &[&self.public_key.serialize(), &index.to_be_bytes()],
        );
        let (tweak, chain_code) = split_tag(tag);
        let scalar = Scalar::from_be_bytes(tweak).map_err(|_| invalid_child())?;
        let public_key = self
            .public_key
            .add_exp_tweak(secp(), &scalar)
            .map_err(|_| invalid_child())?;
        Ok(Self {
            depth: self.depth.checked_add(1).ok_or_else(invalid_child)?,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
            chain_code,
            public_key,
        })
    }

    pub fn derive_path(&self, path: &[u32]) -> Result<Self, WalletError> {
        let mut key = self.clone();
        for index in path {
            key = key.derive_child(*index)?;
        }
        Ok(key)
    }

    pub fn encode(&self, network: Network) -> String {
        serialize(
            chain_params(network).base58.ext_public_key,
            self.depth,
            self.parent_fingerprint,
            self.child_number,
            &self.chain_code,
            &self.public_key.serialize(),
        )
    }

    pub fn decode(input: &str, network: Network) -> Option<Self> {
        let payload = base58check_decode(input).ok()?;
        let (depth, parent_fingerprint, child_number, chain_code, key) =
            parse(&payload, chain_params(network).base58.ext_public_key)?;
        let public_key = PublicKey::from_slice(&key).ok()?;
        Some(Self {
            depth,
            parent_fingerprint,
            child_number,
            chain_code,
            public_key,
        })
    }
}

fn serialize(
    version: [u8; 4],
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_number: u32,
    chain_code: &[u8; 32],
    key: &[u8; 33],
) -> String {
    let mut payload = Vec::with_capacity(SERIALIZED_LEN);
    payload.extend_from_slice(&version);
    payload.push(depth);
    payload.extend_from_slice(&parent_fingerprint);
    payload.extend_from_slice(&child_number.to_be_bytes());
    payload.extend_from_slice(chain_code);
    payload.extend_from_slice(key);
    let out = base58check_encode(&payload);
    payload.zeroize();
    out
}

type Parsed = (u8, [u8; 4], u32, [u8; 32], [u8; 33]);

fn parse(payload: &[u8], version: [u8; 4]) -> Option<Parsed> {
    if payload.len() != SERIALIZED_LEN || payload[..4] != version {
        return None;
    }
    let depth = payload[4];
    let parent_fingerprint: [u8; 4] = payload[5..9].try_into().ok()?;
    let child_number = u32::from_be_bytes(payload[9..13].try_into().ok()?);
    let chain_code: [u8; 32] = payload[13..45].try_into().ok()?;
    let key: [u8; 33] = payload[45..78].try_into().ok()?;
    if depth == 0 && (parent_fingerprint != [0u8; 4] || child_number != 0) {
        return None;
    }
    Some((depth, parent_fingerprint, child_number, chain_code, key))
}

/// One path step: `7`, `7'` or `7h`.
pub fn parse_path_index(step: &str) -> Option<u32> {
    let (digits, hardened) = match step.strip_suffix(['\'', 'h']) {
        Some(digits) => (digits, true),
        None => (step, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    if index & HARDENED != 0 {
        return None;
    }
    Some(if hardened { index | HARDENED } else { index })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn master_key_matches_reference_vector() {
        let seed = hex::decode(SEED).expect("seed");
        let master = ExtendedPrivKey::from_seed(&seed).expect("master");
        assert_eq!(
            master.encode(Network::Mainnet),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LAF2kkT8bFYwXLpYDhmBmeEsmwn7vs5MX5"
        );
        assert_eq!(
            master.to_public().encode(Network::Mainnet),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
    }

    #[test]
    fn hardened_then_public_derivation() {
        let seed = hex::decode(SEED).expect("seed");
        let master = ExtendedPrivKey::from_seed(&seed).expect("master");
        let child = master.derive_child(HARDENED).expect("m/0'");
        assert_eq!(
            child.to_public().encode(Network::Mainnet),
            "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw"
        );
        let from_private = child.derive_child(1).expect("priv m/0'/1").to_public();
        let from_public = child.to_public().derive_child(1).expect("pub m/0'/1");
        assert_eq!(from_private, from_public);
        assert_eq!(
            from_public.encode(Network::Mainnet),
            "xpub6ASuArnXKPbfEwhqN6e3mwBcDTgzisQN1wXN9BJcM47sSikHjJf3UFHKkNAWbWMiGj7Wf5uMash7SyYq527Hqck2AxYysAA7xmALppuCkwQ"
        );
        assert!(child.to_public().derive_child(HARDENED).is_err());
    }

    #[test]
    fn decode_checks_network_version() {
        let seed = hex::decode(SEED).expect("seed");
        let master = ExtendedPrivKey::from_seed(&seed).expect("master");
        let encoded = master.encode(Network::Testnet);
        assert!(encoded.starts_with("tprv"));
        assert_eq!(ExtendedPrivKey::decode(&encoded, Network::Testnet), Some(master.clone()));
        assert_eq!(ExtendedPrivKey::decode(&encoded, Network::Mainnet), None);
        let xpub = master.to_public().encode(Network::Regtest);
        assert!(ExtendedPubKey::decode(&xpub, Network::Regtest).is_some());
        assert!(ExtendedPrivKey::decode(&xpub, Network::Regtest).is_none());
    }

    #[test]
    fn path_steps() {
        assert_eq!(parse_path_index("0"), Some(0));
        assert_eq!(parse_path_index("44'"), Some(44 | HARDENED));
        assert_eq!(parse_path_index("1h"), Some(1 | HARDENED));
        assert_eq!(parse_path_index("2147483648"), None);
        assert_eq!(parse_path_index("x"), None);
        assert_eq!(parse_path_index("'"), None);
    }
}
