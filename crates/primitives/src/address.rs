//! Base58check destinations, WIF secrets and extended-key payloads.

use fluxd_consensus::{chain_params, Network};

use crate::hash::sha256d;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    InvalidLength,
    InvalidCharacter,
    InvalidChecksum,
    UnknownPrefix,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidLength => write!(f, "invalid base58 payload length"),
            AddressError::InvalidCharacter => write!(f, "invalid base58 character"),
            AddressError::InvalidChecksum => write!(f, "invalid base58 checksum"),
            AddressError::UnknownPrefix => write!(f, "unknown base58 version prefix"),
        }
    }
}

impl std::error::Error for AddressError {}

/// A transparent payment target, identified by the hash it commits to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Destination {
    KeyHash([u8; 20]),
    ScriptHash([u8; 20]),
}

impl Destination {
    pub fn script_pubkey(&self) -> Vec<u8> {
        match self {
            Destination::KeyHash(hash) => p2pkh_script(hash),
            Destination::ScriptHash(hash) => p2sh_script(hash),
        }
    }

    /// The destination paid by a P2PKH or P2SH output script.
    pub fn from_script_pubkey(script: &[u8]) -> Option<Self> {
        if is_p2pkh(script) {
            let hash: [u8; 20] = script[3..23].try_into().ok()?;
            return Some(Destination::KeyHash(hash));
        }
        if is_p2sh(script) {
            let hash: [u8; 20] = script[2..22].try_into().ok()?;
            return Some(Destination::ScriptHash(hash));
        }
        None
    }

    pub fn encode(&self, network: Network) -> String {
        let prefixes = chain_params(network).base58;
        let (prefix, hash) = match self {
            Destination::KeyHash(hash) => (prefixes.pubkey_address, hash),
            Destination::ScriptHash(hash) => (prefixes.script_address, hash),
        };
        let mut payload = Vec::with_capacity(prefix.len() + hash.len());
        payload.extend_from_slice(prefix);
        payload.extend_from_slice(hash);
        base58check_encode(&payload)
    }

    pub fn decode(address: &str, network: Network) -> Result<Self, AddressError> {
        let payload = base58check_decode(address)?;
        let prefixes = chain_params(network).base58;
        let hash_of = |prefix: &[u8]| -> Result<[u8; 20], AddressError> {
            payload[prefix.len()..]
                .try_into()
                .map_err(|_| AddressError::InvalidLength)
        };
        if payload.starts_with(prefixes.pubkey_address) {
            return Ok(Destination::KeyHash(hash_of(prefixes.pubkey_address)?));
        }
        if payload.starts_with(prefixes.script_address) {
            return Ok(Destination::ScriptHash(hash_of(prefixes.script_address)?));
        }
        Err(AddressError::UnknownPrefix)
    }
}

pub fn secret_key_to_wif(secret: &[u8; 32], network: Network, compressed: bool) -> String {
    let prefix = chain_params(network).base58.secret_key;
    let mut payload = Vec::with_capacity(1 + secret.len() + usize::from(compressed));
    payload.push(prefix);
    payload.extend_from_slice(secret);
    if compressed {
        payload.push(0x01);
    }
    base58check_encode(&payload)
}

pub fn wif_to_secret_key(wif: &str, network: Network) -> Result<([u8; 32], bool), AddressError> {
    let payload = base58check_decode(wif)?;
    if payload.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    if payload[0] != chain_params(network).base58.secret_key {
        return Err(AddressError::UnknownPrefix);
    }

    let compressed = match payload.len() {
        33 => false,
        34 if payload[33] == 0x01 => true,
        _ => return Err(AddressError::InvalidLength),
    };
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&payload[1..33]);
    Ok((secret, compressed))
}

fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    const OP_DUP: u8 = 0x76;
    const OP_HASH160: u8 = 0xa9;
    const OP_EQUALVERIFY: u8 = 0x88;
    const OP_CHECKSIG: u8 = 0xac;

    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    const OP_HASH160: u8 = 0xa9;
    const OP_EQUAL: u8 = 0x87;

    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == 0x76
        && script[1] == 0xa9
        && script[2] == 0x14
        && script[23] == 0x88
        && script[24] == 0xac
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == 0xa9 && script[1] == 0x14 && script[22] == 0x87
}

pub fn base58check_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let bytes = base58_decode(input)?;
    if bytes.len() < 4 {
        return Err(AddressError::InvalidLength);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 4);
    let digest = sha256d(payload);
    if checksum != &digest[..4] {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

pub fn base58check_encode(payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    let checksum = sha256d(payload);
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    if input.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    let mut bytes = Vec::new();
    for ch in input.bytes() {
        let mut carry = BASE58_ALPHABET
            .iter()
            .position(|value| *value == ch)
            .ok_or(AddressError::InvalidCharacter)? as u32;
        for byte in bytes.iter_mut().rev() {
            let val = (*byte as u32) * 58 + carry;
            *byte = (val & 0xff) as u8;
            carry = val >> 8;
        }
        while carry > 0 {
            bytes.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let leading_zeros = input.bytes().take_while(|b| *b == b'1').count();
    let mut out = vec![0u8; leading_zeros];
    out.extend_from_slice(&bytes);
    Ok(out)
}

fn base58_encode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut digits = vec![0u8];
    for byte in data {
        let mut carry = *byte as u32;
        for digit in digits.iter_mut().rev() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 58) as u8;
            carry = value / 58;
        }
        while carry > 0 {
            digits.insert(0, (carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|b| **b == 0u8).count();
    let mut out = "1".repeat(leading_zeros);
    out.extend(digits.iter().map(|digit| BASE58_ALPHABET[*digit as usize] as char));
    out
}
