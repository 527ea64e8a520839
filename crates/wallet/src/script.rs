//! Standard transparent script templates.

use fluxd_consensus::constants::MAX_PUBKEYS_PER_MULTISIG;
use fluxd_primitives::{hash160, Destination};
use secp256k1::PublicKey;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptKind {
    PubKey(Vec<u8>),
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    Multisig {
        required: usize,
        pubkeys: Vec<Vec<u8>>,
    },
    NullData,
    NonStandard,
}

pub fn classify(script: &[u8]) -> ScriptKind {
    if let Some(Destination::KeyHash(hash)) = Destination::from_script_pubkey(script) {
        return ScriptKind::PubKeyHash(hash);
    }
    if let Some(Destination::ScriptHash(hash)) = Destination::from_script_pubkey(script) {
        return ScriptKind::ScriptHash(hash);
    }
    if let Some(pubkey) = p2pk_pubkey(script) {
        return ScriptKind::PubKey(pubkey.to_vec());
    }
    if let Some((required, pubkeys)) = parse_multisig(script) {
        return ScriptKind::Multisig { required, pubkeys };
    }
    if script.first() == Some(&OP_RETURN) {
        return ScriptKind::NullData;
    }
    ScriptKind::NonStandard
}

/// The single destination a script pays, if it has one. Bare pubkey outputs
/// resolve to the key hash of their pubkey.
pub fn extract_destination(script: &[u8]) -> Option<Destination> {
    match classify(script) {
        ScriptKind::PubKeyHash(hash) => Some(Destination::KeyHash(hash)),
        ScriptKind::ScriptHash(hash) => Some(Destination::ScriptHash(hash)),
        ScriptKind::PubKey(pubkey) => Some(Destination::KeyHash(hash160(&pubkey))),
        _ => None,
    }
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script, pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2pkh_script_for_pubkey(pubkey: &[u8]) -> Vec<u8> {
    Destination::KeyHash(hash160(pubkey)).script_pubkey()
}

pub fn p2sh_script(redeem_script: &[u8]) -> Vec<u8> {
    Destination::ScriptHash(hash160(redeem_script)).script_pubkey()
}

pub fn multisig_script(required: usize, pubkeys: &[Vec<u8>]) -> Vec<u8> {
    let mut script = Vec::with_capacity(3 + pubkeys.len() * 34);
    script.push(encode_small_int(required));
    for pubkey in pubkeys {
        push_data(&mut script, pubkey);
    }
    script.push(encode_small_int(pubkeys.len()));
    script.push(OP_CHECKMULTISIG);
    script
}

pub fn is_p2sh(script: &[u8]) -> bool {
    matches!(classify(script), ScriptKind::ScriptHash(_))
}

fn p2pk_pubkey(script: &[u8]) -> Option<&[u8]> {
    let (&len, rest) = script.split_first()?;
    let len = len as usize;
    if (len != 33 && len != 65) || rest.len() != len + 1 || rest[len] != OP_CHECKSIG {
        return None;
    }
    let pubkey = &rest[..len];
    let prefix_ok = match len {
        33 => matches!(pubkey[0], 0x02 | 0x03),
        _ => matches!(pubkey[0], 0x04 | 0x06 | 0x07),
    };
    prefix_ok.then_some(pubkey)
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        len @ 0..=75 => script.push(len as u8),
        len @ 76..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

// Callers keep `value` within 0..=16.
fn encode_small_int(value: usize) -> u8 {
    match value {
        1..=16 => OP_1 + (value as u8 - 1),
        _ => OP_0,
    }
}

fn decode_small_int_opcode(opcode: u8) -> Option<usize> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some((opcode - 0x50) as usize),
        _ => None,
    }
}

/// Parses `m <pubkey>... n OP_CHECKMULTISIG`, returning `m` and the keys.
pub fn parse_multisig(script: &[u8]) -> Option<(usize, Vec<Vec<u8>>)> {
    if script.len() < 3 || script.last().copied() != Some(OP_CHECKMULTISIG) {
        return None;
    }
    let n = decode_small_int_opcode(*script.get(script.len().saturating_sub(2))?)?;
    let m = decode_small_int_opcode(*script.first()?)?;
    if m == 0 || n == 0 || m > n || n > MAX_PUBKEYS_PER_MULTISIG {
        return None;
    }

    let mut pubkeys = Vec::with_capacity(n);
    let mut cursor = 1usize;
    let end = script.len().saturating_sub(2);
    while cursor < end {
        let opcode = *script.get(cursor)?;
        let (len, advance) = match opcode {
            len @ 1..=75 => (len as usize, 1usize),
            OP_PUSHDATA1 => (*script.get(cursor + 1)? as usize, 2usize),
            OP_PUSHDATA2 => {
                let bytes: [u8; 2] = script.get(cursor + 1..cursor + 3)?.try_into().ok()?;
                (u16::from_le_bytes(bytes) as usize, 3usize)
            }
            OP_PUSHDATA4 => {
                let bytes: [u8; 4] = script.get(cursor + 1..cursor + 5)?.try_into().ok()?;
                (u32::from_le_bytes(bytes) as usize, 5usize)
            }
            _ => return None,
        };
        cursor = cursor.saturating_add(advance);
        if len != 33 && len != 65 {
            return None;
        }
        let stop = cursor.saturating_add(len);
        if stop > end {
            return None;
        }
        let pubkey = script.get(cursor..stop)?;
        PublicKey::from_slice(pubkey).ok()?;
        pubkeys.push(pubkey.to_vec());
        cursor = stop;
    }
    if cursor != end || pubkeys.len() != n {
        return None;
    }
    Some((m, pubkeys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_pubkey;

    #[test]
    fn classifies_standard_templates() {
        let pubkey = test_pubkey(1);
        assert_eq!(classify(&p2pk_script(&pubkey)), ScriptKind::PubKey(pubkey.clone()));
        assert_eq!(
            classify(&p2pkh_script_for_pubkey(&pubkey)),
            ScriptKind::PubKeyHash(hash160(&pubkey))
        );

        let redeem = multisig_script(1, &[pubkey.clone(), test_pubkey(2)]);
        assert_eq!(
            classify(&redeem),
            ScriptKind::Multisig {
                required: 1,
                pubkeys: vec![pubkey.clone(), test_pubkey(2)],
            }
        );
        assert_eq!(
            classify(&p2sh_script(&redeem)),
            ScriptKind::ScriptHash(hash160(&redeem))
        );
        assert_eq!(classify(&[OP_RETURN, 0x01, 0xff]), ScriptKind::NullData);
        assert_eq!(classify(&[0x51]), ScriptKind::NonStandard);
    }

    #[test]
    fn p2pk_extracts_key_hash_destination() {
        let pubkey = test_pubkey(3);
        assert_eq!(
            extract_destination(&p2pk_script(&pubkey)),
            Some(Destination::KeyHash(hash160(&pubkey)))
        );
        let redeem = multisig_script(2, &[test_pubkey(1), test_pubkey(2)]);
        assert_eq!(extract_destination(&redeem), None);
    }

    #[test]
    fn multisig_parse_rejects_bad_counts() {
        let keys = vec![test_pubkey(1), test_pubkey(2)];
        let mut script = multisig_script(2, &keys);
        assert_eq!(parse_multisig(&script).map(|(m, _)| m), Some(2));

        // n says three keys, only two pushed.
        let len = script.len();
        script[len - 2] = OP_1 + 2;
        assert_eq!(parse_multisig(&script), None);

        let script = multisig_script(3, &keys);
        assert_eq!(parse_multisig(&script), None);
    }
}
