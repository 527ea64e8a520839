//! Output descriptors for transparent scripts.
//!
//! Supported forms: `pk`, `pkh`, `combo`, `multi`, `sortedmulti`, `sh` around
//! the key forms, `addr` and `raw`. A `#checksum` suffix is mandatory.

use std::fmt;

use fluxd_consensus::constants::{MAX_PUBKEYS_PER_MULTISIG, MAX_SCRIPT_ELEMENT_SIZE};
use fluxd_consensus::Network;
use fluxd_primitives::{hash160, Destination};

use crate::bip32::{parse_path_index, ExtendedPrivKey, ExtendedPubKey};
use crate::keys::{parse_hex, parse_pubkey, KeyOrigin, Secret, HARDENED};
use crate::script::{multisig_script, p2pk_script, p2pkh_script_for_pubkey, p2sh_script};

const INPUT_CHARSET: &[u8] =
    b"0123456789()[],'/*abcdefgh@:$%{}IJKLMNOPQRSTUVWXYZ&+-.;<=>?!^_|~ijklmnopqrstuvwxyzABCDEFGH`#\"\\ ";
const CHECKSUM_CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const CHECKSUM_LEN: usize = 8;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DescriptorError(pub String);

impl DescriptorError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DescriptorError {}

fn poly_mod(c: u64, val: u64) -> u64 {
    let c0 = c >> 35;
    let mut c = ((c & 0x7_ffff_ffff) << 5) ^ val;
    if c0 & 1 != 0 {
        c ^= 0xf5_dee5_1989;
    }
    if c0 & 2 != 0 {
        c ^= 0xa9_fdca_3312;
    }
    if c0 & 4 != 0 {
        c ^= 0x1b_b80d_e5e7;
    }
    if c0 & 8 != 0 {
        c ^= 0x37_06b1_677a;
    }
    if c0 & 16 != 0 {
        c ^= 0x64_4d62_6ffd;
    }
    c
}

/// The eight-character checksum of `desc`, or `None` if it holds a character
/// outside the descriptor charset.
pub fn descriptor_checksum(desc: &str) -> Option<String> {
    let mut c = 1u64;
    let mut cls = 0u64;
    let mut cls_count = 0;
    for ch in desc.bytes() {
        let pos = INPUT_CHARSET.iter().position(|&b| b == ch)? as u64;
        c = poly_mod(c, pos & 31);
        cls = cls * 3 + (pos >> 5);
        cls_count += 1;
        if cls_count == 3 {
            c = poly_mod(c, cls);
            cls = 0;
            cls_count = 0;
        }
    }
    if cls_count > 0 {
        c = poly_mod(c, cls);
    }
    for _ in 0..CHECKSUM_LEN {
        c = poly_mod(c, 0);
    }
    c ^= 1;
    let mut out = String::with_capacity(CHECKSUM_LEN);
    for j in 0..CHECKSUM_LEN {
        out.push(CHECKSUM_CHARSET[((c >> (5 * (7 - j))) & 31) as usize] as char);
    }
    Some(out)
}

pub fn add_checksum(desc: &str) -> Option<String> {
    descriptor_checksum(desc).map(|checksum| format!("{desc}#{checksum}"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DeriveRange {
    None,
    Unhardened,
    Hardened,
}

#[derive(Clone, Debug)]
enum KeyKind {
    Const {
        pubkey: Vec<u8>,
        secret: Option<Secret>,
    },
    Public {
        key: ExtendedPubKey,
        path: Vec<u32>,
        range: DeriveRange,
    },
    Private {
        key: ExtendedPrivKey,
        path: Vec<u32>,
        range: DeriveRange,
    },
}

#[derive(Clone, Debug)]
struct KeyExpr {
    origin: Option<KeyOrigin>,
    kind: KeyKind,
}

struct ResolvedKey {
    pubkey: Vec<u8>,
    secret: Option<Secret>,
    origin: KeyOrigin,
}

impl KeyExpr {
    fn is_range(&self) -> bool {
        match &self.kind {
            KeyKind::Const { .. } => false,
            KeyKind::Public { range, .. } | KeyKind::Private { range, .. } => {
                *range != DeriveRange::None
            }
        }
    }

    fn resolve(&self, pos: u32) -> Result<ResolvedKey, DescriptorError> {
        let derive_err = |err: crate::error::WalletError| DescriptorError::new(err.to_string());
        let (pubkey, secret, fingerprint, mut path) = match &self.kind {
            KeyKind::Const { pubkey, secret } => {
                let id = hash160(pubkey);
                (
                    pubkey.clone(),
                    secret.clone(),
                    [id[0], id[1], id[2], id[3]],
                    Vec::new(),
                )
            }
            KeyKind::Public { key, path, range } => {
                let full = full_path(path, *range, pos);
                let child = key.derive_path(&full).map_err(derive_err)?;
                (
                    child.public_key.serialize().to_vec(),
                    None,
                    key.fingerprint(),
                    full,
                )
            }
            KeyKind::Private { key, path, range } => {
                let full = full_path(path, *range, pos);
                let child = key.derive_path(&full).map_err(derive_err)?;
                let secret = Secret::new(child.secret.secret_bytes(), true).map_err(derive_err)?;
                (
                    child.public_key().serialize().to_vec(),
                    Some(secret),
                    key.fingerprint(),
                    full,
                )
            }
        };
        let origin = match &self.origin {
            Some(prefix) => {
                let mut full = prefix.path.clone();
                full.append(&mut path);
                KeyOrigin {
                    fingerprint: prefix.fingerprint,
                    path: full,
                }
            }
            None => KeyOrigin { fingerprint, path },
        };
        Ok(ResolvedKey {
            pubkey,
            secret,
            origin,
        })
    }
}

fn full_path(path: &[u32], range: DeriveRange, pos: u32) -> Vec<u32> {
    let mut full = path.to_vec();
    match range {
        DeriveRange::None => {}
        DeriveRange::Unhardened => full.push(pos),
        DeriveRange::Hardened => full.push(pos | HARDENED),
    }
    full
}

#[derive(Clone, Debug)]
enum Node {
    Pk(KeyExpr),
    Pkh(KeyExpr),
    Combo(KeyExpr),
    Multi {
        required: usize,
        keys: Vec<KeyExpr>,
        sorted: bool,
    },
    Sh(Box<Node>),
    Addr(Vec<u8>),
    Raw(Vec<u8>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Context {
    Top,
    P2sh,
}

/// Everything one position of a descriptor implies.
#[derive(Clone, Debug, Default)]
pub struct Expansion {
    /// Output scripts, in descriptor order.
    pub scripts: Vec<Vec<u8>>,
    pub pubkeys: Vec<Vec<u8>>,
    pub redeem_scripts: Vec<Vec<u8>>,
    pub origins: Vec<(Vec<u8>, KeyOrigin)>,
    pub secrets: Vec<Secret>,
}

impl Expansion {
    fn add_key(&mut self, key: &ResolvedKey) {
        self.pubkeys.push(key.pubkey.clone());
        self.origins.push((key.pubkey.clone(), key.origin.clone()));
        if let Some(secret) = &key.secret {
            self.secrets.push(secret.clone());
        }
    }
}

#[derive(Clone, Debug)]
pub struct Descriptor {
    node: Node,
}

impl Descriptor {
    /// Parses `desc#checksum`.
    pub fn parse(input: &str, network: Network) -> Result<Self, DescriptorError> {
        let (body, checksum) = input
            .rsplit_once('#')
            .ok_or_else(|| DescriptorError::new("Missing checksum"))?;
        if checksum.len() != CHECKSUM_LEN {
            return Err(DescriptorError::new(format!(
                "Expected {CHECKSUM_LEN} character checksum, not {} characters",
                checksum.len()
            )));
        }
        let expected = descriptor_checksum(body)
            .ok_or_else(|| DescriptorError::new("Invalid characters in payload"))?;
        if expected != checksum {
            return Err(DescriptorError::new(format!(
                "Provided checksum '{checksum}' does not match computed checksum '{expected}'"
            )));
        }
        let node = parse_node(body, Context::Top, network)?;
        Ok(Self { node })
    }

    pub fn is_range(&self) -> bool {
        node_is_range(&self.node)
    }

    /// False for `addr` and `raw`, which carry no key information.
    pub fn is_solvable(&self) -> bool {
        !matches!(self.node, Node::Addr(_) | Node::Raw(_))
    }

    pub fn expand(&self, pos: u32) -> Result<Expansion, DescriptorError> {
        let mut out = Expansion::default();
        let scripts = expand_node(&self.node, pos, &mut out)?;
        out.scripts = scripts;
        Ok(out)
    }
}

fn node_is_range(node: &Node) -> bool {
    match node {
        Node::Pk(key) | Node::Pkh(key) | Node::Combo(key) => key.is_range(),
        Node::Multi { keys, .. } => keys.iter().any(KeyExpr::is_range),
        Node::Sh(inner) => node_is_range(inner),
        Node::Addr(_) | Node::Raw(_) => false,
    }
}

fn expand_node(node: &Node, pos: u32, out: &mut Expansion) -> Result<Vec<Vec<u8>>, DescriptorError> {
    match node {
        Node::Pk(key) => {
            let key = key.resolve(pos)?;
            out.add_key(&key);
            Ok(vec![p2pk_script(&key.pubkey)])
        }
        Node::Pkh(key) => {
            let key = key.resolve(pos)?;
            out.add_key(&key);
            Ok(vec![p2pkh_script_for_pubkey(&key.pubkey)])
        }
        Node::Combo(key) => {
            let key = key.resolve(pos)?;
            out.add_key(&key);
            Ok(vec![
                p2pk_script(&key.pubkey),
                p2pkh_script_for_pubkey(&key.pubkey),
            ])
        }
        Node::Multi {
            required,
            keys,
            sorted,
        } => {
            let mut pubkeys = Vec::with_capacity(keys.len());
            for key in keys {
                let key = key.resolve(pos)?;
                out.add_key(&key);
                pubkeys.push(key.pubkey);
            }
            if *sorted {
                pubkeys.sort();
            }
            Ok(vec![multisig_script(*required, &pubkeys)])
        }
        Node::Sh(inner) => {
            let mut outputs = Vec::new();
            for redeem in expand_node(inner, pos, out)? {
                if redeem.len() > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(DescriptorError::new(format!(
                        "P2SH script is too large, {} bytes is larger than {MAX_SCRIPT_ELEMENT_SIZE} bytes",
                        redeem.len()
                    )));
                }
                outputs.push(p2sh_script(&redeem));
                out.redeem_scripts.push(redeem);
            }
            Ok(outputs)
        }
        Node::Addr(script) | Node::Raw(script) => Ok(vec![script.clone()]),
    }
}

fn split_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    let inner = expr[open + 1..].strip_suffix(')')?;
    Some((&expr[..open], inner))
}

fn split_args(inner: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, ch) in inner.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                args.push(&inner[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    args.push(&inner[start..]);
    args
}

fn parse_node(expr: &str, ctx: Context, network: Network) -> Result<Node, DescriptorError> {
    let (name, inner) = split_call(expr)
        .ok_or_else(|| DescriptorError::new(format!("'{expr}' is not a valid descriptor function")))?;
    match name {
        "combo" | "sh" | "addr" | "raw" if ctx != Context::Top => Err(DescriptorError::new(
            format!("Can only have {name}() at top level"),
        )),
        "pk" => Ok(Node::Pk(parse_key(inner, network)?)),
        "pkh" => Ok(Node::Pkh(parse_key(inner, network)?)),
        "combo" => Ok(Node::Combo(parse_key(inner, network)?)),
        "multi" | "sortedmulti" => {
            let args = split_args(inner);
            let (threshold, key_args) = args
                .split_first()
                .ok_or_else(|| DescriptorError::new("Multi needs a threshold"))?;
            let required: usize = threshold
                .parse()
                .map_err(|_| DescriptorError::new(format!("Multi threshold '{threshold}' is not valid")))?;
            let keys = key_args
                .iter()
                .map(|arg| parse_key(arg, network))
                .collect::<Result<Vec<_>, _>>()?;
            if keys.is_empty() || keys.len() > MAX_PUBKEYS_PER_MULTISIG {
                return Err(DescriptorError::new(format!(
                    "Cannot have {} keys in multisig; must have between 1 and {MAX_PUBKEYS_PER_MULTISIG} keys, inclusive",
                    keys.len()
                )));
            }
            if required < 1 || required > keys.len() {
                return Err(DescriptorError::new(format!(
                    "Multisig threshold cannot be {required}, must be at least 1 and at most {}",
                    keys.len()
                )));
            }
            Ok(Node::Multi {
                required,
                keys,
                sorted: name == "sortedmulti",
            })
        }
        "sh" => Ok(Node::Sh(Box::new(parse_node(inner, Context::P2sh, network)?))),
        "addr" => {
            let dest = Destination::decode(inner, network)
                .map_err(|_| DescriptorError::new("Address is not valid"))?;
            Ok(Node::Addr(dest.script_pubkey()))
        }
        "raw" => {
            let script = parse_hex(inner)
                .ok_or_else(|| DescriptorError::new("Raw script is not hex"))?;
            Ok(Node::Raw(script))
        }
        "wpkh" | "wsh" => Err(DescriptorError::new(format!(
            "{name}() is not supported without segregated witness"
        ))),
        _ => Err(DescriptorError::new(format!(
            "'{name}' is not a valid descriptor function"
        ))),
    }
}

fn parse_origin(input: &str) -> Result<(Option<KeyOrigin>, &str), DescriptorError> {
    let Some(rest) = input.strip_prefix('[') else {
        if input.contains(']') {
            return Err(DescriptorError::new("Key origin start '[ character expected but not found"));
        }
        return Ok((None, input));
    };
    let (origin, key) = rest
        .split_once(']')
        .ok_or_else(|| DescriptorError::new("Key origin end ']' character expected but not found"))?;
    let mut steps = origin.split('/');
    let fingerprint_hex = steps.next().unwrap_or_default();
    if fingerprint_hex.len() != 8 {
        return Err(DescriptorError::new(format!(
            "Fingerprint is not 4 bytes ({} characters instead of 8 characters)",
            fingerprint_hex.len()
        )));
    }
    let fingerprint: [u8; 4] = hex::decode(fingerprint_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| DescriptorError::new(format!("Fingerprint '{fingerprint_hex}' is not hex")))?;
    let path = steps
        .map(|step| {
            parse_path_index(step)
                .ok_or_else(|| DescriptorError::new(format!("Key path value '{step}' is not a valid uint32")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((Some(KeyOrigin { fingerprint, path }), key))
}

fn parse_key(input: &str, network: Network) -> Result<KeyExpr, DescriptorError> {
    let (origin, key) = parse_origin(input)?;
    let mut parts = key.split('/');
    let head = parts.next().unwrap_or_default();
    let steps: Vec<&str> = parts.collect();

    if steps.is_empty() {
        if let Some(bytes) = parse_hex(head) {
            if parse_pubkey(&bytes).is_none() {
                return Err(DescriptorError::new(format!("Pubkey '{head}' is invalid")));
            }
            return Ok(KeyExpr {
                origin,
                kind: KeyKind::Const {
                    pubkey: bytes,
                    secret: None,
                },
            });
        }
        if let Some(secret) = Secret::from_wif(head, network) {
            let pubkey = secret
                .pubkey_bytes()
                .map_err(|err| DescriptorError::new(err.to_string()))?;
            return Ok(KeyExpr {
                origin,
                kind: KeyKind::Const {
                    pubkey,
                    secret: Some(secret),
                },
            });
        }
    }

    let mut path = Vec::with_capacity(steps.len());
    let mut range = DeriveRange::None;
    for (idx, step) in steps.iter().enumerate() {
        let last = idx + 1 == steps.len();
        match *step {
            "*" if last => range = DeriveRange::Unhardened,
            "*'" | "*h" if last => range = DeriveRange::Hardened,
            _ => path.push(parse_path_index(step).ok_or_else(|| {
                DescriptorError::new(format!("Key path value '{step}' is not a valid uint32"))
            })?),
        }
    }

    if let Some(key) = ExtendedPrivKey::decode(head, network) {
        return Ok(KeyExpr {
            origin,
            kind: KeyKind::Private { key, path, range },
        });
    }
    if let Some(key) = ExtendedPubKey::decode(head, network) {
        if range == DeriveRange::Hardened || path.iter().any(|index| index & HARDENED != 0) {
            return Err(DescriptorError::new(
                "Hardened derivation requires an extended private key",
            ));
        }
        return Ok(KeyExpr {
            origin,
            kind: KeyKind::Public { key, path, range },
        });
    }
    Err(DescriptorError::new(format!("key '{head}' is not valid")))
}
