//! One import item, applied to a staged overlay of the wallet state.
//!
//! Every check that can fail runs against the overlay, so an item that errors
//! leaves nothing behind once its [`Staged`] is dropped.

use std::collections::{BTreeMap, BTreeSet};

use fluxd_consensus::Network;
use fluxd_primitives::Destination;

use crate::descriptor::Descriptor;
use crate::error::WalletError;
use crate::keys::{parse_hex, parse_pubkey, KeyId, KeyMetadata, KeyOrigin, KeyRecord, Secret};
use crate::keystore::{IsMine, KeySource, Staged};
use crate::script::{extract_destination, is_p2sh, p2pk_script, p2sh_script};

pub const MAX_RANGE_ENTRIES: i64 = 1_000_000;

const ALREADY_SPENDABLE: &str =
    "The wallet already contains the private key for this address or script";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptTarget {
    Address(String),
    Script(String),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LegacyImport {
    pub script_pub_key: Option<ScriptTarget>,
    pub redeem_script: Option<String>,
    pub witness_script: Option<String>,
    pub pubkeys: Vec<String>,
    pub keys: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeSpec {
    End(i64),
    Span(i64, i64),
    Malformed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DescriptorImport {
    pub desc: String,
    pub range: Option<RangeSpec>,
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImportForm {
    Legacy(LegacyImport),
    Descriptor(DescriptorImport),
}

impl ImportForm {
    pub fn from_parts(
        legacy: Option<LegacyImport>,
        descriptor: Option<DescriptorImport>,
    ) -> Result<Self, WalletError> {
        match (legacy, descriptor) {
            (Some(_), Some(_)) => Err(WalletError::invalid_parameter(
                "Both a descriptor and a scriptPubKey should not be provided.",
            )),
            (Some(legacy), None) => Ok(ImportForm::Legacy(legacy)),
            (None, Some(descriptor)) => Ok(ImportForm::Descriptor(descriptor)),
            (None, None) => Err(WalletError::invalid_parameter(
                "Either a descriptor or scriptPubKey must be provided.",
            )),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImportRequest {
    pub form: ImportForm,
    pub internal: bool,
    pub watchonly: bool,
    pub label: Option<String>,
    pub keypool: bool,
}

impl ImportRequest {
    pub fn legacy(import: LegacyImport) -> Self {
        Self {
            form: ImportForm::Legacy(import),
            internal: false,
            watchonly: false,
            label: None,
            keypool: false,
        }
    }

    pub fn descriptor(import: DescriptorImport) -> Self {
        Self {
            form: ImportForm::Descriptor(import),
            internal: false,
            watchonly: false,
            label: None,
            keypool: false,
        }
    }

    /// Option combinations that are rejected before anything is parsed.
    pub fn validate(&self, ctx: &ImportContext) -> Result<(), WalletError> {
        if self.keypool && !ctx.private_keys_disabled {
            return Err(WalletError::invalid_parameter(
                "Keys can only be imported to the keypool when private keys are disabled",
            ));
        }
        match &self.form {
            ImportForm::Legacy(legacy) => {
                let target = legacy
                    .script_pub_key
                    .as_ref()
                    .ok_or_else(|| WalletError::invalid_parameter("Invalid scriptPubKey"))?;
                if self.watchonly && !legacy.keys.is_empty() {
                    return Err(WalletError::invalid_parameter(
                        "Incompatibility found between watchonly and keys",
                    ));
                }
                if self.internal && self.label.is_some() {
                    return Err(WalletError::invalid_parameter(
                        "Incompatibility found between internal and label",
                    ));
                }
                if !self.internal && matches!(target, ScriptTarget::Script(_)) {
                    return Err(WalletError::invalid_parameter(
                        "Internal must be set for hex scriptPubKey",
                    ));
                }
                if legacy.witness_script.is_some() {
                    return Err(WalletError::invalid_parameter(
                        "Witness scripts are not supported on this chain",
                    ));
                }
                let is_p2sh = legacy.redeem_script.as_deref().is_some_and(|s| !s.is_empty());
                if !is_p2sh && (legacy.keys.len() > 1 || legacy.pubkeys.len() > 1) {
                    return Err(WalletError::invalid_parameter(
                        "More than private key given for one address",
                    ));
                }
                if !legacy.keys.is_empty() && ctx.private_keys_disabled {
                    return Err(private_keys_disabled());
                }
            }
            ImportForm::Descriptor(_) => {
                if self.internal && self.label.is_some() {
                    return Err(WalletError::invalid_parameter(
                        "Internal addresses should not have a label",
                    ));
                }
            }
        }
        Ok(())
    }

    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImportContext {
    pub network: Network,
    pub private_keys_disabled: bool,
}

fn private_keys_disabled() -> WalletError {
    WalletError::wallet("Cannot import private keys to a wallet with private keys disabled")
}

fn decode_secret(wif: &str, network: Network) -> Result<Secret, WalletError> {
    Secret::from_wif(wif, network)
        .ok_or_else(|| WalletError::invalid_address_or_key("Invalid private key encoding"))
}

fn decode_pubkey(hex_pubkey: &str) -> Result<Vec<u8>, WalletError> {
    let bytes = parse_hex(hex_pubkey)
        .ok_or_else(|| WalletError::invalid_address_or_key("Pubkey must be a hex string"))?;
    if parse_pubkey(&bytes).is_none() {
        return Err(WalletError::invalid_address_or_key(
            "Pubkey is not a valid public key",
        ));
    }
    Ok(bytes)
}

fn consistency_failed() -> WalletError {
    WalletError::invalid_address_or_key("Consistency check failed")
}

fn ensure_not_spendable(staged: &Staged<'_>, script: &[u8]) -> Result<(), WalletError> {
    if staged.is_mine(script) == IsMine::Spendable {
        return Err(WalletError::wallet(ALREADY_SPENDABLE));
    }
    Ok(())
}

/// Applies one item. Returns the warnings to report with a success.
pub fn process_import(
    staged: &mut Staged<'_>,
    request: &ImportRequest,
    timestamp: i64,
    ctx: &ImportContext,
) -> Result<Vec<String>, WalletError> {
    request.validate(ctx)?;
    match &request.form {
        ImportForm::Legacy(legacy) => {
            process_legacy(staged, request, legacy, timestamp, ctx)?;
            Ok(Vec::new())
        }
        ImportForm::Descriptor(descriptor) => {
            process_descriptor(staged, request, descriptor, timestamp, ctx)
        }
    }
}

fn process_legacy(
    staged: &mut Staged<'_>,
    request: &ImportRequest,
    legacy: &LegacyImport,
    timestamp: i64,
    ctx: &ImportContext,
) -> Result<(), WalletError> {
    let target = legacy
        .script_pub_key
        .as_ref()
        .ok_or_else(|| WalletError::invalid_parameter("Invalid scriptPubKey"))?;
    let (script, address_dest) = match target {
        ScriptTarget::Address(address) => {
            let dest = Destination::decode(address, ctx.network)
                .map_err(|_| WalletError::invalid_address_or_key("Invalid address"))?;
            (dest.script_pubkey(), Some(dest))
        }
        ScriptTarget::Script(hex_script) => {
            let script = parse_hex(hex_script)
                .ok_or_else(|| WalletError::invalid_address_or_key("Invalid scriptPubKey"))?;
            (script, None)
        }
    };
    let label = request.label();
    let labelled = !request.internal;

    if let Some(redeem_hex) = legacy.redeem_script.as_deref().filter(|s| !s.is_empty()) {
        let redeem = parse_hex(redeem_hex)
            .ok_or_else(|| WalletError::invalid_address_or_key("Invalid redeem script"))?;
        if !is_p2sh(&script) {
            return Err(WalletError::invalid_address_or_key(
                "Invalid P2SH address / script",
            ));
        }
        if p2sh_script(&redeem) != script {
            return Err(consistency_failed());
        }

        staged.add_watch(&redeem, timestamp);
        let redeem_id = staged.add_redeem_script(&redeem, Some(timestamp));
        let redeem_destination = redeem_id.destination().script_pubkey();
        ensure_not_spendable(staged, &redeem_destination)?;
        staged.add_watch(&redeem_destination, timestamp);
        if let (true, Some(dest)) = (labelled, address_dest) {
            staged.set_label(dest, label);
        }

        let pubkeys = legacy
            .pubkeys
            .iter()
            .map(|pubkey| decode_pubkey(pubkey))
            .collect::<Result<Vec<_>, _>>()?;
        for wif in &legacy.keys {
            let secret = decode_secret(wif, ctx.network)?;
            let record = KeyRecord::from_secret(secret, KeyMetadata::with_time(timestamp))?;
            if !pubkeys.is_empty() && !pubkeys.contains(&record.pubkey) {
                return Err(consistency_failed());
            }
            insert_secret_key(staged, record, labelled.then_some(label), timestamp)?;
        }
        if request.keypool {
            for pubkey in &pubkeys {
                add_pubkey_to_keypool(staged, pubkey, request.internal, timestamp);
            }
        }
        return Ok(());
    }

    let check_destination = |key_dest: Destination| -> Result<(), WalletError> {
        match address_dest {
            Some(dest) if dest != key_dest => Err(consistency_failed()),
            Some(_) => Ok(()),
            None => match extract_destination(&script) {
                Some(dest) if dest != key_dest => Err(consistency_failed()),
                _ => Ok(()),
            },
        }
    };

    if let Some(wif) = legacy.keys.first() {
        let secret = decode_secret(wif, ctx.network)?;
        let record = KeyRecord::from_secret(secret, KeyMetadata::with_time(timestamp))?;
        check_destination(record.id().destination())?;
        if let Some(pubkey) = legacy.pubkeys.first() {
            if decode_pubkey(pubkey)? != record.pubkey {
                return Err(consistency_failed());
            }
        }
        insert_secret_key(staged, record, labelled.then_some(label), timestamp)?;
        return Ok(());
    }

    if let Some(pubkey) = legacy.pubkeys.first() {
        let pubkey = decode_pubkey(pubkey)?;
        let key_id = KeyId::of_pubkey(&pubkey);
        let pubkey_dest = key_id.destination();
        check_destination(pubkey_dest)?;

        let pkh_script = pubkey_dest.script_pubkey();
        ensure_not_spendable(staged, &pkh_script)?;
        staged.add_watch(&pkh_script, timestamp);
        if labelled {
            staged.set_label(pubkey_dest, label);
        }
        let raw_script = p2pk_script(&pubkey);
        ensure_not_spendable(staged, &raw_script)?;
        staged.add_watch(&raw_script, timestamp);
        learn_pubkey(staged, &pubkey, timestamp);
        if request.keypool {
            add_pubkey_to_keypool(staged, &pubkey, request.internal, timestamp);
        }
        return Ok(());
    }

    ensure_not_spendable(staged, &script)?;
    staged.add_watch(&script, timestamp);
    if let (true, Some(dest)) = (labelled, address_dest) {
        staged.set_label(dest, label);
    }
    Ok(())
}

/// Adds a private key that must not be present yet. A label, when given, is
/// attached to the key's P2PKH destination.
fn insert_secret_key(
    staged: &mut Staged<'_>,
    record: KeyRecord,
    label: Option<&str>,
    timestamp: i64,
) -> Result<(), WalletError> {
    let id = record.id();
    if let Some(label) = label {
        staged.set_label(id.destination(), label);
    }
    if staged.have_secret(&id) {
        return Err(WalletError::wallet(ALREADY_SPENDABLE));
    }
    let record = merge_existing_meta(staged, record);
    staged.put_key(record);
    staged.update_first_key_time(timestamp);
    Ok(())
}

/// Keeps the origin of a previously known watch-only pubkey when its secret
/// arrives, and the earlier of the two creation times.
fn merge_existing_meta(staged: &Staged<'_>, mut record: KeyRecord) -> KeyRecord {
    if let Some(existing) = staged.key(&record.id()) {
        record.meta = KeyMetadata {
            create_time: existing.meta.create_time.min(record.meta.create_time),
            ..existing.meta.clone()
        };
    }
    record
}

fn learn_pubkey(staged: &mut Staged<'_>, pubkey: &[u8], timestamp: i64) {
    let id = KeyId::of_pubkey(pubkey);
    if staged.key(&id).is_some() {
        staged.lower_key_time(&id, timestamp);
    } else {
        staged.put_key(KeyRecord::watch_only(
            pubkey.to_vec(),
            KeyMetadata::with_time(timestamp),
        ));
    }
}

fn add_pubkey_to_keypool(staged: &mut Staged<'_>, pubkey: &[u8], internal: bool, timestamp: i64) {
    let id = KeyId::of_pubkey(pubkey);
    if !staged.state().in_keypool(&id) {
        staged.add_to_keypool(id, internal, timestamp);
    }
}

/// Resolves a requested range to inclusive `[begin, end]` positions.
pub fn resolve_range(spec: RangeSpec) -> Result<(u32, u32), WalletError> {
    let (begin, end) = match spec {
        RangeSpec::End(end) => (0, end),
        RangeSpec::Span(begin, end) => {
            if begin > end {
                return Err(WalletError::invalid_parameter(
                    "Range specified as [begin,end] must not have begin after end",
                ));
            }
            (begin, end)
        }
        RangeSpec::Malformed => {
            return Err(WalletError::invalid_parameter(
                "Range must be specified as end or as [begin,end]",
            ))
        }
    };
    if begin < 0 || end < 0 {
        return Err(WalletError::invalid_parameter(
            "Range should be greater or equal than 0",
        ));
    }
    if (end >> 31) != 0 {
        return Err(WalletError::invalid_parameter("End of range is too high"));
    }
    if end >= begin + MAX_RANGE_ENTRIES {
        return Err(WalletError::invalid_parameter("Range is too large"));
    }
    Ok((begin as u32, end as u32))
}

fn process_descriptor(
    staged: &mut Staged<'_>,
    request: &ImportRequest,
    import: &DescriptorImport,
    timestamp: i64,
    ctx: &ImportContext,
) -> Result<Vec<String>, WalletError> {
    let mut warnings = Vec::new();
    let descriptor = Descriptor::parse(&import.desc, ctx.network)
        .map_err(|_| WalletError::invalid_address_or_key("Descriptor is invalid"))?;

    let (begin, end) = match (descriptor.is_range(), import.range) {
        (false, Some(_)) => {
            return Err(WalletError::invalid_parameter(
                "Range should not be specified for an un-ranged descriptor",
            ))
        }
        (false, None) => (0, 0),
        (true, None) => {
            return Err(WalletError::invalid_parameter(
                "Descriptor is ranged, please specify the range",
            ))
        }
        (true, Some(spec)) => resolve_range(spec)?,
    };

    let mut scripts = BTreeSet::new();
    let mut redeem_scripts = BTreeSet::new();
    let mut pubkey_map: BTreeMap<KeyId, Vec<u8>> = BTreeMap::new();
    let mut ordered_pubkeys = Vec::new();
    let mut origins: BTreeMap<KeyId, KeyOrigin> = BTreeMap::new();
    let mut descriptor_secrets = Vec::new();
    for pos in begin..=end {
        let expansion = descriptor
            .expand(pos)
            .map_err(|_| WalletError::invalid_address_or_key("Descriptor is invalid"))?;
        scripts.extend(expansion.scripts);
        redeem_scripts.extend(expansion.redeem_scripts);
        for pubkey in expansion.pubkeys {
            let id = KeyId::of_pubkey(&pubkey);
            if pubkey_map.insert(id, pubkey).is_none() {
                ordered_pubkeys.push(id);
            }
        }
        for (pubkey, origin) in expansion.origins {
            origins.insert(KeyId::of_pubkey(&pubkey), origin);
        }
        descriptor_secrets.extend(expansion.secrets);
    }

    let mut privkey_map: BTreeMap<KeyId, Secret> = BTreeMap::new();
    for secret in descriptor_secrets {
        privkey_map.insert(secret.key_id()?, secret);
    }
    for wif in &import.keys {
        let secret = decode_secret(wif, ctx.network)?;
        let id = secret.key_id()?;
        if pubkey_map.contains_key(&id) {
            privkey_map.insert(id, secret);
        } else {
            warnings.push("Ignoring irrelevant private key.".to_string());
        }
    }

    let spendable = pubkey_map.keys().all(|id| privkey_map.contains_key(id))
        && origins.keys().all(|id| privkey_map.contains_key(id));
    if !request.watchonly && !spendable {
        warnings.push(
            "Some private keys are missing, outputs will be considered watchonly. If this is intentional, specify the watchonly flag."
                .to_string(),
        );
    }
    if request.watchonly && spendable {
        warnings.push(
            "All private keys are provided, outputs will be considered spendable. If this is intentional, do not specify the watchonly flag."
                .to_string(),
        );
    }
    let have_solving_data = descriptor.is_solvable();

    if ctx.private_keys_disabled && !privkey_map.is_empty() {
        return Err(private_keys_disabled());
    }
    for script in &scripts {
        if staged.is_mine(script) == IsMine::Spendable {
            return Err(WalletError::wallet(format!(
                "{ALREADY_SPENDABLE} (\"{}\")",
                hex::encode(script)
            )));
        }
    }

    for redeem in &redeem_scripts {
        staged.add_redeem_script(redeem, Some(timestamp));
    }
    for (id, secret) in privkey_map {
        if staged.have_secret(&id) {
            staged.lower_key_time(&id, timestamp);
        } else {
            let record = KeyRecord::from_secret(secret, KeyMetadata::with_time(timestamp))?;
            let record = merge_existing_meta(staged, record);
            staged.put_key(record);
        }
        staged.update_first_key_time(timestamp);
    }
    for id in &ordered_pubkeys {
        let Some(pubkey) = pubkey_map.get(id) else {
            continue;
        };
        if staged.key(id).is_none() {
            staged.add_watch(&p2pk_script(pubkey), timestamp);
        }
        learn_pubkey(staged, pubkey, timestamp);
        if request.keypool {
            add_pubkey_to_keypool(staged, pubkey, request.internal, timestamp);
        }
    }
    for (id, origin) in &origins {
        staged.edit_key(id, |record| {
            record.meta.hd_keypath = Some(origin.format_path());
            record.meta.origin = Some(origin.clone());
        });
    }
    for script in &scripts {
        if !have_solving_data || staged.is_mine(script) == IsMine::No {
            staged.add_watch(script, timestamp);
        }
        if request.internal {
            continue;
        }
        if let Some(dest) = extract_destination(script) {
            staged.set_label(dest, request.label());
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::add_checksum;
    use crate::keys::tests::{test_pubkey, test_secret};
    use crate::keystore::WalletState;
    use crate::script::{multisig_script, p2pkh_script_for_pubkey};

    const CTX: ImportContext = ImportContext {
        network: Network::Regtest,
        private_keys_disabled: false,
    };

    fn address_of(pubkey: &[u8]) -> String {
        KeyId::of_pubkey(pubkey).destination().encode(Network::Regtest)
    }

    fn address_request(address: String) -> ImportRequest {
        ImportRequest::legacy(LegacyImport {
            script_pub_key: Some(ScriptTarget::Address(address)),
            ..LegacyImport::default()
        })
    }

    fn apply(
        state: &mut WalletState,
        request: &ImportRequest,
        timestamp: i64,
        ctx: &ImportContext,
    ) -> Result<Vec<String>, WalletError> {
        let mut staged = Staged::new(state);
        let warnings = process_import(&mut staged, request, timestamp, ctx)?;
        let delta = staged.into_delta();
        state.apply(delta);
        Ok(warnings)
    }

    #[test]
    fn watchonly_address_adds_watch_and_label() {
        let mut state = WalletState::default();
        let pubkey = test_pubkey(1);
        let mut request = address_request(address_of(&pubkey));
        request.watchonly = true;
        request.label = Some("cold".to_string());
        apply(&mut state, &request, 500, &CTX).expect("import");
        let script = p2pkh_script_for_pubkey(&pubkey);
        assert_eq!(state.watch_time(&script), Some(500));
        assert_eq!(state.is_mine(&script), IsMine::WatchOnly);
        assert_eq!(state.label(&KeyId::of_pubkey(&pubkey).destination()), Some("cold"));
        assert_eq!(state.keys().count(), 0);
        assert_eq!(state.first_key_time(), 500);
    }

    #[test]
    fn internal_with_label_is_rejected_before_mutation() {
        let state = WalletState::default();
        let mut request = address_request(address_of(&test_pubkey(1)));
        request.internal = true;
        request.label = Some("nope".to_string());
        let mut staged = Staged::new(&state);
        let err = process_import(&mut staged, &request, 10, &CTX).expect_err("rejected");
        assert!(err.is_rpc(
            crate::error::RpcErrorCode::InvalidParameter,
            "Incompatibility found between internal and label"
        ));
        assert!(staged.into_delta().is_empty());
    }

    #[test]
    fn key_with_mismatched_address_fails_consistency() {
        let state = WalletState::default();
        let mut request = address_request(address_of(&test_pubkey(2)));
        if let ImportForm::Legacy(legacy) = &mut request.form {
            legacy.keys = vec![test_secret(1).to_wif(Network::Regtest)];
        }
        let mut staged = Staged::new(&state);
        let err = process_import(&mut staged, &request, 10, &CTX).expect_err("mismatch");
        assert!(err.is_rpc(
            crate::error::RpcErrorCode::InvalidAddressOrKey,
            "Consistency check failed"
        ));
    }

    #[test]
    fn reimporting_key_keeps_first_label() {
        let mut state = WalletState::default();
        let secret = test_secret(4);
        let pubkey = secret.pubkey_bytes().expect("pubkey");
        let mut request = address_request(address_of(&pubkey));
        if let ImportForm::Legacy(legacy) = &mut request.form {
            legacy.keys = vec![secret.to_wif(Network::Regtest)];
        }
        apply(&mut state, &request, 10, &CTX).expect("first");
        let dest = KeyId::of_pubkey(&pubkey).destination();
        assert_eq!(state.label(&dest), Some(""));

        request.label = Some("x".to_string());
        let err = apply(&mut state, &request, 10, &CTX).expect_err("second");
        assert!(err.is_rpc(crate::error::RpcErrorCode::WalletError, ALREADY_SPENDABLE));
        assert_eq!(state.label(&dest), Some(""));
    }

    #[test]
    fn p2sh_import_registers_redeem_script() {
        let mut state = WalletState::default();
        let secret = test_secret(5);
        let pubkey = secret.pubkey_bytes().expect("pubkey");
        let redeem = multisig_script(1, &[pubkey.clone(), test_pubkey(6)]);
        let address = crate::keys::ScriptId::of_script(&redeem)
            .destination()
            .encode(Network::Regtest);
        let request = ImportRequest::legacy(LegacyImport {
            script_pub_key: Some(ScriptTarget::Address(address)),
            redeem_script: Some(hex::encode(&redeem)),
            keys: vec![secret.to_wif(Network::Regtest)],
            ..LegacyImport::default()
        });
        apply(&mut state, &request, 77, &CTX).expect("import");
        assert!(state.have_redeem_script(&crate::keys::ScriptId::of_script(&redeem)));
        assert_eq!(state.watch_time(&redeem), Some(77));
        assert!(state.have_key(&KeyId::of_pubkey(&pubkey)));
        // Only one of the two keys is held.
        assert_eq!(state.is_mine(&p2sh_script(&redeem)), IsMine::WatchOnly);
    }

    #[test]
    fn redeem_script_must_hash_to_target() {
        let state = WalletState::default();
        let redeem = multisig_script(1, &[test_pubkey(1)]);
        let other = multisig_script(1, &[test_pubkey(2)]);
        let address = crate::keys::ScriptId::of_script(&other)
            .destination()
            .encode(Network::Regtest);
        let request = ImportRequest::legacy(LegacyImport {
            script_pub_key: Some(ScriptTarget::Address(address)),
            redeem_script: Some(hex::encode(&redeem)),
            ..LegacyImport::default()
        });
        let mut staged = Staged::new(&state);
        let err = process_import(&mut staged, &request, 1, &CTX).expect_err("mismatch");
        assert!(err.is_rpc(
            crate::error::RpcErrorCode::InvalidAddressOrKey,
            "Consistency check failed"
        ));
    }

    #[test]
    fn hex_script_requires_internal() {
        let state = WalletState::default();
        let mut request = ImportRequest::legacy(LegacyImport {
            script_pub_key: Some(ScriptTarget::Script("51".to_string())),
            ..LegacyImport::default()
        });
        let mut staged = Staged::new(&state);
        assert!(process_import(&mut staged, &request, 1, &CTX).is_err());
        request.internal = true;
        let mut staged = Staged::new(&state);
        process_import(&mut staged, &request, 1, &CTX).expect("internal script");
        assert!(staged.watch_time(&[0x51]).is_some());
    }

    #[test]
    fn descriptor_import_with_irrelevant_key_warns() {
        let mut state = WalletState::default();
        let pubkey = test_pubkey(1);
        let desc = add_checksum(&format!("pkh({})", hex::encode(&pubkey))).expect("checksum");
        let mut request = ImportRequest::descriptor(DescriptorImport {
            desc,
            range: None,
            keys: vec![test_secret(9).to_wif(Network::Regtest)],
        });
        request.label = Some("desc".to_string());
        let warnings = apply(&mut state, &request, 300, &CTX).expect("import");
        assert_eq!(
            warnings,
            vec![
                "Ignoring irrelevant private key.".to_string(),
                "Some private keys are missing, outputs will be considered watchonly. If this is intentional, specify the watchonly flag."
                    .to_string(),
            ]
        );
        let script = p2pkh_script_for_pubkey(&pubkey);
        assert_eq!(state.is_mine(&script), IsMine::WatchOnly);
        let record = state.key_record(&KeyId::of_pubkey(&pubkey)).expect("pubkey known");
        assert!(!record.has_secret());
        assert_eq!(record.meta.hd_keypath.as_deref(), Some("m"));
        assert_eq!(state.label(&KeyId::of_pubkey(&pubkey).destination()), Some("desc"));
    }

    #[test]
    fn descriptor_range_rules() {
        assert_eq!(resolve_range(RangeSpec::End(5)).expect("end"), (0, 5));
        assert_eq!(resolve_range(RangeSpec::Span(2, 4)).expect("span"), (2, 4));
        let cases = [
            (RangeSpec::Span(5, 4), "Range specified as [begin,end] must not have begin after end"),
            (RangeSpec::End(-1), "Range should be greater or equal than 0"),
            (RangeSpec::End(1 << 31), "End of range is too high"),
            (RangeSpec::Span(0, 1_000_000), "Range is too large"),
            (RangeSpec::Malformed, "Range must be specified as end or as [begin,end]"),
        ];
        for (spec, message) in cases {
            let err = resolve_range(spec).expect_err("invalid range");
            assert!(err.is_rpc(crate::error::RpcErrorCode::InvalidParameter, message), "{spec:?}");
        }
    }

    #[test]
    fn descriptor_spendable_script_is_rejected_with_hex() {
        let mut state = WalletState::default();
        let secret = test_secret(3);
        let wif = secret.to_wif(Network::Regtest);
        let desc = add_checksum(&format!("pkh({wif})")).expect("checksum");
        let request = ImportRequest::descriptor(DescriptorImport {
            desc,
            range: None,
            keys: Vec::new(),
        });
        let warnings = apply(&mut state, &request, 50, &CTX).expect("first");
        assert!(warnings.is_empty());
        let err = apply(&mut state, &request, 50, &CTX).expect_err("second");
        let script = p2pkh_script_for_pubkey(&secret.pubkey_bytes().expect("pubkey"));
        assert_eq!(
            err.to_string(),
            format!("{ALREADY_SPENDABLE} (\"{}\")", hex::encode(script))
        );
    }

    #[test]
    fn keypool_requires_disabled_private_keys() {
        let pubkey = test_pubkey(8);
        let desc = add_checksum(&format!("pkh({})", hex::encode(&pubkey))).expect("checksum");
        let mut request = ImportRequest::descriptor(DescriptorImport {
            desc,
            range: None,
            keys: Vec::new(),
        });
        request.keypool = true;
        request.watchonly = true;
        let mut state = WalletState::default();
        assert!(apply(&mut state, &request, 1, &CTX).is_err());

        let disabled = ImportContext {
            private_keys_disabled: true,
            ..CTX
        };
        apply(&mut state, &request, 1, &disabled).expect("keypool import");
        assert!(state.in_keypool(&KeyId::of_pubkey(&pubkey)));
    }
}
