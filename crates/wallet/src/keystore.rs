//! In-memory wallet state: keys, watched and redeem scripts, the address book,
//! the keypool and cached transactions.
//!
//! Mutations are staged in a [`Staged`] overlay, turned into a
//! [`WalletDelta`], persisted, and only then applied to [`WalletState`].

use std::collections::BTreeMap;

use fluxd_consensus::Hash256;
use fluxd_primitives::{Destination, Transaction};

use crate::keys::{KeyId, KeyRecord, ScriptId};
use crate::script::{classify, ScriptKind};

pub const PURPOSE_RECEIVE: &str = "receive";
pub const HD_SEED_KEYPATH: &str = "s";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum IsMine {
    No,
    WatchOnly,
    Spendable,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RedeemScript {
    pub script: Vec<u8>,
    pub create_time: Option<i64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressBookEntry {
    pub label: String,
    pub purpose: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPoolEntry {
    pub key_id: KeyId,
    pub internal: bool,
    pub time: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletTx {
    pub tx: Transaction,
    pub block_hash: Option<Hash256>,
    /// Position within the block, `-1` when unconfirmed.
    pub index: i32,
    pub time_received: i64,
}

/// Read access shared by the committed state and a staged overlay.
pub trait KeySource {
    fn key(&self, id: &KeyId) -> Option<&KeyRecord>;
    fn redeem_script(&self, id: &ScriptId) -> Option<&[u8]>;
    fn is_watched(&self, script: &[u8]) -> bool;

    fn have_secret(&self, id: &KeyId) -> bool {
        self.key(id).is_some_and(KeyRecord::has_secret)
    }

    fn have_pubkey(&self, id: &KeyId) -> bool {
        self.key(id).is_some()
    }
}

pub fn is_mine<K: KeySource + ?Sized>(keys: &K, script: &[u8]) -> IsMine {
    is_mine_inner(keys, script, true)
}

fn is_mine_inner<K: KeySource + ?Sized>(keys: &K, script: &[u8], top_level: bool) -> IsMine {
    let mut ret = IsMine::No;
    match classify(script) {
        ScriptKind::PubKey(pubkey) => {
            if keys.have_secret(&KeyId::of_pubkey(&pubkey)) {
                ret = IsMine::Spendable;
            }
        }
        ScriptKind::PubKeyHash(hash) => {
            if keys.have_secret(&KeyId(hash)) {
                ret = IsMine::Spendable;
            }
        }
        ScriptKind::ScriptHash(hash) => {
            // Nested P2SH is never ours.
            if !top_level {
                return IsMine::No;
            }
            if let Some(redeem) = keys.redeem_script(&ScriptId(hash)) {
                ret = ret.max(is_mine_inner(keys, redeem, false));
            }
        }
        ScriptKind::Multisig { pubkeys, .. } => {
            // Bare multisig outputs are at most watch-only.
            if !top_level
                && pubkeys
                    .iter()
                    .all(|pubkey| keys.have_secret(&KeyId::of_pubkey(pubkey)))
            {
                ret = IsMine::Spendable;
            }
        }
        ScriptKind::NullData | ScriptKind::NonStandard => {}
    }
    if ret == IsMine::No && keys.is_watched(script) {
        ret = IsMine::WatchOnly;
    }
    ret
}

/// True when the wallet knows every pubkey and script needed to build a
/// signature for `script`.
pub fn is_solvable<K: KeySource + ?Sized>(keys: &K, script: &[u8]) -> bool {
    solvable_inner(keys, script, true)
}

fn solvable_inner<K: KeySource + ?Sized>(keys: &K, script: &[u8], top_level: bool) -> bool {
    match classify(script) {
        ScriptKind::PubKey(_) | ScriptKind::Multisig { .. } => true,
        ScriptKind::PubKeyHash(hash) => keys.have_pubkey(&KeyId(hash)),
        ScriptKind::ScriptHash(hash) => {
            top_level
                && keys
                    .redeem_script(&ScriptId(hash))
                    .is_some_and(|redeem| solvable_inner(keys, redeem, false))
        }
        ScriptKind::NullData | ScriptKind::NonStandard => false,
    }
}

/// Lowers the wallet-wide earliest key time: `0`/`1` force a full scan.
pub fn lowered_first_key_time(current: i64, create_time: i64) -> i64 {
    if create_time <= 1 {
        1
    } else if current == 0 || create_time < current {
        create_time
    } else {
        current
    }
}

#[derive(Clone, Debug, Default)]
pub struct WalletState {
    pub(crate) keys: BTreeMap<KeyId, KeyRecord>,
    pub(crate) watch_scripts: BTreeMap<Vec<u8>, i64>,
    pub(crate) redeem_scripts: BTreeMap<ScriptId, RedeemScript>,
    pub(crate) address_book: BTreeMap<Destination, AddressBookEntry>,
    pub(crate) keypool: BTreeMap<u64, KeyPoolEntry>,
    pub(crate) txs: BTreeMap<Hash256, WalletTx>,
    pub(crate) first_key_time: i64,
    pub(crate) hd_seed: Option<KeyId>,
    pub(crate) next_pool_index: u64,
}

impl KeySource for WalletState {
    fn key(&self, id: &KeyId) -> Option<&KeyRecord> {
        self.keys.get(id)
    }

    fn redeem_script(&self, id: &ScriptId) -> Option<&[u8]> {
        self.redeem_scripts
            .get(id)
            .map(|entry| entry.script.as_slice())
    }

    fn is_watched(&self, script: &[u8]) -> bool {
        self.watch_scripts.contains_key(script)
    }
}

impl WalletState {
    pub fn is_mine(&self, script: &[u8]) -> IsMine {
        is_mine(self, script)
    }

    pub fn have_key(&self, id: &KeyId) -> bool {
        self.have_secret(id)
    }

    pub fn key_record(&self, id: &KeyId) -> Option<&KeyRecord> {
        self.keys.get(id)
    }

    pub fn keys(&self) -> impl Iterator<Item = (&KeyId, &KeyRecord)> {
        self.keys.iter()
    }

    pub fn have_redeem_script(&self, id: &ScriptId) -> bool {
        self.redeem_scripts.contains_key(id)
    }

    pub fn redeem_scripts(&self) -> impl Iterator<Item = (&ScriptId, &RedeemScript)> {
        self.redeem_scripts.iter()
    }

    pub fn watch_time(&self, script: &[u8]) -> Option<i64> {
        self.watch_scripts.get(script).copied()
    }

    pub fn watch_scripts(&self) -> impl Iterator<Item = (&Vec<u8>, &i64)> {
        self.watch_scripts.iter()
    }

    pub fn address_book_entry(&self, dest: &Destination) -> Option<&AddressBookEntry> {
        self.address_book.get(dest)
    }

    pub fn label(&self, dest: &Destination) -> Option<&str> {
        self.address_book.get(dest).map(|entry| entry.label.as_str())
    }

    pub fn keypool(&self) -> impl Iterator<Item = (&u64, &KeyPoolEntry)> {
        self.keypool.iter()
    }

    pub fn in_keypool(&self, id: &KeyId) -> bool {
        self.keypool.values().any(|entry| entry.key_id == *id)
    }

    pub fn tx(&self, txid: &Hash256) -> Option<&WalletTx> {
        self.txs.get(txid)
    }

    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    pub fn first_key_time(&self) -> i64 {
        self.first_key_time
    }

    pub fn hd_seed(&self) -> Option<KeyId> {
        self.hd_seed
    }

    /// Whether any output of `tx` is ours or any input spends a cached
    /// wallet transaction.
    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        tx.vout
            .iter()
            .any(|out| self.is_mine(&out.script_pubkey) != IsMine::No)
            || tx.vin.iter().any(|input| {
                self.txs
                    .get(&input.prevout.hash)
                    .and_then(|wtx| wtx.tx.vout.get(input.prevout.index as usize))
                    .is_some_and(|prev| self.is_mine(&prev.script_pubkey) != IsMine::No)
            })
    }

    pub fn apply(&mut self, delta: WalletDelta) {
        self.keys.extend(delta.keys);
        self.watch_scripts.extend(delta.watch);
        self.redeem_scripts.extend(delta.redeem);
        self.address_book.extend(delta.address_book);
        self.keypool.extend(delta.keypool);
        for txid in &delta.removed_txs {
            self.txs.remove(txid);
        }
        self.txs.extend(delta.txs);
        if let Some(time) = delta.first_key_time {
            self.first_key_time = time;
        }
        if let Some(seed) = delta.hd_seed {
            self.hd_seed = Some(seed);
        }
        if let Some(next) = delta.next_pool_index {
            self.next_pool_index = next;
        }
    }
}

/// Every record one operation writes. Committed atomically.
#[derive(Clone, Debug, Default)]
pub struct WalletDelta {
    pub(crate) keys: BTreeMap<KeyId, KeyRecord>,
    pub(crate) watch: BTreeMap<Vec<u8>, i64>,
    pub(crate) redeem: BTreeMap<ScriptId, RedeemScript>,
    pub(crate) address_book: BTreeMap<Destination, AddressBookEntry>,
    pub(crate) keypool: BTreeMap<u64, KeyPoolEntry>,
    pub(crate) txs: BTreeMap<Hash256, WalletTx>,
    pub(crate) removed_txs: Vec<Hash256>,
    pub(crate) first_key_time: Option<i64>,
    pub(crate) hd_seed: Option<KeyId>,
    pub(crate) next_pool_index: Option<u64>,
}

impl WalletDelta {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
            && self.watch.is_empty()
            && self.redeem.is_empty()
            && self.address_book.is_empty()
            && self.keypool.is_empty()
            && self.txs.is_empty()
            && self.removed_txs.is_empty()
            && self.first_key_time.is_none()
            && self.hd_seed.is_none()
            && self.next_pool_index.is_none()
    }
}

/// Pending changes layered over the committed state. Reads see the pending
/// writes first.
pub struct Staged<'a> {
    state: &'a WalletState,
    delta: WalletDelta,
}

impl KeySource for Staged<'_> {
    fn key(&self, id: &KeyId) -> Option<&KeyRecord> {
        self.delta.keys.get(id).or_else(|| self.state.keys.get(id))
    }

    fn redeem_script(&self, id: &ScriptId) -> Option<&[u8]> {
        self.delta
            .redeem
            .get(id)
            .or_else(|| self.state.redeem_scripts.get(id))
            .map(|entry| entry.script.as_slice())
    }

    fn is_watched(&self, script: &[u8]) -> bool {
        self.delta.watch.contains_key(script) || self.state.watch_scripts.contains_key(script)
    }
}

impl<'a> Staged<'a> {
    pub fn new(state: &'a WalletState) -> Self {
        Self {
            state,
            delta: WalletDelta::default(),
        }
    }

    pub fn state(&self) -> &WalletState {
        self.state
    }

    pub fn is_mine(&self, script: &[u8]) -> IsMine {
        is_mine(self, script)
    }

    pub fn is_solvable(&self, script: &[u8]) -> bool {
        is_solvable(self, script)
    }

    pub fn into_delta(self) -> WalletDelta {
        self.delta
    }

    fn first_key_time(&self) -> i64 {
        self.delta
            .first_key_time
            .unwrap_or(self.state.first_key_time)
    }

    pub fn update_first_key_time(&mut self, create_time: i64) {
        let lowered = lowered_first_key_time(self.first_key_time(), create_time);
        if lowered != self.state.first_key_time || self.delta.first_key_time.is_some() {
            self.delta.first_key_time = Some(lowered);
        }
    }

    /// Inserts or replaces a key record as given.
    pub fn put_key(&mut self, record: KeyRecord) {
        self.delta.keys.insert(record.id(), record);
    }

    /// Applies `edit` to a copy of an existing record and stages the result.
    pub fn edit_key(&mut self, id: &KeyId, edit: impl FnOnce(&mut KeyRecord)) -> bool {
        let Some(mut record) = self.key(id).cloned() else {
            return false;
        };
        edit(&mut record);
        self.delta.keys.insert(*id, record);
        true
    }

    /// Lowers the creation time of a known key; unknown-time keys stay `0`.
    pub fn lower_key_time(&mut self, id: &KeyId, create_time: i64) {
        let current = self.key(id).map(|record| record.meta.create_time);
        if let Some(current) = current {
            if create_time < current {
                self.edit_key(id, |record| record.meta.create_time = create_time);
            }
        }
    }

    pub fn watch_time(&self, script: &[u8]) -> Option<i64> {
        self.delta
            .watch
            .get(script)
            .or_else(|| self.state.watch_scripts.get(script))
            .copied()
    }

    /// Registers a watched script, keeping the earliest creation time.
    pub fn add_watch(&mut self, script: &[u8], create_time: i64) {
        let time = match self.watch_time(script) {
            Some(existing) if existing <= create_time => existing,
            _ => create_time,
        };
        if self.state.watch_time(script) != Some(time) {
            self.delta.watch.insert(script.to_vec(), time);
        }
        self.update_first_key_time(create_time);
    }

    pub fn lower_watch_time(&mut self, script: &[u8], create_time: i64) {
        if self
            .watch_time(script)
            .is_some_and(|existing| create_time < existing)
        {
            self.delta.watch.insert(script.to_vec(), create_time);
        }
    }

    pub fn have_redeem_script(&self, id: &ScriptId) -> bool {
        self.redeem_script(id).is_some()
    }

    fn redeem_entry(&self, id: &ScriptId) -> Option<&RedeemScript> {
        self.delta
            .redeem
            .get(id)
            .or_else(|| self.state.redeem_scripts.get(id))
    }

    /// Registers a redeem script; an existing entry only has its time lowered.
    pub fn add_redeem_script(&mut self, script: &[u8], create_time: Option<i64>) -> ScriptId {
        let id = ScriptId::of_script(script);
        let merged = match self.redeem_entry(&id) {
            Some(existing) => {
                let create_time = match (existing.create_time, create_time) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                if create_time == existing.create_time {
                    return id;
                }
                RedeemScript {
                    script: existing.script.clone(),
                    create_time,
                }
            }
            None => RedeemScript {
                script: script.to_vec(),
                create_time,
            },
        };
        self.delta.redeem.insert(id, merged);
        id
    }

    pub fn set_label(&mut self, dest: Destination, label: &str) {
        let purpose = self
            .delta
            .address_book
            .get(&dest)
            .or_else(|| self.state.address_book.get(&dest))
            .map(|entry| entry.purpose.clone())
            .unwrap_or_else(|| PURPOSE_RECEIVE.to_string());
        self.delta.address_book.insert(
            dest,
            AddressBookEntry {
                label: label.to_string(),
                purpose,
            },
        );
    }

    pub fn add_to_keypool(&mut self, key_id: KeyId, internal: bool, time: i64) {
        let index = self
            .delta
            .next_pool_index
            .unwrap_or(self.state.next_pool_index);
        self.delta.keypool.insert(
            index,
            KeyPoolEntry {
                key_id,
                internal,
                time,
            },
        );
        self.delta.next_pool_index = Some(index + 1);
    }

    pub fn set_hd_seed(&mut self, seed: KeyId) {
        self.delta.hd_seed = Some(seed);
    }

    pub fn tx(&self, txid: &Hash256) -> Option<&WalletTx> {
        if self.delta.removed_txs.contains(txid) {
            return None;
        }
        self.delta.txs.get(txid).or_else(|| self.state.txs.get(txid))
    }

    pub fn put_tx(&mut self, txid: Hash256, wtx: WalletTx) {
        self.delta.removed_txs.retain(|removed| removed != &txid);
        self.delta.txs.insert(txid, wtx);
    }

    pub fn remove_tx(&mut self, txid: Hash256) {
        self.delta.txs.remove(&txid);
        self.delta.removed_txs.push(txid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_secret;
    use crate::keys::KeyMetadata;
    use crate::script::{multisig_script, p2pk_script, p2pkh_script_for_pubkey, p2sh_script};

    fn state_with_secret(seed: u8) -> (WalletState, Vec<u8>) {
        let record =
            KeyRecord::from_secret(test_secret(seed), KeyMetadata::with_time(100)).expect("record");
        let pubkey = record.pubkey.clone();
        let mut state = WalletState::default();
        let mut staged = Staged::new(&state);
        staged.put_key(record);
        let delta = staged.into_delta();
        state.apply(delta);
        (state, pubkey)
    }

    #[test]
    fn key_outputs_are_spendable() {
        let (state, pubkey) = state_with_secret(1);
        assert_eq!(state.is_mine(&p2pkh_script_for_pubkey(&pubkey)), IsMine::Spendable);
        assert_eq!(state.is_mine(&p2pk_script(&pubkey)), IsMine::Spendable);
    }

    #[test]
    fn bare_multisig_is_never_spendable_but_p2sh_wrapped_is() {
        let (mut state, pubkey) = state_with_secret(1);
        let redeem = multisig_script(1, &[pubkey]);
        assert_eq!(state.is_mine(&redeem), IsMine::No);

        let mut staged = Staged::new(&state);
        staged.add_redeem_script(&redeem, None);
        assert_eq!(staged.is_mine(&p2sh_script(&redeem)), IsMine::Spendable);
        let delta = staged.into_delta();
        state.apply(delta);
        assert_eq!(state.is_mine(&p2sh_script(&redeem)), IsMine::Spendable);
        assert_eq!(state.is_mine(&redeem), IsMine::No);
    }

    #[test]
    fn watched_scripts_keep_earliest_time() {
        let mut state = WalletState::default();
        let script = p2pkh_script_for_pubkey(&crate::keys::tests::test_pubkey(4));
        let mut staged = Staged::new(&state);
        staged.add_watch(&script, 500);
        let delta = staged.into_delta();
        state.apply(delta);
        assert_eq!(state.is_mine(&script), IsMine::WatchOnly);

        let mut staged = Staged::new(&state);
        staged.add_watch(&script, 900);
        staged.add_watch(&script, 300);
        let delta = staged.into_delta();
        state.apply(delta);
        assert_eq!(state.watch_time(&script), Some(300));
        assert_eq!(state.first_key_time(), 300);
    }

    #[test]
    fn first_key_time_floor_is_one() {
        assert_eq!(lowered_first_key_time(0, 0), 1);
        assert_eq!(lowered_first_key_time(0, 50), 50);
        assert_eq!(lowered_first_key_time(40, 50), 40);
        assert_eq!(lowered_first_key_time(60, 50), 50);
    }

    #[test]
    fn solvable_requires_known_pubkeys() {
        let (state, pubkey) = state_with_secret(2);
        assert!(is_solvable(&state, &p2pkh_script_for_pubkey(&pubkey)));
        let other = crate::keys::tests::test_pubkey(9);
        assert!(!is_solvable(&state, &p2pkh_script_for_pubkey(&other)));
        assert!(!is_solvable(&state, &p2sh_script(&p2pk_script(&other))));
    }

    #[test]
    fn relabel_keeps_purpose() {
        let mut state = WalletState::default();
        let dest = Destination::KeyHash([7u8; 20]);
        let mut staged = Staged::new(&state);
        staged.set_label(dest, "first");
        let delta = staged.into_delta();
        state.apply(delta);
        let mut staged = Staged::new(&state);
        staged.set_label(dest, "second");
        let delta = staged.into_delta();
        state.apply(delta);
        let entry = state.address_book_entry(&dest).expect("entry");
        assert_eq!(entry.label, "second");
        assert_eq!(entry.purpose, PURPOSE_RECEIVE);
    }
}
