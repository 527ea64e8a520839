//! Walks the active chain looking for transactions that involve the wallet.

use std::sync::atomic::{AtomicBool, Ordering};

use fluxd_consensus::constants::TIMESTAMP_WINDOW;
use fluxd_log::{wallet_log, Level};
use fluxd_storage::KeyValueStore;

use crate::chain::BlockRef;
use crate::error::WalletError;
use crate::keys::{KeyId, ScriptId};
use crate::keystore::{KeySource, Staged, WalletTx};
use crate::script::{classify, ScriptKind};
use crate::wallet::Wallet;

const PROGRESS_LOG_INTERVAL: u32 = 1000;

/// Receives best-effort progress for long-running wallet operations.
pub trait ProgressSink: Send + Sync {
    fn report(&self, operation: &str, percent: u8) -> Result<(), String>;
}

/// Exclusive right to rescan one wallet, released on drop.
pub struct RescanReservation<'a> {
    scanning: &'a AtomicBool,
}

impl<'a> RescanReservation<'a> {
    fn acquire(scanning: &'a AtomicBool, abort: &AtomicBool) -> Option<Self> {
        scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        abort.store(false, Ordering::SeqCst);
        Some(Self { scanning })
    }
}

impl Drop for RescanReservation<'_> {
    fn drop(&mut self) {
        self.scanning.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanStatus {
    Success,
    Failure,
    UserAbort,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub last_scanned_height: Option<u32>,
    /// Most recent block whose data could not be read.
    pub last_failed_block: Option<BlockRef>,
    pub transactions_found: usize,
}

/// Position of a scan between two heights, advanced one block per step.
#[derive(Clone, Debug)]
pub struct ScanCursor {
    start_height: u32,
    next_height: u32,
    stop_height: u32,
    update: bool,
    last_scanned_height: Option<u32>,
    last_failed_block: Option<BlockRef>,
    transactions_found: usize,
}

impl ScanCursor {
    pub fn new(start_height: u32, stop_height: u32, update: bool) -> Self {
        Self {
            start_height,
            next_height: start_height,
            stop_height,
            update,
            last_scanned_height: None,
            last_failed_block: None,
            transactions_found: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.next_height > self.stop_height
    }

    pub fn next_height(&self) -> u32 {
        self.next_height
    }

    pub fn percent_done(&self) -> u8 {
        let total = u64::from(self.stop_height.saturating_sub(self.start_height)) + 1;
        let walked = u64::from(self.next_height.saturating_sub(self.start_height));
        (walked.min(total) * 100 / total) as u8
    }

    /// Scans the block at the cursor and moves past it.
    pub fn step<S: KeyValueStore>(&mut self, wallet: &Wallet<S>) -> Result<(), WalletError> {
        if self.is_done() {
            return Ok(());
        }
        let height = self.next_height;
        self.next_height += 1;
        let Some(entry) = wallet.chain().block_at_height(height)? else {
            // The chain shrank underneath us.
            self.stop_height = height.saturating_sub(1);
            return Ok(());
        };
        match wallet.scan_block(&entry, self.update)? {
            Some(found) => {
                self.transactions_found += found;
                self.last_scanned_height = Some(height);
            }
            None => self.last_failed_block = Some(entry),
        }
        Ok(())
    }

    fn outcome(&self, status: ScanStatus) -> ScanOutcome {
        ScanOutcome {
            status: if status == ScanStatus::Success && self.last_failed_block.is_some() {
                ScanStatus::Failure
            } else {
                status
            },
            last_scanned_height: self.last_scanned_height,
            last_failed_block: self.last_failed_block,
            transactions_found: self.transactions_found,
        }
    }
}

impl<S: KeyValueStore> Wallet<S> {
    /// Takes the single rescan slot, clearing any stale abort request.
    pub fn reserve_rescan(&self) -> Option<RescanReservation<'_>> {
        RescanReservation::acquire(&self.scanning, &self.abort_requested)
    }

    pub fn reserve_rescan_or_fail(&self) -> Result<RescanReservation<'_>, WalletError> {
        self.reserve_rescan().ok_or_else(|| {
            WalletError::wallet("Wallet is currently rescanning. Abort existing rescan or wait.")
        })
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn is_aborting_rescan(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Asks a running rescan to stop. False when none runs or one is already
    /// stopping.
    pub fn abort_rescan(&self) -> bool {
        if !self.is_scanning() {
            return false;
        }
        !self.abort_requested.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn report_progress(&self, operation: &str, percent: u8) {
        if let Some(sink) = self.progress() {
            if let Err(err) = sink.report(operation, percent) {
                wallet_log!(Level::Debug, self.name(), "progress report failed: {err}");
            }
        }
    }

    /// Rescans from the first block that may hold transactions created at or
    /// after `start_time`. Returns the earliest time that was fully covered.
    pub fn rescan_from_time(
        &self,
        start_time: i64,
        reservation: &RescanReservation<'_>,
        update: bool,
    ) -> Result<i64, WalletError> {
        let Some(start) = self
            .chain()
            .find_first_block_with_time(start_time - TIMESTAMP_WINDOW)?
        else {
            return Ok(start_time);
        };
        let outcome = self.scan_for_wallet_transactions(start, reservation, update)?;
        match outcome.last_failed_block {
            Some(failed) => Ok(failed.time_max + TIMESTAMP_WINDOW + 1),
            None => Ok(start_time),
        }
    }

    /// Scans from `start` to the current tip.
    pub fn scan_for_wallet_transactions(
        &self,
        start: BlockRef,
        _reservation: &RescanReservation<'_>,
        update: bool,
    ) -> Result<ScanOutcome, WalletError> {
        let stop_height = self.tip()?.map_or(start.height, |tip| tip.height);
        let mut cursor = ScanCursor::new(start.height, stop_height, update);
        wallet_log!(
            Level::Info,
            self.name(),
            "Rescan started from block {} to {}",
            start.height,
            stop_height
        );
        self.report_progress("Rescanning...", 0);

        let mut status = ScanStatus::Success;
        while !cursor.is_done() {
            if self.is_aborting_rescan() {
                wallet_log!(
                    Level::Info,
                    self.name(),
                    "Rescan aborted at block {}. Progress={}%",
                    cursor.next_height(),
                    cursor.percent_done()
                );
                status = ScanStatus::UserAbort;
                break;
            }
            let height = cursor.next_height();
            if height > start.height && (height - start.height) % PROGRESS_LOG_INTERVAL == 0 {
                wallet_log!(
                    Level::Debug,
                    self.name(),
                    "Still rescanning. At block {height}. Progress={}%",
                    cursor.percent_done()
                );
            }
            cursor.step(self)?;
            self.report_progress("Rescanning...", cursor.percent_done());
        }

        let outcome = cursor.outcome(status);
        match (outcome.status, outcome.last_failed_block) {
            (ScanStatus::Failure, Some(failed)) => wallet_log!(
                Level::Warn,
                self.name(),
                "Rescan failed to read block {} ({}); transactions in it may be missing",
                failed.height,
                fluxd_primitives::hash::hash256_to_display_hex(&failed.hash)
            ),
            (ScanStatus::Success, _) => wallet_log!(
                Level::Info,
                self.name(),
                "Rescan completed: {} wallet transactions found",
                outcome.transactions_found
            ),
            _ => {}
        }
        self.report_progress("Rescanning...", 100);
        Ok(outcome)
    }

    /// Records the wallet transactions of one block. `None` when the block
    /// data is unavailable.
    pub(crate) fn scan_block(
        &self,
        entry: &BlockRef,
        update: bool,
    ) -> Result<Option<usize>, WalletError> {
        let Some(block) = self.chain().read_block(&entry.hash)? else {
            return Ok(None);
        };
        let mut state = self.lock_state()?;
        let found = self.stage_locked(&mut state, |staged| {
            let mut found = 0usize;
            for (index, tx) in block.transactions.iter().enumerate() {
                let txid = tx.txid();
                let existing = staged.tx(&txid).is_some();
                if existing && !update {
                    continue;
                }
                if !staged.state().is_relevant(tx) && !spends_staged(staged, tx) {
                    continue;
                }
                for output in &tx.vout {
                    reconcile_output_time(staged, &output.script_pubkey, entry.time);
                }
                let time_received = staged
                    .tx(&txid)
                    .map_or(entry.time, |wtx| wtx.time_received);
                staged.put_tx(
                    txid,
                    WalletTx {
                        tx: tx.clone(),
                        block_hash: Some(entry.hash),
                        index: index as i32,
                        time_received,
                    },
                );
                found += 1;
            }
            Ok(found)
        })?;
        Ok(Some(found))
    }
}

/// Inputs spending transactions found earlier in the same block.
fn spends_staged(staged: &Staged<'_>, tx: &fluxd_primitives::Transaction) -> bool {
    tx.vin.iter().any(|input| {
        staged
            .tx(&input.prevout.hash)
            .and_then(|wtx| wtx.tx.vout.get(input.prevout.index as usize))
            .is_some_and(|prev| staged.is_mine(&prev.script_pubkey) != crate::keystore::IsMine::No)
    })
}

/// An output paying the wallet in a block older than the matching key or
/// watch entry pulls that entry's creation time back to the block time.
fn reconcile_output_time(staged: &mut Staged<'_>, script: &[u8], block_time: i64) {
    if staged.watch_time(script).is_some() {
        staged.lower_watch_time(script, block_time);
    }
    let key_ids: Vec<KeyId> = match classify(script) {
        ScriptKind::PubKey(pubkey) => vec![KeyId::of_pubkey(&pubkey)],
        ScriptKind::PubKeyHash(hash) => vec![KeyId(hash)],
        ScriptKind::ScriptHash(hash) => {
            match staged.redeem_script(&ScriptId(hash)).map(classify) {
                Some(ScriptKind::PubKey(pubkey)) => vec![KeyId::of_pubkey(&pubkey)],
                Some(ScriptKind::PubKeyHash(hash)) => vec![KeyId(hash)],
                Some(ScriptKind::Multisig { pubkeys, .. }) => {
                    pubkeys.iter().map(|pubkey| KeyId::of_pubkey(pubkey)).collect()
                }
                _ => Vec::new(),
            }
        }
        ScriptKind::Multisig { pubkeys, .. } => {
            pubkeys.iter().map(|pubkey| KeyId::of_pubkey(pubkey)).collect()
        }
        ScriptKind::NullData | ScriptKind::NonStandard => Vec::new(),
    };
    for id in key_ids {
        let known_time = staged.key(&id).map(|record| record.meta.create_time);
        if known_time.is_some_and(|time| time > block_time) {
            staged.lower_key_time(&id, block_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fluxd_consensus::Network;
    use fluxd_primitives::{OutPoint, Transaction, TxIn, TxOut};
    use fluxd_storage::MemoryStore;

    use crate::chain::{ChainView, MemoryChain};
    use crate::config::WalletConfig;
    use crate::keys::tests::test_pubkey;
    use crate::script::p2pkh_script_for_pubkey;

    fn payment(script: Vec<u8>, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([tag; 32], 0),
                script_sig: vec![tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 50_000,
                script_pubkey: script,
            }],
            lock_time: 0,
        }
    }

    fn setup(chain: Arc<MemoryChain>) -> Wallet<MemoryStore> {
        Wallet::open(
            WalletConfig::for_network(Network::Regtest),
            MemoryStore::new(),
            chain,
        )
        .expect("open")
    }

    #[test]
    fn second_reservation_fails_until_first_drops() {
        let wallet = setup(Arc::new(MemoryChain::new()));
        let first = wallet.reserve_rescan().expect("first reservation");
        assert!(wallet.reserve_rescan().is_none());
        assert!(wallet.is_scanning());
        drop(first);
        assert!(!wallet.is_scanning());
        assert!(wallet.reserve_rescan().is_some());
    }

    #[test]
    fn abort_only_when_scanning_and_reservation_clears_it() {
        let wallet = setup(Arc::new(MemoryChain::new()));
        assert!(!wallet.abort_rescan());
        let reservation = wallet.reserve_rescan().expect("reserve");
        assert!(wallet.abort_rescan());
        assert!(!wallet.abort_rescan());
        drop(reservation);
        let _reservation = wallet.reserve_rescan().expect("reserve again");
        assert!(!wallet.is_aborting_rescan());
    }

    #[test]
    fn finds_watched_payments_and_pulls_back_watch_time() {
        let chain = Arc::new(MemoryChain::new());
        let script = p2pkh_script_for_pubkey(&test_pubkey(1));
        chain.append(Vec::new(), 1_000).expect("block 0");
        chain
            .append(vec![payment(script.clone(), 1)], 20_000)
            .expect("block 1");
        chain.append(Vec::new(), 30_000).expect("block 2");
        let wallet = setup(Arc::clone(&chain));
        wallet
            .stage(|staged| {
                staged.add_watch(&script, 25_000);
                Ok(())
            })
            .expect("watch");

        let reservation = wallet.reserve_rescan().expect("reserve");
        let scanned = wallet
            .rescan_from_time(25_000, &reservation, true)
            .expect("rescan");
        assert_eq!(scanned, 25_000);
        let (count, watch_time) = wallet
            .with_state(|state| (state.tx_count(), state.watch_time(&script)))
            .expect("state");
        assert_eq!(count, 1);
        assert_eq!(watch_time, Some(20_000));
    }

    #[test]
    fn pruned_block_reports_boundary_after_it() {
        let chain = Arc::new(MemoryChain::new());
        for time in [1_000u32, 2_000, 3_000, 40_000] {
            chain.append(Vec::new(), time).expect("append");
        }
        chain.prune_below(3).expect("prune");
        let wallet = setup(Arc::clone(&chain));
        let reservation = wallet.reserve_rescan().expect("reserve");
        let scanned = wallet
            .rescan_from_time(0, &reservation, true)
            .expect("rescan");
        let failed = chain.block_at_height(2).expect("at").expect("entry");
        assert_eq!(scanned, failed.time_max + TIMESTAMP_WINDOW + 1);
    }

    #[test]
    fn aborted_scan_stops_before_walking() {
        let chain = Arc::new(MemoryChain::new());
        chain.append(Vec::new(), 1_000).expect("append");
        let wallet = setup(Arc::clone(&chain));
        let reservation = wallet.reserve_rescan().expect("reserve");
        assert!(wallet.abort_rescan());
        let start = chain.block_at_height(0).expect("at").expect("entry");
        let outcome = wallet
            .scan_for_wallet_transactions(start, &reservation, true)
            .expect("scan");
        assert_eq!(outcome.status, ScanStatus::UserAbort);
        assert_eq!(outcome.last_scanned_height, None);
    }

    #[test]
    fn without_update_cached_transactions_are_kept() {
        let chain = Arc::new(MemoryChain::new());
        let script = p2pkh_script_for_pubkey(&test_pubkey(2));
        let tx = payment(script.clone(), 9);
        chain.append(vec![tx.clone()], 5_000).expect("append");
        let wallet = setup(Arc::clone(&chain));
        wallet
            .stage(|staged| {
                staged.add_watch(&script, 1);
                staged.put_tx(
                    tx.txid(),
                    WalletTx {
                        tx: tx.clone(),
                        block_hash: None,
                        index: -1,
                        time_received: 77,
                    },
                );
                Ok(())
            })
            .expect("seed");
        let reservation = wallet.reserve_rescan().expect("reserve");
        wallet.rescan_from_time(0, &reservation, false).expect("rescan");
        let cached = wallet
            .with_state(|state| state.tx(&tx.txid()).map(|wtx| wtx.block_hash))
            .expect("state");
        assert_eq!(cached, Some(None));

        wallet.rescan_from_time(0, &reservation, true).expect("rescan");
        let refreshed = wallet
            .with_state(|state| state.tx(&tx.txid()).map(|wtx| (wtx.block_hash, wtx.time_received)))
            .expect("state");
        let block = chain.block_at_height(0).expect("at").expect("entry");
        assert_eq!(refreshed, Some((Some(block.hash), 77)));
    }
}
