use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use fluxd_consensus::Network;
use fluxd_log::{wallet_log, Level};
use fluxd_storage::KeyValueStore;

use crate::chain::{BlockRef, ChainView};
use crate::config::WalletConfig;
use crate::db::{WalletDb, FLAG_DISABLE_PRIVATE_KEYS};
use crate::error::WalletError;
use crate::import::ImportContext;
use crate::keystore::{Staged, WalletDelta, WalletState};
use crate::rescan::ProgressSink;

/// One wallet: its persisted records, the in-memory view of them, and the
/// chain it scans.
///
/// Every mutation runs under the `state` lock and is written to the store
/// before it becomes visible. Rescans hold a separate reservation instead of
/// the lock.
pub struct Wallet<S> {
    config: WalletConfig,
    db: WalletDb<S>,
    chain: Arc<dyn ChainView>,
    state: Mutex<WalletState>,
    flags: AtomicU64,
    pub(crate) scanning: AtomicBool,
    pub(crate) abort_requested: AtomicBool,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl<S: KeyValueStore> Wallet<S> {
    pub fn open(
        config: WalletConfig,
        store: S,
        chain: Arc<dyn ChainView>,
    ) -> Result<Self, WalletError> {
        fluxd_log::init(config.log);
        let db = WalletDb::new(store);
        let default_flags = if config.disable_private_keys {
            FLAG_DISABLE_PRIVATE_KEYS
        } else {
            0
        };
        let flags = db.init(config.network, default_flags)?;
        let state = db.load()?;
        wallet_log!(
            Level::Info,
            &config.wallet_name,
            "Wallet loaded: {} keys, {} watched scripts, {} transactions",
            state.keys.len(),
            state.watch_scripts.len(),
            state.tx_count()
        );
        Ok(Self {
            config,
            db,
            chain,
            state: Mutex::new(state),
            flags: AtomicU64::new(flags),
            scanning: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            progress: None,
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.wallet_name
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn chain(&self) -> &dyn ChainView {
        self.chain.as_ref()
    }

    pub fn db(&self) -> &WalletDb<S> {
        &self.db
    }

    pub fn flags(&self) -> u64 {
        self.flags.load(Ordering::SeqCst)
    }

    pub fn private_keys_disabled(&self) -> bool {
        self.flags() & FLAG_DISABLE_PRIVATE_KEYS != 0
    }

    pub fn set_private_keys_disabled(&self, disabled: bool) -> Result<(), WalletError> {
        let current = self.flags();
        let flags = if disabled {
            current | FLAG_DISABLE_PRIVATE_KEYS
        } else {
            current & !FLAG_DISABLE_PRIVATE_KEYS
        };
        self.db.set_flags(flags)?;
        self.flags.store(flags, Ordering::SeqCst);
        Ok(())
    }

    pub fn import_context(&self) -> ImportContext {
        ImportContext {
            network: self.network(),
            private_keys_disabled: self.private_keys_disabled(),
        }
    }

    pub(crate) fn progress(&self) -> Option<&dyn ProgressSink> {
        self.progress.as_deref()
    }

    pub fn lock_state(&self) -> Result<MutexGuard<'_, WalletState>, WalletError> {
        self.state.lock().map_err(|_| WalletError::LockPoisoned)
    }

    /// Runs a read-only closure against the committed state.
    pub fn with_state<R>(&self, read: impl FnOnce(&WalletState) -> R) -> Result<R, WalletError> {
        let state = self.lock_state()?;
        Ok(read(&state))
    }

    /// Persists `delta` and applies it to `state`. Nothing changes in memory
    /// when the store write fails.
    pub fn commit(&self, state: &mut WalletState, delta: WalletDelta) -> Result<(), WalletError> {
        if delta.is_empty() {
            return Ok(());
        }
        self.db.write_delta(&delta)?;
        state.apply(delta);
        Ok(())
    }

    /// Stages one atomic change under an already held lock.
    pub fn stage_locked<R>(
        &self,
        state: &mut WalletState,
        change: impl FnOnce(&mut Staged<'_>) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let mut staged = Staged::new(state);
        let out = change(&mut staged)?;
        let delta = staged.into_delta();
        self.commit(state, delta)?;
        Ok(out)
    }

    /// Takes the lock and stages one atomic change.
    pub fn stage<R>(
        &self,
        change: impl FnOnce(&mut Staged<'_>) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let mut state = self.lock_state()?;
        self.stage_locked(&mut state, change)
    }

    pub(crate) fn tip(&self) -> Result<Option<BlockRef>, WalletError> {
        Ok(self.chain.tip()?)
    }

    pub(crate) fn have_pruned(&self) -> Result<bool, WalletError> {
        Ok(self.chain.have_pruned()?)
    }
}

pub(crate) fn current_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
