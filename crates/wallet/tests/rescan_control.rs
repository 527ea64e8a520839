use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use fluxd_consensus::Network;
use fluxd_storage::{
    Column, KeyValueStore, MemoryStore, PrefixVisitor, ScanResult, StoreError, WriteBatch,
};
use fluxd_wallet::rpc::dispatch;
use fluxd_wallet::{MemoryChain, ProgressSink, RpcErrorCode, Secret, Wallet, WalletConfig};
use serde_json::json;

fn secret(seed: u8) -> Secret {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x61;
    bytes[31] = seed;
    Secret::new(bytes, true).expect("secret")
}

fn address(seed: u8) -> String {
    secret(seed)
        .key_id()
        .expect("key id")
        .destination()
        .encode(Network::Regtest)
}

fn short_chain() -> Arc<MemoryChain> {
    let chain = Arc::new(MemoryChain::new());
    for time in [1_000, 2_000, 3_000] {
        chain.append(Vec::new(), time).expect("block");
    }
    chain
}

/// Parks the first rescan at its opening progress report until released.
struct GateSink {
    armed: AtomicBool,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl ProgressSink for GateSink {
    fn report(&self, operation: &str, _percent: u8) -> Result<(), String> {
        if operation != "Rescanning..." || !self.armed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.entered
            .lock()
            .map_err(|_| "poisoned".to_string())?
            .send(())
            .map_err(|err| err.to_string())?;
        self.release
            .lock()
            .map_err(|_| "poisoned".to_string())?
            .recv()
            .map_err(|err| err.to_string())
    }
}

#[test]
fn running_rescan_blocks_imports_and_can_be_aborted() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let sink = Arc::new(GateSink {
        armed: AtomicBool::new(true),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let wallet = Wallet::open(
        WalletConfig::for_network(Network::Regtest),
        MemoryStore::new(),
        short_chain(),
    )
    .expect("open wallet")
    .with_progress_sink(sink);
    let wif = secret(1).to_wif(Network::Regtest);

    thread::scope(|scope| {
        let scan = scope.spawn(|| wallet.import_privkey(&wif, "scan", true));
        entered_rx.recv().expect("rescan started");
        assert!(wallet.is_scanning());

        let err = dispatch(
            &wallet,
            "importmulti",
            &[json!([{"scriptPubKey": {"address": address(2)}, "timestamp": "now", "watchonly": true}])],
        )
        .expect_err("busy");
        assert!(err.is_rpc(
            RpcErrorCode::WalletError,
            "Wallet is currently rescanning. Abort existing rescan or wait."
        ));
        let err = wallet
            .import_privkey(&secret(3).to_wif(Network::Regtest), "", true)
            .expect_err("busy");
        assert_eq!(err.code(), RpcErrorCode::WalletError);

        assert!(wallet.abort_rescan());
        assert!(!wallet.abort_rescan());
        release_tx.send(()).expect("release");

        let err = scan.join().expect("scan thread").expect_err("aborted");
        assert!(err.is_rpc(RpcErrorCode::MiscError, "Rescan aborted by user."));
    });

    assert!(!wallet.is_scanning());
    assert!(!wallet.abort_rescan());
    let imported = wallet
        .with_state(|state| state.have_key(&secret(1).key_id().expect("id")))
        .expect("state");
    assert!(imported, "key stays imported after an aborted rescan");
    assert_eq!(
        dispatch(&wallet, "abortrescan", &[]).expect("abortrescan"),
        json!(false)
    );
}

/// Memory store whose writes can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.inner.scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.inner.for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write_batch(batch)
    }
}

#[test]
fn failed_store_write_leaves_state_untouched() {
    let store = Arc::new(FlakyStore::default());
    let wallet = Wallet::open(
        WalletConfig::for_network(Network::Regtest),
        Arc::clone(&store),
        short_chain(),
    )
    .expect("open wallet");
    store.failing.store(true, Ordering::SeqCst);

    let results = dispatch(
        &wallet,
        "importmulti",
        &[json!([
            {"scriptPubKey": {"address": address(4)}, "timestamp": "now", "watchonly": true, "label": "w"},
            {"scriptPubKey": {"address": address(5)}, "timestamp": "now", "keys": [secret(5).to_wif(Network::Regtest)]},
        ])],
    )
    .expect("importmulti");
    let results = results.as_array().expect("array");
    for result in results {
        assert_eq!(result["success"], json!(false));
        assert_eq!(result["error"]["code"], json!(-4));
    }

    let err = wallet
        .import_privkey(&secret(6).to_wif(Network::Regtest), "", false)
        .expect_err("store down");
    assert_eq!(err.code(), RpcErrorCode::WalletError);

    let (keys, watched, labels) = wallet
        .with_state(|state| {
            let dest = secret(4).key_id().expect("id").destination();
            (
                state.keys().count(),
                state.watch_scripts().count(),
                state.label(&dest).is_some(),
            )
        })
        .expect("state");
    assert_eq!((keys, watched, labels), (0, 0, false));

    store.failing.store(false, Ordering::SeqCst);
    wallet
        .import_privkey(&secret(6).to_wif(Network::Regtest), "", false)
        .expect("store back");
    let reopened = Wallet::open(
        WalletConfig::for_network(Network::Regtest),
        Arc::clone(&store),
        short_chain(),
    )
    .expect("reopen");
    let keys = reopened
        .with_state(|state| state.keys().count())
        .expect("state");
    assert_eq!(keys, 1);
}
