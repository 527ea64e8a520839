use std::collections::BTreeSet;
use std::fs;
use std::sync::{Arc, Mutex};

use fluxd_consensus::Network;
use fluxd_storage::MemoryStore;
use fluxd_wallet::{
    decode_dump_string, encode_dump_string, KeyId, MemoryChain, ProgressSink, RpcErrorCode,
    ScriptId, Secret, Wallet, WalletConfig,
};

fn secret(seed: u8) -> Secret {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x24;
    bytes[31] = seed;
    Secret::new(bytes, true).expect("secret")
}

fn pubkey(seed: u8) -> Vec<u8> {
    secret(seed).pubkey_bytes().expect("pubkey")
}

fn chain_with_tip() -> Arc<MemoryChain> {
    let chain = Arc::new(MemoryChain::new());
    chain.append(Vec::new(), 1_600_000_000).expect("block");
    chain
}

fn open(chain: Arc<MemoryChain>) -> Wallet<MemoryStore> {
    Wallet::open(
        WalletConfig::for_network(Network::Regtest),
        MemoryStore::new(),
        chain,
    )
    .expect("open wallet")
}

struct Snapshot {
    keys: BTreeSet<KeyId>,
    labels: Vec<(KeyId, Option<String>)>,
    watched: BTreeSet<Vec<u8>>,
    redeem: BTreeSet<ScriptId>,
}

fn snapshot(wallet: &Wallet<MemoryStore>) -> Snapshot {
    wallet
        .with_state(|state| {
            let keys: BTreeSet<KeyId> = state
                .keys()
                .filter(|(_, record)| record.has_secret())
                .map(|(id, _)| *id)
                .collect();
            let labels = keys
                .iter()
                .filter(|id| !state.in_keypool(id))
                .map(|id| (*id, state.label(&id.destination()).map(str::to_owned)))
                .collect();
            Snapshot {
                keys,
                labels,
                watched: state.watch_scripts().map(|(script, _)| script.clone()).collect(),
                redeem: state.redeem_scripts().map(|(id, _)| *id).collect(),
            }
        })
        .expect("state")
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(String, u8)>>,
}

impl ProgressSink for RecordingSink {
    fn report(&self, operation: &str, percent: u8) -> Result<(), String> {
        self.reports
            .lock()
            .map_err(|_| "poisoned".to_string())?
            .push((operation.to_string(), percent));
        Ok(())
    }
}

#[test]
fn dump_then_import_restores_keys_labels_and_scripts() {
    let source = open(chain_with_tip());
    source
        .import_privkey(&secret(1).to_wif(Network::Regtest), "savings a b%c", false)
        .expect("key 1");
    source
        .import_privkey(&secret(2).to_wif(Network::Regtest), "", false)
        .expect("key 2");
    source.top_up_keypool(Some(2)).expect("keypool");
    let watched = KeyId::of_pubkey(&pubkey(3)).destination().encode(Network::Regtest);
    source
        .import_address(&watched, "watch", false, false)
        .expect("watch");
    let redeem = {
        let mut script = vec![0x52];
        for seed in [4u8, 5] {
            let key = pubkey(seed);
            script.push(key.len() as u8);
            script.extend_from_slice(&key);
        }
        script.extend_from_slice(&[0x52, 0xae]);
        script
    };
    source
        .import_address(&hex::encode(&redeem), "", false, true)
        .expect("redeem");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("wallet.dump");
    let written = source.dump_wallet(&path).expect("dump");
    assert_eq!(written, path);
    let contents = fs::read_to_string(&path).expect("read dump");
    assert!(contents.starts_with("# Wallet dump created by fluxd-rust"));
    assert!(contents.contains("label=savings%20a%20b%25c"));
    assert!(contents.contains("reserve=1"));
    assert!(contents.contains(" script=1 # addr="));
    assert!(contents.trim_end().ends_with("# End of dump"));

    let sink = Arc::new(RecordingSink::default());
    let target = open(chain_with_tip()).with_progress_sink(sink.clone());
    target.import_wallet(&path).expect("import");

    let before = snapshot(&source);
    let after = snapshot(&target);
    assert_eq!(after.keys, before.keys);
    assert_eq!(after.watched, before.watched);
    assert_eq!(after.redeem, before.redeem);
    for (id, label) in &before.labels {
        let restored = after
            .labels
            .iter()
            .find(|(other, _)| other == id)
            .map(|(_, label)| label.clone());
        assert_eq!(restored, Some(label.clone()), "label of {id:?}");
    }

    let reports = sink.reports.lock().expect("reports");
    let importing: Vec<u8> = reports
        .iter()
        .filter(|(operation, _)| operation == "Importing...")
        .map(|(_, percent)| *percent)
        .collect();
    assert_eq!(importing.first(), Some(&0));
    assert_eq!(importing.last(), Some(&100));
    assert!(importing.iter().filter(|p| **p != 100).all(|p| *p <= 75));
}

#[test]
fn dump_refuses_existing_file() {
    let wallet = open(chain_with_tip());
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("taken.txt");
    fs::write(&path, "keep me").expect("write");
    let err = wallet.dump_wallet(&path).expect_err("existing");
    assert_eq!(err.code(), RpcErrorCode::InvalidParameter);
    assert!(err.to_string().ends_with("already exists. If you are sure this is what you want, move it out of the way first"));
    assert_eq!(fs::read_to_string(&path).expect("read"), "keep me");
}

#[test]
fn import_rejections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wallet = open(chain_with_tip());
    let err = wallet
        .import_wallet(&dir.path().join("missing.txt"))
        .expect_err("missing file");
    assert!(err.is_rpc(RpcErrorCode::InvalidParameter, "Cannot open wallet dump file"));

    let path = dir.path().join("keys.txt");
    fs::write(
        &path,
        format!(
            "# header\n{} 2020-01-01T00:00:00Z label=\n",
            secret(9).to_wif(Network::Regtest)
        ),
    )
    .expect("write");
    wallet.set_private_keys_disabled(true).expect("flag");
    let err = wallet.import_wallet(&path).expect_err("no private keys");
    assert!(err.is_rpc(
        RpcErrorCode::WalletError,
        "Importing wallets is disabled when private keys are disabled"
    ));

    let chain = chain_with_tip();
    chain.append(Vec::new(), 1_600_000_100).expect("block");
    chain.prune_below(1).expect("prune");
    let pruned = open(chain);
    let err = pruned.import_wallet(&path).expect_err("pruned");
    assert!(err.is_rpc(
        RpcErrorCode::WalletError,
        "Importing wallets is disabled when blocks are pruned"
    ));
}

#[test]
fn restore_skips_keys_already_present() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("one.txt");
    let wif = secret(10).to_wif(Network::Regtest);
    fs::write(&path, format!("{wif} 2021-06-01T00:00:00Z label=new\n")).expect("write");

    let wallet = open(chain_with_tip());
    wallet.import_privkey(&wif, "old", false).expect("import");
    wallet.import_wallet(&path).expect("restore");
    let dest = secret(10).key_id().expect("id").destination();
    let label = wallet
        .with_state(|state| state.label(&dest).map(str::to_owned))
        .expect("state");
    assert_eq!(label.as_deref(), Some("old"));
}

#[test]
fn escaping_round_trips() {
    for input in ["a b%c", "tab\there", "naïve €", "\u{1}\u{7f}", "%%", ""] {
        let encoded = encode_dump_string(input);
        assert!(!encoded.contains(' '), "{encoded}");
        assert_eq!(decode_dump_string(&encoded), input);
    }
    assert_eq!(encode_dump_string("a b%c"), "a%20b%25c");
}
