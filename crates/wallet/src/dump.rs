//! Plaintext key dumps: `dumpwallet` writes them, `importwallet` reads them.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use fluxd_consensus::{chain_params, Network};
use fluxd_log::{wallet_log, Level};
use fluxd_primitives::hash::hash256_to_display_hex;
use fluxd_primitives::{format_iso8601, parse_iso8601};
use fluxd_storage::KeyValueStore;

use crate::bip32::ExtendedPrivKey;
use crate::chain::BlockRef;
use crate::error::WalletError;
use crate::keys::{parse_hex, KeyId, KeyMetadata, KeyRecord, ScriptId, Secret};
use crate::keystore::{WalletState, HD_SEED_KEYPATH};
use crate::script::extract_destination;
use crate::wallet::{current_unix_seconds, Wallet};

const IMPORT_PROGRESS: &str = "Importing...";

pub fn encode_dump_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte <= 32 || byte >= 128 || byte == b'%' {
            let _ = write!(out, "%{byte:02x}");
        } else {
            out.push(char::from(byte));
        }
    }
    out
}

pub fn decode_dump_string(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut pos = 0usize;
    while pos < bytes.len() {
        if bytes[pos] == b'%' && pos + 2 < bytes.len() {
            let hi = char::from(bytes[pos + 1]).to_digit(16);
            let lo = char::from(bytes[pos + 2]).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(((hi << 4) | lo) as u8);
                pos += 3;
                continue;
            }
        }
        out.push(bytes[pos]);
        pos += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// One data line of a dump.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DumpRecord {
    Key {
        secret: Secret,
        time: i64,
        /// `None` for change and reserve keys, which get no address-book entry.
        label: Option<String>,
    },
    Script {
        script: Vec<u8>,
        time: i64,
        watch_only: bool,
    },
}

pub fn parse_dump_line(line: &str, network: Network) -> Option<DumpRecord> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < 2 {
        return None;
    }
    let annotations = fields[2..]
        .iter()
        .take_while(|field| !field.starts_with('#'));
    if let Some(secret) = Secret::from_wif(fields[0], network) {
        let mut label = Some(String::new());
        for field in annotations {
            match *field {
                "change=1" | "reserve=1" => label = None,
                _ => {
                    if let Some(raw) = field.strip_prefix("label=") {
                        label = Some(decode_dump_string(raw));
                    }
                }
            }
        }
        return Some(DumpRecord::Key {
            secret,
            time: parse_iso8601(fields[1]),
            label,
        });
    }
    let script = parse_hex(fields[0])?;
    let watch_only = annotations.into_iter().any(|field| *field == "watchonly=1");
    Some(DumpRecord::Script {
        script,
        time: parse_iso8601(fields[1]),
        watch_only,
    })
}

pub fn parse_dump(contents: &str, network: Network) -> Vec<DumpRecord> {
    contents
        .lines()
        .filter_map(|line| parse_dump_line(line, network))
        .collect()
}

pub struct DumpHeader {
    pub created: i64,
    pub tip: Option<BlockRef>,
}

/// Renders the committed state as a dump.
pub fn render_dump(
    state: &WalletState,
    network: Network,
    header: &DumpHeader,
) -> Result<String, WalletError> {
    let mut out = String::new();
    let params = chain_params(network);
    let _ = writeln!(
        out,
        "# Wallet dump created by {} {}",
        params.client_name,
        env!("CARGO_PKG_VERSION")
    );
    let _ = writeln!(out, "# * Created on {}", format_iso8601(header.created));
    if let Some(tip) = header.tip {
        let _ = writeln!(
            out,
            "# * Best block at time of backup was {} ({}),",
            tip.height,
            hash256_to_display_hex(&tip.hash)
        );
        let _ = writeln!(out, "#   mined on {}", format_iso8601(tip.time));
    }
    out.push('\n');

    let seed_id = state.hd_seed();
    if let Some(seed) = seed_id.and_then(|id| state.key_record(&id)?.secret.clone()) {
        let master = ExtendedPrivKey::from_seed(seed.bytes())?;
        let _ = writeln!(
            out,
            "# extended private masterkey: {}\n",
            master.encode(network)
        );
    }

    let mut births: Vec<(i64, KeyId, &KeyRecord)> = state
        .keys()
        .filter(|(_, record)| record.has_secret())
        .map(|(id, record)| (record.meta.create_time, *id, record))
        .collect();
    births.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    for (time, id, record) in births {
        let Some(secret) = &record.secret else {
            continue;
        };
        let dest = id.destination();
        let annotation = match state.label(&dest) {
            Some(label) => format!("label={}", encode_dump_string(label)),
            None if Some(id) == seed_id => "hdseed=1".to_string(),
            None if record.meta.hd_keypath.as_deref() == Some(HD_SEED_KEYPATH) => {
                "inactivehdseed=1".to_string()
            }
            None if state.in_keypool(&id) => "reserve=1".to_string(),
            None => "change=1".to_string(),
        };
        let keypath = record
            .meta
            .origin
            .as_ref()
            .map(|origin| format!(" hdkeypath={}", origin.format_path()))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{} {} {annotation} # addr={}{keypath}",
            secret.to_wif(network),
            format_iso8601(time),
            dest.encode(network)
        );
    }
    out.push('\n');

    for (id, entry) in state.redeem_scripts() {
        let time = entry
            .create_time
            .map_or_else(|| "0".to_string(), format_iso8601);
        let _ = writeln!(
            out,
            "{} {time} script=1 # addr={}",
            hex::encode(&entry.script),
            id.destination().encode(network)
        );
    }
    for (script, time) in state.watch_scripts() {
        let address = extract_destination(script)
            .map(|dest| format!(" # addr={}", dest.encode(network)))
            .unwrap_or_default();
        let time = if *time > 0 {
            format_iso8601(*time)
        } else {
            "0".to_string()
        };
        let _ = writeln!(out, "{} {time} watchonly=1{address}", hex::encode(script));
    }
    out.push('\n');
    out.push_str("# End of dump\n");
    Ok(out)
}

impl<S: KeyValueStore> Wallet<S> {
    /// Writes every private key and script to a new file at `path` and
    /// returns the absolute path written.
    pub fn dump_wallet(&self, path: &Path) -> Result<PathBuf, WalletError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        if path.exists() {
            return Err(WalletError::invalid_parameter(format!(
                "{} already exists. If you are sure this is what you want, move it out of the way first",
                path.display()
            )));
        }
        let contents = {
            let state = self.lock_state()?;
            let header = DumpHeader {
                created: current_unix_seconds(),
                tip: self.tip()?,
            };
            render_dump(&state, self.network(), &header)?
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|_| WalletError::invalid_parameter("Cannot open wallet dump file"))?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        wallet_log!(Level::Info, self.name(), "Wallet dumped to {}", path.display());
        Ok(path)
    }

    /// Restores a dump, then rescans from the earliest restored birth time.
    pub fn import_wallet(&self, path: &Path) -> Result<(), WalletError> {
        if self.have_pruned()? {
            return Err(WalletError::wallet(
                "Importing wallets is disabled when blocks are pruned",
            ));
        }
        let reservation = self.reserve_rescan_or_fail()?;
        let network = self.network();

        let mut time_begin;
        let mut all_added = true;
        {
            let mut state = self.lock_state()?;
            let contents = fs::read_to_string(path)
                .map_err(|_| WalletError::invalid_parameter("Cannot open wallet dump file"))?;
            time_begin = self.tip()?.map_or(0, |tip| tip.time);

            self.report_progress(IMPORT_PROGRESS, 0);
            let total_bytes = contents.len().max(1);
            let mut read_bytes = 0usize;
            let mut records = Vec::new();
            for line in contents.lines() {
                read_bytes += line.len() + 1;
                let percent = (read_bytes * 100 / total_bytes).clamp(1, 50);
                self.report_progress(IMPORT_PROGRESS, percent as u8);
                records.extend(parse_dump_line(line, network));
            }

            let has_keys = records
                .iter()
                .any(|record| matches!(record, DumpRecord::Key { .. }));
            if has_keys && self.private_keys_disabled() {
                self.report_progress(IMPORT_PROGRESS, 100);
                return Err(WalletError::wallet(
                    "Importing wallets is disabled when private keys are disabled",
                ));
            }

            let total = records.len().max(1);
            let mut keys_first: Vec<&DumpRecord> = records
                .iter()
                .filter(|record| matches!(record, DumpRecord::Key { .. }))
                .collect();
            keys_first.extend(
                records
                    .iter()
                    .filter(|record| matches!(record, DumpRecord::Script { .. })),
            );
            for (done, record) in keys_first.into_iter().enumerate() {
                let percent = (done * 100 / total + 50).clamp(50, 75);
                self.report_progress(IMPORT_PROGRESS, percent as u8);
                match self.restore_record(&mut state, record)? {
                    Restored::Added(Some(time)) => time_begin = time_begin.min(time),
                    Restored::Added(None) | Restored::Skipped => {}
                    Restored::Failed => all_added = false,
                }
            }
            self.report_progress(IMPORT_PROGRESS, 100);

            let first_key_time = time_begin;
            if let Err(err) = self.stage_locked(&mut state, |staged| {
                staged.update_first_key_time(first_key_time);
                Ok(())
            }) {
                wallet_log!(Level::Warn, self.name(), "Failed to record first key time: {err}");
                all_added = false;
            }
        }

        crate::commands::rescan_wallet(self, &reservation, time_begin, false)?;
        if !all_added {
            return Err(WalletError::wallet("Error adding some keys/scripts to wallet"));
        }
        Ok(())
    }

    fn restore_record(
        &self,
        state: &mut WalletState,
        record: &DumpRecord,
    ) -> Result<Restored, WalletError> {
        let network = self.network();
        match record {
            DumpRecord::Key {
                secret,
                time,
                label,
            } => {
                let id = secret.key_id()?;
                let address = id.destination().encode(network);
                if state.have_key(&id) {
                    wallet_log!(
                        Level::Info,
                        self.name(),
                        "Skipping import of {address} (key already present)"
                    );
                    return Ok(Restored::Skipped);
                }
                wallet_log!(Level::Info, self.name(), "Importing {address}...");
                let meta = match state.key_record(&id) {
                    Some(existing) => KeyMetadata {
                        create_time: existing.meta.create_time.min(*time),
                        ..existing.meta.clone()
                    },
                    None => KeyMetadata::with_time(*time),
                };
                let key = KeyRecord::from_secret(secret.clone(), meta)?;
                let added = self.stage_locked(state, |staged| {
                    staged.put_key(key);
                    if let Some(label) = label {
                        staged.set_label(id.destination(), label);
                    }
                    Ok(())
                });
                match added {
                    Ok(()) => Ok(Restored::Added(Some(*time))),
                    Err(err) => {
                        wallet_log!(Level::Warn, self.name(), "Error importing key {address}: {err}");
                        Ok(Restored::Failed)
                    }
                }
            }
            DumpRecord::Script {
                script,
                time,
                watch_only,
            } => {
                let script_hex = hex::encode(script);
                let present = if *watch_only {
                    state.watch_time(script).is_some()
                } else {
                    state.have_redeem_script(&ScriptId::of_script(script))
                };
                if present {
                    wallet_log!(
                        Level::Info,
                        self.name(),
                        "Skipping import of {script_hex} (script already present)"
                    );
                    return Ok(Restored::Skipped);
                }
                let birth = (*time > 0).then_some(*time);
                let added = self.stage_locked(state, |staged| {
                    if *watch_only {
                        staged.add_watch(script, birth.unwrap_or(0));
                    } else {
                        staged.add_redeem_script(script, birth);
                    }
                    Ok(())
                });
                match added {
                    Ok(()) => Ok(Restored::Added(birth)),
                    Err(err) => {
                        wallet_log!(
                            Level::Warn,
                            self.name(),
                            "Error importing script {script_hex}: {err}"
                        );
                        Ok(Restored::Failed)
                    }
                }
            }
        }
    }
}

enum Restored {
    Added(Option<i64>),
    Skipped,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fluxd_storage::MemoryStore;

    use crate::chain::MemoryChain;
    use crate::config::WalletConfig;
    use crate::keys::tests::test_secret;
    use crate::keys::KeyOrigin;

    #[test]
    fn escapes_control_high_and_percent_bytes() {
        assert_eq!(encode_dump_string("a b%c"), "a%20b%25c");
        assert_eq!(encode_dump_string("tab\there"), "tab%09here");
        assert_eq!(encode_dump_string("é"), "%c3%a9");
        for original in ["a b%c", "", "%", "100%", "line\nbreak", "naïve label", "%%%"] {
            assert_eq!(decode_dump_string(&encode_dump_string(original)), original);
        }
    }

    #[test]
    fn truncated_escape_is_kept_verbatim() {
        assert_eq!(decode_dump_string("abc%4"), "abc%4");
        assert_eq!(decode_dump_string("%zz1"), "%zz1");
        assert_eq!(decode_dump_string("%41%42"), "AB");
    }

    #[test]
    fn key_lines_carry_label_flags() {
        let wif = test_secret(1).to_wif(Network::Regtest);
        let line = format!("{wif} 2019-01-01T00:00:00Z label=hot%20one # addr=x");
        match parse_dump_line(&line, Network::Regtest) {
            Some(DumpRecord::Key { time, label, .. }) => {
                assert_eq!(time, 1_546_300_800);
                assert_eq!(label.as_deref(), Some("hot one"));
            }
            other => panic!("unexpected record {other:?}"),
        }

        let line = format!("{wif} 2019-01-01T00:00:00Z change=1 # label=ignored");
        assert!(matches!(
            parse_dump_line(&line, Network::Regtest),
            Some(DumpRecord::Key { label: None, .. })
        ));

        let line = format!("{wif} garbage");
        assert!(matches!(
            parse_dump_line(&line, Network::Regtest),
            Some(DumpRecord::Key { time: 0, label: Some(_), .. })
        ));
    }

    #[test]
    fn script_lines_and_noise() {
        assert_eq!(
            parse_dump_line("51ab 0 script=1 # addr=x", Network::Regtest),
            Some(DumpRecord::Script {
                script: vec![0x51, 0xab],
                time: 0,
                watch_only: false,
            })
        );
        assert!(matches!(
            parse_dump_line("51ab 0 watchonly=1", Network::Regtest),
            Some(DumpRecord::Script { watch_only: true, .. })
        ));
        assert_eq!(parse_dump_line("# comment", Network::Regtest), None);
        assert_eq!(parse_dump_line("", Network::Regtest), None);
        assert_eq!(parse_dump_line("lonely", Network::Regtest), None);
        assert_eq!(parse_dump_line("zz 0 script=1", Network::Regtest), None);
    }

    #[test]
    fn restored_secret_keeps_metadata_of_watched_pubkey() {
        let wallet = Wallet::open(
            WalletConfig::for_network(Network::Regtest),
            MemoryStore::new(),
            Arc::new(MemoryChain::new()),
        )
        .expect("open wallet");
        let secret = test_secret(3);
        let id = secret.key_id().expect("id");
        let origin = KeyOrigin {
            fingerprint: [1, 2, 3, 4],
            path: vec![0, 7],
        };
        wallet
            .stage(|staged| {
                staged.put_key(KeyRecord::watch_only(
                    secret.pubkey_bytes()?,
                    KeyMetadata {
                        create_time: 500,
                        hd_keypath: Some("m/0/7".to_string()),
                        origin: Some(origin.clone()),
                        ..KeyMetadata::default()
                    },
                ));
                Ok(())
            })
            .expect("watched pubkey");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("restore.txt");
        fs::write(
            &path,
            format!("{} 2019-01-01T00:00:00Z label=\n", secret.to_wif(Network::Regtest)),
        )
        .expect("write dump");
        wallet.import_wallet(&path).expect("restore");

        let record = wallet
            .with_state(|state| state.key_record(&id).cloned())
            .expect("state")
            .expect("key record");
        assert!(record.has_secret());
        assert_eq!(record.meta.origin, Some(origin));
        assert_eq!(record.meta.hd_keypath.as_deref(), Some("m/0/7"));
        assert_eq!(record.meta.create_time, 500);
    }
}
