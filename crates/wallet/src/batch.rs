//! `importmulti`: many items, one lock, at most one rescan.

use fluxd_consensus::constants::TIMESTAMP_WINDOW;
use fluxd_log::{wallet_log, Level};
use fluxd_storage::KeyValueStore;
use serde::Serialize;

use crate::error::{RpcFailure, WalletError};
use crate::import::{process_import, ImportRequest};
use crate::wallet::Wallet;

const MINIMUM_TIMESTAMP: i64 = 1;

/// The `timestamp` field of one item as it arrived.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TimestampSpec {
    Missing,
    Now,
    At(i64),
    /// Wrong JSON type; holds the type name for the error message.
    Invalid(&'static str),
}

impl TimestampSpec {
    pub fn resolve(&self, now: i64) -> Result<i64, WalletError> {
        match self {
            TimestampSpec::Missing => Err(WalletError::type_error(
                "Missing required timestamp field for key",
            )),
            TimestampSpec::Now => Ok(now),
            TimestampSpec::At(time) => Ok(*time),
            TimestampSpec::Invalid(type_name) => Err(WalletError::type_error(format!(
                "Expected number or \"now\" timestamp value for key. got type {type_name}"
            ))),
        }
    }
}

/// One batch entry. A request that could not be read from its wire form
/// still occupies its position and fails on its own.
#[derive(Debug)]
pub struct ImportItem {
    pub timestamp: TimestampSpec,
    pub request: Result<ImportRequest, WalletError>,
}

impl ImportItem {
    pub fn new(timestamp: TimestampSpec, request: ImportRequest) -> Self {
        Self {
            timestamp,
            request: Ok(request),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ImportResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFailure>,
}

impl ImportResult {
    pub fn succeeded(warnings: Vec<String>) -> Self {
        Self {
            success: true,
            warnings,
            error: None,
        }
    }

    pub fn failed(error: impl Into<RpcFailure>) -> Self {
        Self {
            success: false,
            warnings: Vec::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BatchOptions {
    pub rescan: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { rescan: true }
    }
}

fn rescan_gap_error(timestamp: i64, scanned_time: i64) -> RpcFailure {
    RpcFailure::from(WalletError::misc(format!(
        "Rescan failed for key with creation timestamp {timestamp}. There was an error reading a \
         block from time {}, which is after or within {TIMESTAMP_WINDOW} seconds of key creation, and \
         could contain transactions pertaining to the key. As a result, transactions \
         and coins using this key may not appear in the wallet. This error could be \
         caused by pruning or data corruption (see fluxd log for details) and could \
         be dealt with by downloading and rescanning the relevant blocks (see -reindex \
         and -rescan options).",
        scanned_time - TIMESTAMP_WINDOW - 1
    )))
}

impl<S: KeyValueStore> Wallet<S> {
    /// Imports every item in order and returns one result per item.
    ///
    /// Timestamp errors reject the whole call before anything is written;
    /// every other error belongs to its item.
    pub fn import_multi(
        &self,
        items: &[ImportItem],
        options: BatchOptions,
    ) -> Result<Vec<ImportResult>, WalletError> {
        let reservation = if options.rescan {
            Some(self.reserve_rescan_or_fail()?)
        } else {
            None
        };

        let tip = self.tip()?;
        let now = tip.map_or(0, |tip| tip.median_time_past);
        let timestamps = items
            .iter()
            .map(|item| item.timestamp.resolve(now))
            .collect::<Result<Vec<_>, _>>()?;

        let mut rescan = reservation.is_some() && tip.is_some();
        let mut lowest_timestamp = tip.map_or(0, |tip| tip.time);
        let mut any_success = false;
        let ctx = self.import_context();

        let mut results = Vec::with_capacity(items.len());
        {
            let mut state = self.lock_state()?;
            for (item, requested) in items.iter().zip(&timestamps) {
                let timestamp = (*requested).max(MINIMUM_TIMESTAMP);
                let outcome = match &item.request {
                    Ok(request) => self.stage_locked(&mut state, |staged| {
                        process_import(staged, request, timestamp, &ctx)
                    }),
                    Err(err) => Err(WalletError::rpc(err.code(), err.to_string())),
                };
                let result = match outcome {
                    Ok(warnings) => {
                        any_success = true;
                        ImportResult::succeeded(warnings)
                    }
                    Err(err) => {
                        wallet_log!(Level::Debug, self.name(), "importmulti item failed: {err}");
                        ImportResult::failed(&err)
                    }
                };
                results.push(result);
                lowest_timestamp = lowest_timestamp.min(timestamp);
            }
        }
        rescan &= any_success && !items.is_empty();

        let Some(reservation) = reservation.filter(|_| rescan) else {
            return Ok(results);
        };
        let scanned_time = self.rescan_from_time(lowest_timestamp, &reservation, true)?;
        if self.is_aborting_rescan() {
            return Err(WalletError::misc("Rescan aborted by user."));
        }
        if scanned_time > lowest_timestamp {
            for (result, requested) in results.iter_mut().zip(&timestamps) {
                if scanned_time <= *requested || result.error.is_some() {
                    continue;
                }
                *result = ImportResult::failed(rescan_gap_error(*requested, scanned_time));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fluxd_consensus::Network;
    use fluxd_storage::MemoryStore;

    use crate::chain::MemoryChain;
    use crate::config::WalletConfig;
    use crate::error::RpcErrorCode;
    use crate::import::{LegacyImport, ScriptTarget};
    use crate::keys::tests::test_pubkey;
    use crate::keys::KeyId;

    fn wallet_on(chain: Arc<MemoryChain>) -> Wallet<MemoryStore> {
        Wallet::open(
            WalletConfig::for_network(Network::Regtest),
            MemoryStore::new(),
            chain,
        )
        .expect("open")
    }

    fn watch_item(seed: u8, timestamp: TimestampSpec) -> ImportItem {
        let address = KeyId::of_pubkey(&test_pubkey(seed))
            .destination()
            .encode(Network::Regtest);
        let mut request = ImportRequest::legacy(LegacyImport {
            script_pub_key: Some(ScriptTarget::Address(address)),
            ..LegacyImport::default()
        });
        request.watchonly = true;
        ImportItem::new(timestamp, request)
    }

    #[test]
    fn timestamp_errors_reject_the_whole_batch() {
        let wallet = wallet_on(Arc::new(MemoryChain::new()));
        let items = vec![
            watch_item(1, TimestampSpec::Now),
            watch_item(2, TimestampSpec::Invalid("string")),
        ];
        let err = wallet
            .import_multi(&items, BatchOptions::default())
            .expect_err("bad timestamp");
        assert!(err.is_rpc(
            RpcErrorCode::TypeError,
            "Expected number or \"now\" timestamp value for key. got type string"
        ));
        assert_eq!(wallet.with_state(|s| s.watch_scripts().count()).expect("state"), 0);

        let items = vec![watch_item(1, TimestampSpec::Missing)];
        let err = wallet
            .import_multi(&items, BatchOptions::default())
            .expect_err("missing timestamp");
        assert!(err.is_rpc(RpcErrorCode::TypeError, "Missing required timestamp field for key"));
    }

    #[test]
    fn results_follow_input_order() {
        let chain = Arc::new(MemoryChain::new());
        chain.append(Vec::new(), 10_000).expect("append");
        let wallet = wallet_on(chain);
        let mut bad = watch_item(3, TimestampSpec::At(5));
        if let Ok(request) = &mut bad.request {
            request.internal = true;
            request.label = Some("change".to_string());
        }
        let items = vec![
            watch_item(1, TimestampSpec::Now),
            bad,
            ImportItem {
                timestamp: TimestampSpec::At(7),
                request: Err(WalletError::misc("Missing required fields")),
            },
            watch_item(4, TimestampSpec::At(0)),
        ];
        let results = wallet
            .import_multi(&items, BatchOptions::default())
            .expect("batch");
        assert_eq!(results.len(), 4);
        assert!(results[0].success);
        assert_eq!(
            results[1].error.as_ref().map(|e| e.kind()),
            Some(Some(RpcErrorCode::InvalidParameter))
        );
        assert_eq!(
            results[2].error.as_ref().map(|e| e.message.as_str()),
            Some("Missing required fields")
        );
        assert!(results[3].success);
    }

    #[test]
    fn no_tip_disables_rescan_silently() {
        let wallet = wallet_on(Arc::new(MemoryChain::new()));
        let results = wallet
            .import_multi(&[watch_item(1, TimestampSpec::Now)], BatchOptions::default())
            .expect("batch");
        assert_eq!(results, vec![ImportResult::succeeded(Vec::new())]);
        assert!(!wallet.is_scanning());
    }

    #[test]
    fn concurrent_rescan_blocks_batch() {
        let wallet = wallet_on(Arc::new(MemoryChain::new()));
        let _held = wallet.reserve_rescan().expect("reserve");
        let err = wallet
            .import_multi(&[watch_item(1, TimestampSpec::Now)], BatchOptions::default())
            .expect_err("busy");
        assert!(err.is_rpc(
            RpcErrorCode::WalletError,
            "Wallet is currently rescanning. Abort existing rescan or wait."
        ));
        wallet
            .import_multi(
                &[watch_item(1, TimestampSpec::Now)],
                BatchOptions { rescan: false },
            )
            .expect("no rescan needed");
    }

    #[test]
    fn result_json_omits_empty_fields() {
        let value = serde_json::to_value(ImportResult::succeeded(Vec::new())).expect("json");
        assert_eq!(value, serde_json::json!({"success": true}));
        let value = serde_json::to_value(ImportResult::failed(RpcFailure::new(
            RpcErrorCode::InvalidParameter,
            "bad",
        )))
        .expect("json");
        assert_eq!(
            value,
            serde_json::json!({"success": false, "error": {"code": -8, "message": "bad"}})
        );
    }
}
