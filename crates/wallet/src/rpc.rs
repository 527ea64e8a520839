//! JSON-RPC boundary for the import and dump commands.
//!
//! Parameters arrive as positional `serde_json::Value`s. Each handler checks
//! their shape, calls the typed wallet API and renders the result.

use std::path::Path;

use fluxd_storage::KeyValueStore;
use serde_json::{json, Map, Value};

use crate::batch::{BatchOptions, ImportItem, TimestampSpec};
use crate::error::{RpcErrorCode, WalletError};
use crate::import::{
    DescriptorImport, ImportForm, ImportRequest, LegacyImport, RangeSpec, ScriptTarget,
};
use crate::wallet::Wallet;

pub fn dispatch<S: KeyValueStore>(
    wallet: &Wallet<S>,
    method: &str,
    params: &[Value],
) -> Result<Value, WalletError> {
    match method {
        "abortrescan" => rpc_abortrescan(wallet, params),
        "dumpprivkey" => rpc_dumpprivkey(wallet, params),
        "dumpwallet" => rpc_dumpwallet(wallet, params),
        "importaddress" => rpc_importaddress(wallet, params),
        "importmulti" => rpc_importmulti(wallet, params),
        "importprivkey" => rpc_importprivkey(wallet, params),
        "importprunedfunds" => rpc_importprunedfunds(wallet, params),
        "importpubkey" => rpc_importpubkey(wallet, params),
        "importwallet" => rpc_importwallet(wallet, params),
        "keypoolrefill" => rpc_keypoolrefill(wallet, params),
        "removeprunedfunds" => rpc_removeprunedfunds(wallet, params),
        _ => Err(WalletError::rpc(
            RpcErrorCode::MethodNotFound,
            format!("Method not found: {method}"),
        )),
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expected_type(expected: &str, got: &Value) -> WalletError {
    WalletError::type_error(format!(
        "Expected type {expected}, got {}",
        json_type_name(got)
    ))
}

fn ensure_param_count(params: &[Value], min: usize, max: usize, usage: &str) -> Result<(), WalletError> {
    if params.len() < min || params.len() > max {
        return Err(WalletError::misc(format!("usage: {usage}")));
    }
    Ok(())
}

fn param_str<'a>(params: &'a [Value], index: usize) -> Result<&'a str, WalletError> {
    match params.get(index) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(expected_type("string", other)),
        None => Err(expected_type("string", &Value::Null)),
    }
}

fn optional_str<'a>(params: &'a [Value], index: usize, default: &'a str) -> Result<&'a str, WalletError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(_) => param_str(params, index),
    }
}

fn optional_bool(params: &[Value], index: usize, default: bool) -> Result<bool, WalletError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(other) => Err(expected_type("bool", other)),
    }
}

fn rpc_abortrescan<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 0, 0, "abortrescan")?;
    Ok(Value::Bool(wallet.abort_rescan()))
}

fn rpc_importprivkey<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 1, 3, "importprivkey \"fluxprivkey\" ( \"label\" rescan )")?;
    let secret = param_str(params, 0)?;
    let label = optional_str(params, 1, "")?;
    let rescan = optional_bool(params, 2, wallet.config().rescan_on_import)?;
    wallet.import_privkey(secret, label, rescan)?;
    Ok(Value::Null)
}

fn rpc_importaddress<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(
        params,
        1,
        4,
        "importaddress \"address\" ( \"label\" rescan p2sh )",
    )?;
    let target = param_str(params, 0)?;
    let label = optional_str(params, 1, "")?;
    let rescan = optional_bool(params, 2, wallet.config().rescan_on_import)?;
    let p2sh = optional_bool(params, 3, false)?;
    wallet.import_address(target, label, rescan, p2sh)?;
    Ok(Value::Null)
}

fn rpc_importpubkey<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 1, 3, "importpubkey \"pubkey\" ( \"label\" rescan )")?;
    let pubkey = param_str(params, 0)?;
    let label = optional_str(params, 1, "")?;
    let rescan = optional_bool(params, 2, wallet.config().rescan_on_import)?;
    wallet.import_pubkey(pubkey, label, rescan)?;
    Ok(Value::Null)
}

fn rpc_importprunedfunds<S: KeyValueStore>(
    wallet: &Wallet<S>,
    params: &[Value],
) -> Result<Value, WalletError> {
    ensure_param_count(params, 2, 2, "importprunedfunds \"rawtransaction\" \"txoutproof\"")?;
    wallet.import_pruned_funds(param_str(params, 0)?, param_str(params, 1)?)?;
    Ok(Value::Null)
}

fn rpc_removeprunedfunds<S: KeyValueStore>(
    wallet: &Wallet<S>,
    params: &[Value],
) -> Result<Value, WalletError> {
    ensure_param_count(params, 1, 1, "removeprunedfunds \"txid\"")?;
    wallet.remove_pruned_funds(param_str(params, 0)?)?;
    Ok(Value::Null)
}

fn rpc_dumpprivkey<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 1, 1, "dumpprivkey \"t-addr\"")?;
    Ok(Value::String(wallet.dump_privkey(param_str(params, 0)?)?))
}

fn rpc_dumpwallet<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 1, 1, "dumpwallet \"filename\"")?;
    let path = wallet.dump_wallet(Path::new(param_str(params, 0)?))?;
    Ok(json!({ "filename": path.display().to_string() }))
}

fn rpc_importwallet<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 1, 1, "importwallet \"filename\"")?;
    wallet.import_wallet(Path::new(param_str(params, 0)?))?;
    Ok(Value::Null)
}

fn rpc_keypoolrefill<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 0, 1, "keypoolrefill ( newsize )")?;
    let target = match params.first() {
        None | Some(Value::Null) => None,
        Some(Value::Number(size)) => {
            let size = size.as_u64().ok_or_else(|| {
                WalletError::invalid_parameter("Invalid parameter, expected valid size.")
            })?;
            Some(usize::try_from(size).map_err(|_| {
                WalletError::invalid_parameter("Invalid parameter, expected valid size.")
            })?)
        }
        Some(other) => return Err(expected_type("number", other)),
    };
    wallet.top_up_keypool(target)?;
    Ok(Value::Null)
}

fn rpc_importmulti<S: KeyValueStore>(wallet: &Wallet<S>, params: &[Value]) -> Result<Value, WalletError> {
    ensure_param_count(params, 1, 2, "importmulti \"requests\" ( \"options\" )")?;
    let requests = match &params[0] {
        Value::Array(requests) => requests,
        other => return Err(expected_type("array", other)),
    };
    let options = match params.get(1) {
        None | Some(Value::Null) => BatchOptions::default(),
        Some(Value::Object(options)) => parse_batch_options(options)?,
        Some(other) => return Err(expected_type("object", other)),
    };
    let items: Vec<ImportItem> = requests.iter().map(parse_import_item).collect();
    let results = wallet.import_multi(&items, options)?;
    serde_json::to_value(results).map_err(|err| WalletError::misc(err.to_string()))
}

fn parse_batch_options(options: &Map<String, Value>) -> Result<BatchOptions, WalletError> {
    match options.get("rescan") {
        None | Some(Value::Null) => Ok(BatchOptions::default()),
        Some(Value::Bool(rescan)) => Ok(BatchOptions { rescan: *rescan }),
        Some(other) => Err(expected_type("bool", other)),
    }
}

/// Reads one `importmulti` entry. Shape errors inside the entry stay with
/// the entry; only the timestamp is checked for the whole batch.
pub fn parse_import_item(value: &Value) -> ImportItem {
    ImportItem {
        timestamp: parse_timestamp(value.get("timestamp")),
        request: parse_import_request(value),
    }
}

fn parse_timestamp(value: Option<&Value>) -> TimestampSpec {
    match value {
        None => TimestampSpec::Missing,
        Some(Value::Number(number)) => match number.as_i64() {
            Some(time) => TimestampSpec::At(time),
            None => number
                .as_f64()
                .map_or(TimestampSpec::Invalid("number"), |time| {
                    TimestampSpec::At(time as i64)
                }),
        },
        Some(Value::String(text)) if text == "now" => TimestampSpec::Now,
        Some(other) => TimestampSpec::Invalid(json_type_name(other)),
    }
}

fn missing_fields() -> WalletError {
    WalletError::misc("Missing required fields")
}

fn field_bool(fields: &Map<String, Value>, name: &str) -> Result<bool, WalletError> {
    match fields.get(name) {
        None => Ok(false),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(missing_fields()),
    }
}

fn field_str(fields: &Map<String, Value>, name: &str) -> Result<Option<String>, WalletError> {
    match fields.get(name) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(missing_fields()),
    }
}

fn field_str_array(fields: &Map<String, Value>, name: &str) -> Result<Vec<String>, WalletError> {
    match fields.get(name) {
        None => Ok(Vec::new()),
        Some(Value::Array(values)) => values
            .iter()
            .map(|value| value.as_str().map(str::to_owned).ok_or_else(missing_fields))
            .collect(),
        Some(_) => Err(missing_fields()),
    }
}

fn parse_script_target(value: &Value) -> Result<ScriptTarget, WalletError> {
    match value {
        Value::String(script) => Ok(ScriptTarget::Script(script.clone())),
        Value::Object(fields) => match fields.get("address") {
            Some(Value::String(address)) => Ok(ScriptTarget::Address(address.clone())),
            Some(_) => Err(missing_fields()),
            None => Err(WalletError::invalid_parameter("Invalid scriptPubKey")),
        },
        _ => Err(WalletError::invalid_parameter("Invalid scriptPubKey")),
    }
}

fn parse_range(value: &Value) -> RangeSpec {
    match value {
        Value::Number(end) => end.as_i64().map_or(RangeSpec::Malformed, RangeSpec::End),
        Value::Array(bounds) if bounds.len() == 2 => {
            match (bounds[0].as_i64(), bounds[1].as_i64()) {
                (Some(begin), Some(end)) => RangeSpec::Span(begin, end),
                _ => RangeSpec::Malformed,
            }
        }
        _ => RangeSpec::Malformed,
    }
}

pub fn parse_import_request(value: &Value) -> Result<ImportRequest, WalletError> {
    let fields = value.as_object().ok_or_else(missing_fields)?;
    let keys = field_str_array(fields, "keys")?;

    let legacy = match fields.get("scriptPubKey") {
        Some(target) => Some(LegacyImport {
            script_pub_key: Some(parse_script_target(target)?),
            redeem_script: field_str(fields, "redeemscript")?,
            witness_script: field_str(fields, "witnessscript")?,
            pubkeys: field_str_array(fields, "pubkeys")?,
            keys: keys.clone(),
        }),
        None => None,
    };
    let descriptor = match fields.get("desc") {
        Some(Value::String(desc)) => Some(DescriptorImport {
            desc: desc.clone(),
            range: fields.get("range").map(parse_range),
            keys,
        }),
        Some(_) => return Err(missing_fields()),
        None => None,
    };

    Ok(ImportRequest {
        form: ImportForm::from_parts(legacy, descriptor)?,
        internal: field_bool(fields, "internal")?,
        watchonly: field_bool(fields, "watchonly")?,
        label: field_str(fields, "label")?,
        keypool: field_bool(fields, "keypool")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fluxd_consensus::Network;
    use fluxd_storage::MemoryStore;

    use crate::chain::MemoryChain;
    use crate::config::WalletConfig;
    use crate::keys::tests::{test_pubkey, test_secret};
    use crate::keys::KeyId;

    fn wallet() -> Wallet<MemoryStore> {
        Wallet::open(
            WalletConfig::for_network(Network::Regtest),
            MemoryStore::new(),
            Arc::new(MemoryChain::new()),
        )
        .expect("open")
    }

    fn address(seed: u8) -> String {
        KeyId::of_pubkey(&test_pubkey(seed))
            .destination()
            .encode(Network::Regtest)
    }

    #[test]
    fn timestamp_shapes() {
        assert_eq!(parse_timestamp(None), TimestampSpec::Missing);
        assert_eq!(parse_timestamp(Some(&json!("now"))), TimestampSpec::Now);
        assert_eq!(parse_timestamp(Some(&json!(1455191478))), TimestampSpec::At(1455191478));
        assert_eq!(parse_timestamp(Some(&json!("later"))), TimestampSpec::Invalid("string"));
        assert_eq!(parse_timestamp(Some(&json!(null))), TimestampSpec::Invalid("null"));
    }

    #[test]
    fn request_forms_are_exclusive() {
        let both = json!({"scriptPubKey": {"address": "x"}, "desc": "addr(x)", "timestamp": 0});
        let err = parse_import_request(&both).expect_err("both");
        assert!(err.is_rpc(
            RpcErrorCode::InvalidParameter,
            "Both a descriptor and a scriptPubKey should not be provided."
        ));
        let neither = json!({"timestamp": 0});
        let err = parse_import_request(&neither).expect_err("neither");
        assert!(err.is_rpc(
            RpcErrorCode::InvalidParameter,
            "Either a descriptor or scriptPubKey must be provided."
        ));
        let bad_target = json!({"scriptPubKey": {"script": "00"}});
        let err = parse_import_request(&bad_target).expect_err("target");
        assert!(err.is_rpc(RpcErrorCode::InvalidParameter, "Invalid scriptPubKey"));
        let wrong_type = json!({"scriptPubKey": "00", "internal": "yes"});
        let err = parse_import_request(&wrong_type).expect_err("type");
        assert!(err.is_rpc(RpcErrorCode::MiscError, "Missing required fields"));
    }

    #[test]
    fn descriptor_request_reads_range() {
        let value = json!({"desc": "pkh(xpub/0/*)#abcdefgh", "range": [2, 5], "keys": ["k"]});
        let request = parse_import_request(&value).expect("parse");
        let ImportForm::Descriptor(descriptor) = request.form else {
            panic!("expected descriptor form");
        };
        assert_eq!(descriptor.range, Some(RangeSpec::Span(2, 5)));
        assert_eq!(descriptor.keys, vec!["k".to_string()]);
        assert_eq!(parse_range(&json!("all")), RangeSpec::Malformed);
        assert_eq!(parse_range(&json!(9)), RangeSpec::End(9));
    }

    #[test]
    fn importmulti_renders_per_item_results() {
        let wallet = wallet();
        let requests = json!([
            {"scriptPubKey": {"address": address(1)}, "timestamp": "now", "watchonly": true},
            {"timestamp": 0},
        ]);
        let result = dispatch(&wallet, "importmulti", &[requests]).expect("importmulti");
        assert_eq!(
            result,
            json!([
                {"success": true},
                {"success": false, "error": {
                    "code": -8,
                    "message": "Either a descriptor or scriptPubKey must be provided."
                }},
            ])
        );

        let err = dispatch(&wallet, "importmulti", &[json!({})]).expect_err("not an array");
        assert!(err.is_rpc(RpcErrorCode::TypeError, "Expected type array, got object"));
    }

    #[test]
    fn single_commands_round_trip_through_json() {
        let wallet = wallet();
        let wif = test_secret(2).to_wif(Network::Regtest);
        let result = dispatch(
            &wallet,
            "importprivkey",
            &[json!(wif), json!("label"), json!(false)],
        )
        .expect("importprivkey");
        assert_eq!(result, Value::Null);
        let dumped = dispatch(&wallet, "dumpprivkey", &[json!(address(2))]).expect("dump");
        assert_eq!(dumped, json!(wif));

        let err = dispatch(&wallet, "importaddress", &[json!(1)]).expect_err("type");
        assert!(err.is_rpc(RpcErrorCode::TypeError, "Expected type string, got number"));
        assert_eq!(dispatch(&wallet, "abortrescan", &[]).expect("abort"), json!(false));
        let err = dispatch(&wallet, "getbalance", &[]).expect_err("unknown");
        assert_eq!(err.code(), RpcErrorCode::MethodNotFound);
    }

    #[test]
    fn dumpwallet_returns_filename() {
        let wallet = wallet();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("backup.txt");
        let result = dispatch(
            &wallet,
            "dumpwallet",
            &[json!(path.display().to_string())],
        )
        .expect("dumpwallet");
        assert_eq!(result, json!({"filename": path.display().to_string()}));
        let err = dispatch(&wallet, "keypoolrefill", &[json!(-1)]).expect_err("size");
        assert!(err.is_rpc(
            RpcErrorCode::InvalidParameter,
            "Invalid parameter, expected valid size."
        ));
    }
}
