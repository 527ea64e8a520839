//! Transparent wallet: key and script import, batch import, chain rescans
//! and plaintext dump files.

pub mod batch;
pub mod bip32;
pub mod chain;
pub mod commands;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod dump;
pub mod error;
pub mod import;
pub mod keys;
pub mod keystore;
pub mod rescan;
pub mod rpc;
pub mod script;
pub mod wallet;

pub use batch::{BatchOptions, ImportItem, ImportResult, TimestampSpec};
pub use chain::{BlockRef, ChainError, ChainView, MemoryChain};
pub use config::{ConfigError, WalletConfig};
pub use db::WalletDb;
pub use dump::{decode_dump_string, encode_dump_string};
pub use error::{RpcErrorCode, RpcFailure, WalletError};
pub use import::{
    DescriptorImport, ImportContext, ImportForm, ImportRequest, LegacyImport, RangeSpec,
    ScriptTarget,
};
pub use keys::{KeyId, KeyMetadata, KeyRecord, ScriptId, Secret};
pub use keystore::{IsMine, WalletState};
pub use rescan::{ProgressSink, RescanReservation, ScanOutcome, ScanStatus};
pub use wallet::Wallet;
