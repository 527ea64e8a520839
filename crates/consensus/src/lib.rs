//! Network selection, encoding prefixes and chain constants shared by the wallet.

pub mod constants;
pub mod params;

pub use params::{chain_params, network_from_name, Base58Prefixes, ChainParams, Network};

pub type Hash256 = [u8; 32];
