//! Transparent chain types, hashing and the encodings wallet code relies on.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkleblock;
pub mod outpoint;
pub mod time;
pub mod transaction;

pub use address::{
    base58check_decode, base58check_encode, secret_key_to_wif, wif_to_secret_key, AddressError,
    Destination,
};
pub use block::{merkle_root, Block, BlockHeader};
pub use hash::{hash160, sha256, sha256d};
pub use merkleblock::{ExtractedMatches, MerkleBlock, PartialMerkleTree};
pub use outpoint::OutPoint;
pub use time::{format_iso8601, parse_iso8601};
pub use transaction::{Transaction, TxIn, TxOut};
