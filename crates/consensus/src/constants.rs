//! Chain-wide constants consulted by wallet code.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 2_000_000;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Maximum number of public keys in a bare or P2SH CHECKMULTISIG.
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 16;
/// Maximum size of a redeem script that can be spent through P2SH.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Block timestamps may lag the real time of their contents by this many seconds,
/// so scans that start from a key birth time begin this much earlier.
pub const TIMESTAMP_WINDOW: i64 = 7_200;
