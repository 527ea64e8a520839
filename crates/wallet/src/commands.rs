//! Single-item wallet commands: key, address and pubkey imports, pruned
//! funds, private key export and keypool maintenance.

use fluxd_log::{wallet_log, Level};
use fluxd_primitives::hash::hash256_from_display_hex;
use fluxd_primitives::{Destination, MerkleBlock, Transaction};
use fluxd_storage::KeyValueStore;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::WalletError;
use crate::keys::{parse_hex, parse_pubkey, KeyId, KeyMetadata, KeyRecord, Secret};
use crate::keystore::{IsMine, KeySource, Staged, WalletTx, HD_SEED_KEYPATH};
use crate::rescan::RescanReservation;
use crate::script::{extract_destination, p2pk_script};
use crate::wallet::{current_unix_seconds, Wallet};

const KEY_GENERATION_ATTEMPTS: usize = 100;

/// Rescans from `time_begin` and turns an abort or a short scan into the
/// matching command error.
pub(crate) fn rescan_wallet<S: KeyValueStore>(
    wallet: &Wallet<S>,
    reservation: &RescanReservation<'_>,
    time_begin: i64,
    update: bool,
) -> Result<(), WalletError> {
    let scanned_time = wallet.rescan_from_time(time_begin, reservation, update)?;
    if wallet.is_aborting_rescan() {
        return Err(WalletError::misc("Rescan aborted by user."));
    }
    if scanned_time > time_begin {
        return Err(WalletError::wallet(
            "Rescan was unable to fully rescan the blockchain. Some transactions may be missing.",
        ));
    }
    Ok(())
}

/// Watches `script` and labels whatever it pays. A redeem script is also
/// registered and its P2SH output watched in its place.
fn import_script(
    staged: &mut Staged<'_>,
    script: &[u8],
    label: &str,
    is_redeem_script: bool,
) -> Result<(), WalletError> {
    if !is_redeem_script && staged.is_mine(script) == IsMine::Spendable {
        return Err(WalletError::wallet(
            "The wallet already contains the private key for this address or script",
        ));
    }
    if staged.watch_time(script).is_none() {
        staged.add_watch(script, 0);
    }
    if is_redeem_script {
        let id = staged.add_redeem_script(script, None);
        return import_destination(staged, id.destination(), label);
    }
    if let Some(dest) = extract_destination(script) {
        staged.set_label(dest, label);
    }
    Ok(())
}

fn import_destination(
    staged: &mut Staged<'_>,
    dest: Destination,
    label: &str,
) -> Result<(), WalletError> {
    import_script(staged, &dest.script_pubkey(), label, false)?;
    staged.set_label(dest, label);
    Ok(())
}

impl<S: KeyValueStore> Wallet<S> {
    fn reserve_for_import(
        &self,
        rescan: bool,
    ) -> Result<Option<RescanReservation<'_>>, WalletError> {
        if !rescan {
            return Ok(None);
        }
        if self.have_pruned()? {
            return Err(WalletError::wallet(
                "Rescan is disabled when blocks are pruned",
            ));
        }
        self.reserve_rescan_or_fail().map(Some)
    }

    pub fn import_privkey(&self, wif: &str, label: &str, rescan: bool) -> Result<(), WalletError> {
        let reservation = self.reserve_for_import(rescan)?;
        if self.private_keys_disabled() {
            return Err(WalletError::wallet(
                "Cannot import private keys to a wallet with private keys disabled",
            ));
        }
        let secret = Secret::from_wif(wif, self.network())
            .ok_or_else(|| WalletError::invalid_address_or_key("Invalid private key encoding"))?;
        let id = secret.key_id()?;

        let added = self.stage(|staged| {
            staged.set_label(id.destination(), label);
            if staged.have_secret(&id) {
                return Ok(false);
            }
            let meta = match staged.key(&id) {
                Some(existing) => KeyMetadata {
                    create_time: 1,
                    ..existing.meta.clone()
                },
                None => KeyMetadata::with_time(1),
            };
            staged.put_key(KeyRecord::from_secret(secret, meta)?);
            staged.update_first_key_time(1);
            Ok(true)
        })?;
        if !added {
            wallet_log!(
                Level::Debug,
                self.name(),
                "importprivkey: key {} already present",
                id.destination().encode(self.network())
            );
            return Ok(());
        }
        match reservation {
            Some(reservation) => rescan_wallet(self, &reservation, 0, true),
            None => Ok(()),
        }
    }

    /// Watches an address, or a hex script when `target` is not an address.
    pub fn import_address(
        &self,
        target: &str,
        label: &str,
        rescan: bool,
        p2sh: bool,
    ) -> Result<(), WalletError> {
        let reservation = self.reserve_for_import(rescan)?;
        if let Ok(dest) = Destination::decode(target, self.network()) {
            if p2sh {
                return Err(WalletError::invalid_address_or_key(
                    "Cannot use the p2sh flag with an address - use a script instead",
                ));
            }
            self.stage(|staged| import_destination(staged, dest, label))?;
        } else if let Some(script) = parse_hex(target) {
            self.stage(|staged| import_script(staged, &script, label, p2sh))?;
        } else {
            return Err(WalletError::invalid_address_or_key(
                "Invalid Flux address or script",
            ));
        }
        match reservation {
            Some(reservation) => rescan_wallet(self, &reservation, 0, true),
            None => Ok(()),
        }
    }

    pub fn import_pubkey(&self, pubkey_hex: &str, label: &str, rescan: bool) -> Result<(), WalletError> {
        let reservation = self.reserve_for_import(rescan)?;
        let pubkey = parse_hex(pubkey_hex)
            .ok_or_else(|| WalletError::invalid_address_or_key("Pubkey must be a hex string"))?;
        if parse_pubkey(&pubkey).is_none() {
            return Err(WalletError::invalid_address_or_key(
                "Pubkey is not a valid public key",
            ));
        }
        let id = KeyId::of_pubkey(&pubkey);
        self.stage(|staged| {
            import_destination(staged, id.destination(), label)?;
            import_script(staged, &p2pk_script(&pubkey), label, false)?;
            if staged.key(&id).is_none() {
                staged.put_key(KeyRecord::watch_only(pubkey.clone(), KeyMetadata::with_time(0)));
            }
            Ok(())
        })?;
        match reservation {
            Some(reservation) => rescan_wallet(self, &reservation, 0, true),
            None => Ok(()),
        }
    }

    /// Stores a transaction proven by a merkle proof without rescanning.
    pub fn import_pruned_funds(&self, raw_tx: &str, proof: &str) -> Result<(), WalletError> {
        let tx = parse_hex(raw_tx)
            .and_then(|bytes| Transaction::from_bytes(&bytes).ok())
            .ok_or_else(|| WalletError::deserialization("TX decode failed"))?;
        let txid = tx.txid();

        let proof_bytes = parse_hex(proof).ok_or_else(|| {
            WalletError::invalid_parameter(format!(
                "proof must be hexadecimal string (not '{proof}')"
            ))
        })?;
        let merkle_block = MerkleBlock::from_bytes(&proof_bytes)
            .map_err(|_| WalletError::deserialization("Proof decode failed"))?;
        let matches = merkle_block
            .txn
            .extract_matches()
            .filter(|matches| matches.root == merkle_block.header.merkle_root)
            .ok_or_else(|| WalletError::invalid_address_or_key("Something wrong with merkleblock"))?;

        let block_hash = merkle_block.header.hash();
        if self.chain().block_ref_by_hash(&block_hash)?.is_none() {
            return Err(WalletError::invalid_address_or_key("Block not found in chain"));
        }
        let position = matches
            .txids
            .iter()
            .position(|matched| *matched == txid)
            .and_then(|slot| matches.positions.get(slot).copied())
            .ok_or_else(|| {
                WalletError::invalid_address_or_key("Transaction given doesn't exist in proof")
            })?;

        self.stage(|staged| {
            if !staged.state().is_relevant(&tx) {
                return Err(WalletError::invalid_address_or_key(
                    "No addresses in wallet correspond to included transaction",
                ));
            }
            let time_received = staged
                .tx(&txid)
                .map_or_else(current_unix_seconds, |wtx| wtx.time_received);
            staged.put_tx(
                txid,
                WalletTx {
                    tx,
                    block_hash: Some(block_hash),
                    index: position as i32,
                    time_received,
                },
            );
            Ok(())
        })
    }

    pub fn remove_pruned_funds(&self, txid: &str) -> Result<(), WalletError> {
        let missing = || WalletError::invalid_parameter("Transaction does not exist in wallet.");
        let txid = hash256_from_display_hex(txid).ok_or_else(missing)?;
        self.stage(|staged| {
            if staged.tx(&txid).is_none() {
                return Err(missing());
            }
            staged.remove_tx(txid);
            Ok(())
        })
    }

    /// Returns the WIF encoding of the key behind a P2PKH address.
    pub fn dump_privkey(&self, address: &str) -> Result<String, WalletError> {
        let dest = Destination::decode(address, self.network())
            .map_err(|_| WalletError::invalid_address_or_key("Invalid Flux address"))?;
        let Destination::KeyHash(hash) = dest else {
            return Err(WalletError::type_error("Address does not refer to a key"));
        };
        self.with_state(|state| {
            state
                .key_record(&KeyId(hash))
                .and_then(|record| record.secret.as_ref())
                .map(|secret| secret.to_wif(self.network()))
        })?
        .ok_or_else(|| {
            WalletError::wallet(format!("Private key for address {address} is not known"))
        })
    }

    /// Generates fresh keys until the keypool holds `target` entries, or the
    /// configured size when `target` is `None`. Returns how many were added.
    ///
    /// A wallet without private keys only gains keypool entries through
    /// descriptor imports, so nothing is generated for it.
    pub fn top_up_keypool(&self, target: Option<usize>) -> Result<usize, WalletError> {
        if self.private_keys_disabled() {
            return Ok(0);
        }
        let target = target.unwrap_or(self.config().keypool_size);
        let now = current_unix_seconds();
        let added = self.stage(|staged| {
            let missing = target.saturating_sub(staged.state().keypool().count());
            for _ in 0..missing {
                let record = generate_unique_key(staged, now)?;
                let id = record.id();
                staged.put_key(record);
                staged.add_to_keypool(id, false, now);
            }
            if missing > 0 {
                staged.update_first_key_time(now);
            }
            Ok(missing)
        })?;
        if added > 0 {
            wallet_log!(Level::Debug, self.name(), "keypool added {added} keys");
        }
        Ok(added)
    }

    /// Makes `secret` the active HD seed. A previous seed stays in the
    /// wallet and is dumped as inactive.
    pub fn set_hd_seed(&self, secret: Secret) -> Result<KeyId, WalletError> {
        if self.private_keys_disabled() {
            return Err(WalletError::wallet(
                "Cannot set a HD seed to a wallet with private keys disabled",
            ));
        }
        let id = secret.key_id()?;
        let now = current_unix_seconds();
        self.stage(|staged| {
            let known = staged.edit_key(&id, |record| {
                if record.secret.is_none() {
                    record.secret = Some(secret.clone());
                }
                record.meta.hd_keypath = Some(HD_SEED_KEYPATH.to_string());
                record.meta.hd_seed_id = Some(id);
            });
            if !known {
                let meta = KeyMetadata {
                    hd_keypath: Some(HD_SEED_KEYPATH.to_string()),
                    hd_seed_id: Some(id),
                    ..KeyMetadata::with_time(now)
                };
                staged.put_key(KeyRecord::from_secret(secret, meta)?);
                staged.update_first_key_time(now);
            }
            staged.set_hd_seed(id);
            Ok(id)
        })
    }
}

fn generate_unique_key(staged: &Staged<'_>, now: i64) -> Result<KeyRecord, WalletError> {
    let mut rng = rand::rngs::OsRng;
    let mut bytes = [0u8; 32];
    for _ in 0..KEY_GENERATION_ATTEMPTS {
        rng.fill_bytes(&mut bytes);
        let secret = Secret::new(bytes, true);
        bytes.zeroize();
        let Ok(secret) = secret else {
            continue;
        };
        let record = KeyRecord::from_secret(secret, KeyMetadata::with_time(now))?;
        if staged.key(&record.id()).is_some() {
            continue;
        }
        return Ok(record);
    }
    Err(WalletError::wallet("failed to generate a new key"))
}
