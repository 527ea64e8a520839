//! Wallet records persisted through a [`KeyValueStore`].

use fluxd_consensus::Network;
use fluxd_primitives::encoding::{DecodeError, Decoder, Encoder};
use fluxd_primitives::{Destination, Transaction};
use fluxd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::WalletError;
use crate::keys::{KeyId, KeyMetadata, KeyOrigin, KeyRecord, ScriptId, Secret};
use crate::keystore::{
    AddressBookEntry, KeyPoolEntry, RedeemScript, WalletDelta, WalletState, WalletTx,
};

pub const WALLET_DB_VERSION: u32 = 1;

const RECORD_VERSION: u8 = 1;

const META_VERSION: &[u8] = b"version";
const META_NETWORK: &[u8] = b"network";
const META_FLAGS: &[u8] = b"flags";
const META_FIRST_KEY_TIME: &[u8] = b"firstkeytime";
const META_HD_SEED: &[u8] = b"hdseed";
const META_NEXT_POOL: &[u8] = b"nextpool";

pub const FLAG_DISABLE_PRIVATE_KEYS: u64 = 1 << 32;

pub struct WalletDb<S> {
    store: S,
}

impl<S: KeyValueStore> WalletDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reads the wallet header, writing it for a fresh store. Returns the
    /// wallet flags.
    pub fn init(&self, network: Network, default_flags: u64) -> Result<u64, WalletError> {
        match self.store.get(Column::Meta, META_NETWORK)? {
            Some(bytes) => {
                let found = decode_network(&bytes)?;
                if found != network {
                    return Err(WalletError::NetworkMismatch {
                        expected: network.as_str(),
                        found: found.as_str(),
                    });
                }
                let flags = self
                    .store
                    .get(Column::Meta, META_FLAGS)?
                    .map(|bytes| read_u64(&bytes))
                    .transpose()?
                    .unwrap_or(0);
                Ok(flags)
            }
            None => {
                let mut batch = WriteBatch::new();
                batch.put(Column::Meta, META_VERSION, WALLET_DB_VERSION.to_le_bytes());
                batch.put(Column::Meta, META_NETWORK, [encode_network(network)]);
                batch.put(Column::Meta, META_FLAGS, default_flags.to_le_bytes());
                self.store.write_batch(&batch)?;
                Ok(default_flags)
            }
        }
    }

    pub fn load(&self) -> Result<WalletState, WalletError> {
        let mut state = WalletState::default();

        let metas = self.store.scan_prefix(Column::KeyMeta, &[])?;
        let mut meta_by_id = std::collections::BTreeMap::new();
        for (key, value) in metas {
            meta_by_id.insert(read_key_id(&key)?, decode_key_meta(&value)?);
        }
        for (key, value) in self.store.scan_prefix(Column::Key, &[])? {
            let id = read_key_id(&key)?;
            let (pubkey, secret) = decode_key_material(&value)?;
            if KeyId::of_pubkey(&pubkey) != id {
                return Err(WalletError::InvalidData("wallet pubkey hash mismatch"));
            }
            let meta = meta_by_id.remove(&id).unwrap_or_default();
            state.keys.insert(
                id,
                KeyRecord {
                    pubkey,
                    secret,
                    meta,
                },
            );
        }
        for (key, value) in self.store.scan_prefix(Column::WatchScript, &[])? {
            let mut decoder = record_decoder(&value)?;
            let time = decoder.read_i64_le()?;
            finish(decoder)?;
            state.watch_scripts.insert(key, time);
        }
        for (key, value) in self.store.scan_prefix(Column::RedeemScript, &[])? {
            let id = ScriptId(read_hash20(&key)?);
            let mut decoder = record_decoder(&value)?;
            let script = decoder.read_var_bytes()?;
            let create_time = decoder.read_optional(|d| d.read_i64_le())?;
            finish(decoder)?;
            state.redeem_scripts.insert(
                id,
                RedeemScript {
                    script,
                    create_time,
                },
            );
        }
        for (key, value) in self.store.scan_prefix(Column::AddressBook, &[])? {
            let dest = decode_destination(&key)?;
            let mut decoder = record_decoder(&value)?;
            let label = decoder.read_var_str()?;
            let purpose = decoder.read_var_str()?;
            finish(decoder)?;
            state
                .address_book
                .insert(dest, AddressBookEntry { label, purpose });
        }
        for (key, value) in self.store.scan_prefix(Column::KeyPool, &[])? {
            let index = u64::from_be_bytes(
                key.as_slice()
                    .try_into()
                    .map_err(|_| WalletError::InvalidData("invalid keypool index"))?,
            );
            let mut decoder = record_decoder(&value)?;
            let key_id = KeyId(decoder.read_fixed::<20>()?);
            let internal = decoder.read_bool()?;
            let time = decoder.read_i64_le()?;
            finish(decoder)?;
            state.keypool.insert(
                index,
                KeyPoolEntry {
                    key_id,
                    internal,
                    time,
                },
            );
        }
        for (key, value) in self.store.scan_prefix(Column::WalletTx, &[])? {
            let txid: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| WalletError::InvalidData("invalid wallet tx key"))?;
            state.txs.insert(txid, decode_wallet_tx(&value)?);
        }

        if let Some(bytes) = self.store.get(Column::Meta, META_FIRST_KEY_TIME)? {
            state.first_key_time = read_u64(&bytes)? as i64;
        }
        if let Some(bytes) = self.store.get(Column::Meta, META_HD_SEED)? {
            state.hd_seed = Some(KeyId(read_hash20(&bytes)?));
        }
        if let Some(bytes) = self.store.get(Column::Meta, META_NEXT_POOL)? {
            state.next_pool_index = read_u64(&bytes)?;
        }
        let pool_end = state.keypool.keys().next_back().map_or(0, |index| index + 1);
        state.next_pool_index = state.next_pool_index.max(pool_end);
        Ok(state)
    }

    pub fn set_flags(&self, flags: u64) -> Result<(), WalletError> {
        self.store
            .put(Column::Meta, META_FLAGS, &flags.to_le_bytes())?;
        Ok(())
    }

    /// Writes every record of `delta` in one batch.
    pub fn write_delta(&self, delta: &WalletDelta) -> Result<(), WalletError> {
        let batch = delta_batch(delta);
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

fn delta_batch(delta: &WalletDelta) -> WriteBatch {
    let mut batch = WriteBatch::new();
    for (id, record) in &delta.keys {
        batch.put(Column::Key, id.0, encode_key_material(record));
        batch.put(Column::KeyMeta, id.0, encode_key_meta(&record.meta));
    }
    for (script, time) in &delta.watch {
        let mut encoder = record_encoder();
        encoder.write_i64_le(*time);
        batch.put(Column::WatchScript, script.as_slice(), encoder.into_inner());
    }
    for (id, entry) in &delta.redeem {
        let mut encoder = record_encoder();
        encoder.write_var_bytes(&entry.script);
        encoder.write_optional(entry.create_time.as_ref(), |e, time| e.write_i64_le(*time));
        batch.put(Column::RedeemScript, id.0, encoder.into_inner());
    }
    for (dest, entry) in &delta.address_book {
        let mut encoder = record_encoder();
        encoder.write_var_str(&entry.label);
        encoder.write_var_str(&entry.purpose);
        batch.put(Column::AddressBook, encode_destination(dest), encoder.into_inner());
    }
    for (index, entry) in &delta.keypool {
        let mut encoder = record_encoder();
        encoder.write_bytes(&entry.key_id.0);
        encoder.write_bool(entry.internal);
        encoder.write_i64_le(entry.time);
        batch.put(Column::KeyPool, index.to_be_bytes(), encoder.into_inner());
    }
    for txid in &delta.removed_txs {
        batch.delete(Column::WalletTx, *txid);
    }
    for (txid, wtx) in &delta.txs {
        batch.put(Column::WalletTx, *txid, encode_wallet_tx(wtx));
    }
    if let Some(time) = delta.first_key_time {
        batch.put(Column::Meta, META_FIRST_KEY_TIME, (time as u64).to_le_bytes());
    }
    if let Some(seed) = delta.hd_seed {
        batch.put(Column::Meta, META_HD_SEED, seed.0);
    }
    if let Some(next) = delta.next_pool_index {
        batch.put(Column::Meta, META_NEXT_POOL, next.to_le_bytes());
    }
    batch
}

fn record_encoder() -> Encoder {
    let mut encoder = Encoder::new();
    encoder.write_u8(RECORD_VERSION);
    encoder
}

fn record_decoder(bytes: &[u8]) -> Result<Decoder<'_>, WalletError> {
    let mut decoder = Decoder::new(bytes);
    if decoder.read_u8()? != RECORD_VERSION {
        return Err(WalletError::InvalidData("unsupported wallet record version"));
    }
    Ok(decoder)
}

fn finish(decoder: Decoder<'_>) -> Result<(), WalletError> {
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes.into());
    }
    Ok(())
}

fn encode_key_material(record: &KeyRecord) -> Vec<u8> {
    let mut encoder = record_encoder();
    encoder.write_var_bytes(&record.pubkey);
    encoder.write_optional(record.secret.as_ref(), |e, secret| {
        e.write_bytes(secret.bytes());
        e.write_bool(secret.is_compressed());
    });
    encoder.into_inner()
}

fn decode_key_material(bytes: &[u8]) -> Result<(Vec<u8>, Option<Secret>), WalletError> {
    let mut decoder = record_decoder(bytes)?;
    let pubkey = decoder.read_var_bytes()?;
    let secret = decoder.read_optional(|d| Ok((d.read_fixed::<32>()?, d.read_bool()?)))?;
    finish(decoder)?;
    let secret = match secret {
        Some((bytes, compressed)) => Some(Secret::new(bytes, compressed)?),
        None => None,
    };
    if let Some(secret) = &secret {
        if secret.pubkey_bytes()? != pubkey {
            return Err(WalletError::InvalidData("wallet secret does not match pubkey"));
        }
    }
    Ok((pubkey, secret))
}

fn encode_key_meta(meta: &KeyMetadata) -> Vec<u8> {
    let mut encoder = record_encoder();
    encoder.write_i64_le(meta.create_time);
    encoder.write_optional(meta.hd_keypath.as_ref(), |e, path| e.write_var_str(path));
    encoder.write_optional(meta.hd_seed_id.as_ref(), |e, id| e.write_bytes(&id.0));
    encoder.write_optional(meta.origin.as_ref(), |e, origin| {
        e.write_bytes(&origin.fingerprint);
        e.write_varint(origin.path.len() as u64);
        for index in &origin.path {
            e.write_u32_le(*index);
        }
    });
    encoder.into_inner()
}

fn decode_key_meta(bytes: &[u8]) -> Result<KeyMetadata, WalletError> {
    let mut decoder = record_decoder(bytes)?;
    let create_time = decoder.read_i64_le()?;
    let hd_keypath = decoder.read_optional(|d| d.read_var_str())?;
    let hd_seed_id = decoder.read_optional(|d| d.read_fixed::<20>().map(KeyId))?;
    let origin = decoder.read_optional(|d| {
        let fingerprint = d.read_fixed::<4>()?;
        let count = d.read_count()?;
        let mut path = Vec::with_capacity(count);
        for _ in 0..count {
            path.push(d.read_u32_le()?);
        }
        Ok(KeyOrigin { fingerprint, path })
    })?;
    finish(decoder)?;
    Ok(KeyMetadata {
        create_time,
        hd_keypath,
        hd_seed_id,
        origin,
    })
}

fn encode_wallet_tx(wtx: &WalletTx) -> Vec<u8> {
    let mut encoder = record_encoder();
    encoder.write_var_bytes(&wtx.tx.to_bytes());
    encoder.write_optional(wtx.block_hash.as_ref(), |e, hash| e.write_hash_le(hash));
    encoder.write_i32_le(wtx.index);
    encoder.write_i64_le(wtx.time_received);
    encoder.into_inner()
}

fn decode_wallet_tx(bytes: &[u8]) -> Result<WalletTx, WalletError> {
    let mut decoder = record_decoder(bytes)?;
    let tx = Transaction::from_bytes(&decoder.read_var_bytes()?)?;
    let block_hash = decoder.read_optional(|d| d.read_hash_le())?;
    let index = decoder.read_i32_le()?;
    let time_received = decoder.read_i64_le()?;
    finish(decoder)?;
    Ok(WalletTx {
        tx,
        block_hash,
        index,
        time_received,
    })
}

fn encode_destination(dest: &Destination) -> [u8; 21] {
    let mut out = [0u8; 21];
    let (kind, hash) = match dest {
        Destination::KeyHash(hash) => (0u8, hash),
        Destination::ScriptHash(hash) => (1u8, hash),
    };
    out[0] = kind;
    out[1..].copy_from_slice(hash);
    out
}

fn decode_destination(bytes: &[u8]) -> Result<Destination, WalletError> {
    let (&kind, hash) = bytes
        .split_first()
        .ok_or(WalletError::InvalidData("invalid address book key"))?;
    let hash = read_hash20(hash)?;
    match kind {
        0 => Ok(Destination::KeyHash(hash)),
        1 => Ok(Destination::ScriptHash(hash)),
        _ => Err(WalletError::InvalidData("invalid address book key")),
    }
}

fn read_key_id(bytes: &[u8]) -> Result<KeyId, WalletError> {
    read_hash20(bytes).map(KeyId)
}

fn read_hash20(bytes: &[u8]) -> Result<[u8; 20], WalletError> {
    bytes
        .try_into()
        .map_err(|_| WalletError::InvalidData("invalid 20-byte wallet key"))
}

fn read_u64(bytes: &[u8]) -> Result<u64, WalletError> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| WalletError::InvalidData("invalid wallet meta value"))?;
    Ok(u64::from_le_bytes(bytes))
}

fn encode_network(network: Network) -> u8 {
    match network {
        Network::Mainnet => 0,
        Network::Testnet => 1,
        Network::Regtest => 2,
    }
}

fn decode_network(bytes: &[u8]) -> Result<Network, WalletError> {
    match bytes {
        [0] => Ok(Network::Mainnet),
        [1] => Ok(Network::Testnet),
        [2] => Ok(Network::Regtest),
        _ => Err(WalletError::InvalidData("unknown wallet network")),
    }
}
