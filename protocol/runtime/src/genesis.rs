//! Genesis loading and the bulk UTXO file format.
//!
//! Bulk files are a plain stream of `[u32 LE length][bincode Utxo]` records,
//! at most [`UTXOS_PER_FILE`] per file, named `utxos-00000.bin` upwards.

use bitgate_state::ledger::{all_utxos, put_utxo, set_last_processed_height};
use bitgate_state::{parse_address, BondedValidator, KvStore, Utxo, ValidatorStatus};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::params::{store_params, Params};
use crate::{RuntimeError, RuntimeResult};

pub const UTXOS_PER_FILE: usize = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub operator: String,
    /// Hex ed25519 consensus key.
    pub pubkey: String,
    pub power: u64,
    #[serde(default = "bonded")]
    pub status: ValidatorStatus,
}

fn bonded() -> ValidatorStatus {
    ValidatorStatus::Bonded
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub utxos: Vec<Utxo>,
    #[serde(default)]
    pub last_processed_height: u64,
}

impl GenesisConfig {
    pub fn bonded_validators(&self) -> RuntimeResult<Vec<BondedValidator>> {
        self.validators
            .iter()
            .map(|v| {
                let operator = parse_address(&v.operator).ok_or_else(|| {
                    RuntimeError::invalid(format!("validator operator {:?} is not an address", v.operator))
                })?;
                let pubkey = hex::decode(v.pubkey.trim_start_matches("0x"))
                    .map_err(|e| RuntimeError::invalid(format!("validator pubkey: {e}")))?;
                if pubkey.len() != 32 {
                    return Err(RuntimeError::invalid("validator pubkey must be 32 bytes"));
                }
                Ok(BondedValidator {
                    operator,
                    pubkey,
                    power: v.power,
                    status: v.status,
                })
            })
            .collect()
    }
}

pub fn load_genesis_from_file(path: impl AsRef<Path>) -> RuntimeResult<GenesisConfig> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| RuntimeError::Codec(format!("genesis json: {e}")))
}

pub fn init_genesis(store: &mut dyn KvStore, genesis: &GenesisConfig) -> RuntimeResult<()> {
    store_params(store, &genesis.params)?;
    for utxo in &genesis.utxos {
        put_utxo(store, utxo)?;
    }
    if genesis.last_processed_height > 0 {
        set_last_processed_height(store, genesis.last_processed_height)?;
    }
    info!(
        chain_id = %genesis.params.chain_id,
        validators = genesis.validators.len(),
        utxos = genesis.utxos.len(),
        "genesis initialised"
    );
    Ok(())
}

pub fn write_utxo_record<W: Write>(writer: &mut W, utxo: &Utxo) -> RuntimeResult<()> {
    let bytes = bincode::serialize(utxo).map_err(|e| RuntimeError::Codec(e.to_string()))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| RuntimeError::Codec("utxo record exceeds u32 length".into()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Next record, or `None` at a clean end of stream.
pub fn read_utxo_record<R: Read>(reader: &mut R) -> RuntimeResult<Option<Utxo>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut bytes)?;
    bincode::deserialize(&bytes)
        .map(Some)
        .map_err(|e| RuntimeError::Codec(e.to_string()))
}

pub fn chunk_file_name(index: usize) -> String {
    format!("utxos-{index:05}.bin")
}

pub fn export_utxos(store: &dyn KvStore, dir: &Path) -> RuntimeResult<Vec<PathBuf>> {
    export_utxos_chunked(store, dir, UTXOS_PER_FILE)
}

pub fn export_utxos_chunked(
    store: &dyn KvStore,
    dir: &Path,
    per_file: usize,
) -> RuntimeResult<Vec<PathBuf>> {
    if per_file == 0 {
        return Err(RuntimeError::invalid("chunk size must be positive"));
    }
    fs::create_dir_all(dir)?;
    let utxos = all_utxos(store)?;
    let mut files = Vec::new();
    for (index, chunk) in utxos.chunks(per_file).enumerate() {
        let path = dir.join(chunk_file_name(index));
        let mut writer = BufWriter::new(File::create(&path)?);
        for utxo in chunk {
            write_utxo_record(&mut writer, utxo)?;
        }
        writer.flush()?;
        files.push(path);
    }
    info!(records = utxos.len(), files = files.len(), "utxo export written");
    Ok(files)
}

/// Loads every `utxos-*.bin` file in `dir`, in file name order.
pub fn import_utxos(store: &mut dyn KvStore, dir: &Path) -> RuntimeResult<usize> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("utxos-") && n.ends_with(".bin"))
        })
        .collect();
    paths.sort();

    let mut count = 0usize;
    for path in &paths {
        let mut reader = BufReader::new(File::open(path)?);
        while let Some(utxo) = read_utxo_record(&mut reader)? {
            put_utxo(store, &utxo)?;
            count += 1;
        }
    }
    info!(records = count, files = paths.len(), "utxo import finished");
    Ok(count)
}
