//! Decoding of attested Bitcoin block content.
//!
//! Blocks travel gzip-compressed in consensus encoding. Everything the ledger
//! needs is pulled out here once, so ingestion only deals with plain values.

use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::Hash as _;
use bitcoin::script::Instruction;
use bitcoin::{Address, Block, Network, Script, Transaction};
use bitgate_state::ScriptPubKey;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::{RuntimeError, RuntimeResult};

/// Largest decompressed block accepted. Consensus caps blocks at 4M weight
/// units, which bounds the serialized size well below this.
pub const MAX_BLOCK_BYTES: usize = 8 * 1024 * 1024;

const CLAIM_PREFIX: &str = "claim:";

#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub vout: u32,
    pub value: u64,
    pub script_pubkey: ScriptPubKey,
    /// Memo address from an OP_RETURN `claim:<addr>` payload.
    pub claim_memo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedInput {
    pub txid: String,
    pub vout: u32,
}

#[derive(Debug, Clone)]
pub struct ParsedTx {
    pub txid: String,
    pub is_coinbase: bool,
    pub inputs: Vec<ParsedInput>,
    pub outputs: Vec<ParsedOutput>,
}

impl ParsedTx {
    pub fn positive_outputs(&self) -> impl Iterator<Item = &ParsedOutput> {
        self.outputs.iter().filter(|o| o.value > 0)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub hash: String,
    pub txs: Vec<ParsedTx>,
}

pub fn decompress(content: &[u8]) -> RuntimeResult<Vec<u8>> {
    let mut raw = Vec::new();
    GzDecoder::new(content)
        .take(MAX_BLOCK_BYTES as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| RuntimeError::BlockDecode(format!("gzip: {e}")))?;
    if raw.len() > MAX_BLOCK_BYTES {
        return Err(RuntimeError::BlockDecode(format!(
            "decompressed block exceeds {MAX_BLOCK_BYTES} bytes"
        )));
    }
    Ok(raw)
}

pub fn compress(raw: &[u8]) -> RuntimeResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

pub fn parse_block(raw: &[u8]) -> RuntimeResult<ParsedBlock> {
    let block: Block = bitcoin::consensus::deserialize(raw)
        .map_err(|e| RuntimeError::BlockDecode(e.to_string()))?;
    Ok(ParsedBlock {
        hash: block.block_hash().to_string(),
        txs: block.txdata.iter().map(parse_tx).collect(),
    })
}

fn parse_tx(tx: &Transaction) -> ParsedTx {
    let is_coinbase = tx.is_coinbase();
    let inputs = if is_coinbase {
        Vec::new()
    } else {
        tx.input
            .iter()
            .map(|txin| ParsedInput {
                txid: txin.previous_output.txid.to_string(),
                vout: txin.previous_output.vout,
            })
            .collect()
    };
    let outputs = tx
        .output
        .iter()
        .enumerate()
        .map(|(vout, out)| ParsedOutput {
            vout: vout as u32,
            value: out.value.to_sat(),
            script_pubkey: describe_script(&out.script_pubkey),
            claim_memo: claim_memo(&out.script_pubkey),
        })
        .collect();
    ParsedTx {
        txid: tx.compute_txid().to_string(),
        is_coinbase,
        inputs,
        outputs,
    }
}

pub fn script_kind(script: &Script) -> &'static str {
    if script.is_p2pkh() {
        "pubkeyhash"
    } else if script.is_p2sh() {
        "scripthash"
    } else if script.is_p2wpkh() {
        "witness_v0_keyhash"
    } else if script.is_p2wsh() {
        "witness_v0_scripthash"
    } else if script.is_p2tr() {
        "witness_v1_taproot"
    } else if script.is_p2pk() {
        "pubkey"
    } else if script.is_op_return() {
        "nulldata"
    } else {
        "nonstandard"
    }
}

pub fn describe_script(script: &Script) -> ScriptPubKey {
    ScriptPubKey {
        hex: hex::encode(script.as_bytes()),
        kind: script_kind(script).to_string(),
        address: Address::from_script(script, Network::Bitcoin)
            .ok()
            .map(|a| a.to_string()),
    }
}

/// Extracts `<addr>` from an OP_RETURN payload reading `claim:<addr>`. The
/// prefix is matched case-insensitively.
pub fn claim_memo(script: &Script) -> Option<String> {
    if !script.is_op_return() {
        return None;
    }
    let mut payload = Vec::new();
    for instruction in script.instructions().skip(1) {
        match instruction.ok()? {
            Instruction::PushBytes(bytes) => payload.extend_from_slice(bytes.as_bytes()),
            Instruction::Op(_) => return None,
        }
    }
    let text = std::str::from_utf8(&payload).ok()?;
    if !text.is_ascii() || text.len() < CLAIM_PREFIX.len() {
        return None;
    }
    let (prefix, rest) = text.split_at(CLAIM_PREFIX.len());
    if !prefix.eq_ignore_ascii_case(CLAIM_PREFIX) {
        return None;
    }
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

/// 20-byte hash an address commits to: the key hash for P2PKH and P2WPKH,
/// the script hash for P2SH. Other address kinds carry no such hash.
pub fn address_hash(address: &Address) -> Option<[u8; 20]> {
    if let Some(hash) = address.pubkey_hash() {
        return Some(hash.to_byte_array());
    }
    if let Some(hash) = address.script_hash() {
        return Some(hash.to_byte_array());
    }
    let program = address.witness_program()?;
    program.program().as_bytes().try_into().ok()
}

pub fn address_hash_from_str(address: &str) -> Option<[u8; 20]> {
    let parsed = address.parse::<Address<NetworkUnchecked>>().ok()?;
    address_hash(&parsed.assume_checked())
}
