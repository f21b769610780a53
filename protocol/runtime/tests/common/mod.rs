#![allow(dead_code)]

use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};
use bitgate_consensus::sign_attestation;
use bitgate_runtime::bitcoin_block::{compress, describe_script};
use bitgate_runtime::{App, AttestedBlock, GenesisConfig, Params};
use bitgate_state::{address_from_pubkey, format_address, module_address, Address, BondedValidator, ValidatorStatus};
use ed25519_dalek::SigningKey;

pub fn validator_set(count: u8, power: u64) -> (Vec<BondedValidator>, Vec<SigningKey>) {
    let mut validators = Vec::new();
    let mut keys = Vec::new();
    for i in 1..=count {
        let sk = SigningKey::from_bytes(&[i; 32]);
        validators.push(BondedValidator {
            operator: address_from_pubkey(&[b'o', i]),
            pubkey: sk.verifying_key().to_bytes().to_vec(),
            power,
            status: ValidatorStatus::Bonded,
        });
        keys.push(sk);
    }
    (validators, keys)
}

pub fn test_app(params: Params) -> (App, Vec<SigningKey>) {
    let (validators, keys) = validator_set(4, 10);
    let genesis = GenesisConfig {
        params,
        ..GenesisConfig::default()
    };
    let mut app = App::from_genesis(&genesis).expect("genesis");
    app.set_validators(validators);
    (app, keys)
}

pub fn proposer() -> String {
    format_address(&module_address("proposer"))
}

pub fn p2wpkh(hash: [u8; 20]) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&hash);
    ScriptBuf::from_bytes(bytes)
}

pub fn btc_address(hash: [u8; 20]) -> String {
    describe_script(&p2wpkh(hash))
        .address
        .expect("p2wpkh address")
}

pub fn claim_memo(recipient: &Address) -> ScriptBuf {
    let text = format!("claim:{}", format_address(recipient));
    let mut bytes = vec![0x6a, text.len() as u8];
    bytes.extend_from_slice(text.as_bytes());
    ScriptBuf::from_bytes(bytes)
}

pub fn out(value: u64, script: ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: script,
    }
}

pub fn coinbase(tag: u32, outputs: Vec<TxOut>) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&tag.to_le_bytes());
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

pub fn spend(inputs: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

pub fn outpoint(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint {
        txid: tx.compute_txid(),
        vout,
    }
}

pub fn block(txs: Vec<Transaction>) -> Block {
    Block {
        header: Header {
            version: BlockVersion::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: CompactTarget::from_consensus(0x1d00_ffff),
            nonce: 0,
        },
        txdata: txs,
    }
}

/// Attested message for `block` signed by every key given.
pub fn attest(height: u64, block: &Block, keys: &[SigningKey]) -> AttestedBlock {
    let raw = bitcoin::consensus::serialize(block);
    AttestedBlock {
        height,
        hash: block.block_hash().to_string(),
        block_content: compress(&raw).expect("gzip"),
        attestations: keys.iter().map(|k| sign_attestation(&raw, k)).collect(),
        signer: proposer(),
    }
}
