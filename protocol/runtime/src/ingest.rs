//! Applies attested Bitcoin blocks to the UTXO ledger.
//!
//! A block is validated, checked for quorum, decoded and then replayed in
//! transaction order inside one staged scope. Nothing reaches the store
//! unless every step succeeds.

use bitgate_consensus::{check_quorum, Attestation};
use bitgate_state::ledger::{
    get_utxo, last_processed_height, put_utxo, remove_utxo, set_last_processed_height,
};
use bitgate_state::{parse_address, Address, BondedValidator, KvStore, Staged, Utxo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::bitcoin_block::{decompress, parse_block, ParsedTx};
use crate::claim::claim_utxo;
use crate::params::Params;
use crate::{RuntimeError, RuntimeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedBlock {
    pub height: u64,
    pub hash: String,
    /// Gzip of the consensus-encoded block.
    pub block_content: Vec<u8>,
    pub attestations: Vec<Attestation>,
    pub signer: String,
}

impl AttestedBlock {
    pub fn validate_basic(&self) -> RuntimeResult<()> {
        if self.hash.trim().is_empty() {
            return Err(RuntimeError::invalid("block hash is empty"));
        }
        if self.signer.trim().is_empty() {
            return Err(RuntimeError::invalid("signer is empty"));
        }
        if self.block_content.is_empty() {
            return Err(RuntimeError::invalid("block content is empty"));
        }
        if self.attestations.is_empty() {
            return Err(RuntimeError::invalid("no attestations"));
        }
        if parse_address(&self.signer).is_none() {
            return Err(RuntimeError::invalid(format!(
                "signer {:?} is not a chain address",
                self.signer
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub height: u64,
    pub transactions: usize,
    pub spent: usize,
    pub created: usize,
    pub total_fee: u64,
    pub claims_applied: usize,
    pub claims_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied(IngestSummary),
    /// Height equals the watermark. Nothing was touched.
    AlreadyProcessed,
    /// Height is neither the watermark nor its successor.
    Skipped { last_processed: u64 },
}

#[derive(Debug, Default)]
struct SpendTotals {
    fee: u64,
    spent: usize,
    created: usize,
}

pub fn ingest_block(
    store: &mut dyn KvStore,
    params: &Params,
    validators: &[BondedValidator],
    msg: &AttestedBlock,
) -> RuntimeResult<IngestOutcome> {
    let last = last_processed_height(store)?;
    if last != 0 {
        if msg.height == last {
            debug!(height = msg.height, "block already processed");
            return Ok(IngestOutcome::AlreadyProcessed);
        }
        if msg.height != last + 1 {
            debug!(height = msg.height, last, "ignoring out-of-order block");
            return Ok(IngestOutcome::Skipped { last_processed: last });
        }
    }

    msg.validate_basic()?;
    let raw = decompress(&msg.block_content)?;
    let report = check_quorum(&raw, &msg.attestations, validators)?;
    debug!(
        height = msg.height,
        power = report.accumulated,
        required = report.required,
        "attestation quorum reached"
    );

    let block = parse_block(&raw)?;
    if !block.hash.eq_ignore_ascii_case(msg.hash.trim()) {
        return Err(RuntimeError::invalid(format!(
            "block hash {} does not match attested hash {}",
            block.hash, msg.hash
        )));
    }

    let mut staged = Staged::new(store);
    let mut summary = IngestSummary {
        height: msg.height,
        transactions: block.txs.len(),
        ..IngestSummary::default()
    };

    let mut coinbase: Option<&ParsedTx> = None;
    let mut claim_txs: Vec<(&ParsedTx, Address)> = Vec::new();
    for tx in &block.txs {
        if tx.is_coinbase {
            coinbase.get_or_insert(tx);
            continue;
        }
        if let Some(recipient) = detect_claim(&staged, tx)? {
            claim_txs.push((tx, recipient));
        }
        let totals = apply_spend(&mut staged, tx)?;
        summary.total_fee = summary.total_fee.saturating_add(totals.fee);
        summary.spent += totals.spent;
        summary.created += totals.created;
    }

    if let Some(tx) = coinbase {
        for out in tx.positive_outputs() {
            put_utxo(
                &mut staged,
                &Utxo {
                    txid: tx.txid.clone(),
                    vout: out.vout,
                    amount: out.value,
                    entitled_amount: out.value.saturating_sub(summary.total_fee),
                    script_pubkey: out.script_pubkey.clone(),
                },
            )?;
            summary.created += 1;
        }
    }

    for (tx, recipient) in &claim_txs {
        for out in tx.positive_outputs() {
            let mut scope = Staged::new(&mut staged);
            match claim_utxo(&mut scope, params, &tx.txid, out.vout, Some(recipient)) {
                Ok(_) => {
                    scope.commit()?;
                    summary.claims_applied += 1;
                }
                Err(err) => {
                    warn!(txid = %tx.txid, vout = out.vout, "memo claim skipped: {err}");
                    summary.claims_failed += 1;
                }
            }
        }
    }

    set_last_processed_height(&mut staged, msg.height)?;
    staged.commit()?;
    info!(
        height = summary.height,
        txs = summary.transactions,
        created = summary.created,
        spent = summary.spent,
        fee = summary.total_fee,
        claims = summary.claims_applied,
        "bitcoin block applied"
    );
    Ok(IngestOutcome::Applied(summary))
}

/// A claim transaction spends only from addresses it pays back to and carries
/// a `claim:<addr>` memo in one of exactly two outputs. Must run before the
/// inputs are spent, since spending deletes the records it reads.
fn detect_claim(store: &dyn KvStore, tx: &ParsedTx) -> RuntimeResult<Option<Address>> {
    if tx.outputs.len() != 2 || tx.inputs.is_empty() {
        return Ok(None);
    }
    let memos: Vec<&str> = tx
        .outputs
        .iter()
        .filter(|o| o.script_pubkey.kind == "nulldata")
        .filter_map(|o| o.claim_memo.as_deref())
        .collect();
    let [memo] = memos.as_slice() else {
        return Ok(None);
    };
    let destinations: BTreeSet<&str> = tx
        .outputs
        .iter()
        .filter_map(|o| o.script_pubkey.address.as_deref())
        .collect();
    for input in &tx.inputs {
        let Some(source) = get_utxo(store, &input.txid, input.vout)? else {
            return Ok(None);
        };
        match source.script_pubkey.address.as_deref() {
            Some(address) if destinations.contains(address) => {}
            _ => return Ok(None),
        }
    }
    Ok(parse_address(memo))
}

fn apply_spend(store: &mut dyn KvStore, tx: &ParsedTx) -> RuntimeResult<SpendTotals> {
    let mut totals = SpendTotals::default();
    let mut total_input: u64 = 0;
    let mut total_claimable: u64 = 0;
    let mut has_claimed = false;
    for input in &tx.inputs {
        match get_utxo(store, &input.txid, input.vout)? {
            Some(spent) => {
                total_input = total_input.saturating_add(spent.amount);
                total_claimable = total_claimable.saturating_add(spent.entitled_amount);
                // a reduced entitlement forces proportional redistribution too
                if spent.entitled_amount < spent.amount {
                    has_claimed = true;
                }
                remove_utxo(store, &input.txid, input.vout)?;
                totals.spent += 1;
            }
            None => has_claimed = true,
        }
    }

    let total_output: u64 = tx
        .positive_outputs()
        .fold(0u64, |acc, o| acc.saturating_add(o.value));
    totals.fee = total_input.saturating_sub(total_output);
    let total_claimable = total_claimable.saturating_sub(totals.fee);

    for out in tx.positive_outputs() {
        let entitled_amount = if has_claimed {
            proportional_share(total_claimable, out.value, total_output)
        } else {
            out.value
        };
        put_utxo(
            store,
            &Utxo {
                txid: tx.txid.clone(),
                vout: out.vout,
                amount: out.value,
                entitled_amount,
                script_pubkey: out.script_pubkey.clone(),
            },
        )?;
        totals.created += 1;
    }
    Ok(totals)
}

/// `floor(claimable * value / total)`. The remainder is not carried forward.
pub fn proportional_share(claimable: u64, value: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    ((claimable as u128 * value as u128) / total as u128) as u64
}
