use bitgate_state::ledger::{self, UtxoRef};
use bitgate_state::{Address, BondedValidator, Hash, MemoryStore, Staged, Utxo};
use bitgate_zk::{ClaimProofVerifier, Groth16ClaimVerifier};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ceremony::{self, SubmitOutcome, SubmitZkEntropy, ZkEntropyState, ZkSetupKeys};
use crate::claim::{self, ClaimResult};
use crate::genesis::{init_genesis, GenesisConfig};
use crate::ingest::{ingest_block, IngestOutcome};
use crate::msg::Msg;
use crate::params::{self, load_params, Params};
use crate::{bank, RuntimeResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverOutcome {
    Block(IngestOutcome),
    Claimed(ClaimResult),
    Entropy(SubmitOutcome),
    ParamsUpdated,
}

/// Chain state plus the pieces of host context the handlers need: the bonded
/// set and the active claim verifier.
pub struct App {
    store: MemoryStore,
    validators: Vec<BondedValidator>,
    verifier: Option<Arc<dyn ClaimProofVerifier>>,
}

impl App {
    /// Wraps existing state. A verifier persisted by an earlier ceremony is
    /// reinstalled.
    pub fn new(store: MemoryStore, validators: Vec<BondedValidator>) -> RuntimeResult<Self> {
        let mut app = Self {
            store,
            validators,
            verifier: None,
        };
        if let Some(keys) = ceremony::load_setup_keys(&app.store)? {
            app.install_setup_keys(&keys)?;
        }
        Ok(app)
    }

    pub fn from_genesis(genesis: &GenesisConfig) -> RuntimeResult<Self> {
        let mut store = MemoryStore::new();
        init_genesis(&mut store, genesis)?;
        Self::new(store, genesis.bonded_validators()?)
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MemoryStore {
        &mut self.store
    }

    pub fn validators(&self) -> &[BondedValidator] {
        &self.validators
    }

    pub fn set_validators(&mut self, validators: Vec<BondedValidator>) {
        self.validators = validators;
    }

    pub fn install_verifier(&mut self, verifier: Arc<dyn ClaimProofVerifier>) {
        info!(backend = verifier.backend_id(), "claim verifier installed");
        self.verifier = Some(verifier);
    }

    fn install_setup_keys(&mut self, keys: &ZkSetupKeys) -> RuntimeResult<()> {
        let verifier = Groth16ClaimVerifier::from_verifying_key_bytes(&keys.verifying_key)?;
        self.install_verifier(Arc::new(verifier));
        Ok(())
    }

    pub fn has_verifier(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn deliver_tx(&mut self, height: u64, tx: &[u8]) -> RuntimeResult<DeliverOutcome> {
        let msg = Msg::decode(tx)?;
        self.deliver(height, &msg)
    }

    pub fn deliver(&mut self, height: u64, msg: &Msg) -> RuntimeResult<DeliverOutcome> {
        let params = load_params(&self.store)?;
        let result = match msg {
            Msg::AttestedBlock(block) => {
                ingest_block(&mut self.store, &params, &self.validators, block).map(DeliverOutcome::Block)
            }
            Msg::GovClaimUtxo(batch) => {
                claim::gov_claim_utxo(&mut self.store, &params, batch).map(DeliverOutcome::Claimed)
            }
            Msg::ClaimWithProof(request) => claim::claim_with_proof(
                &mut self.store,
                &params,
                self.verifier.as_deref(),
                request,
            )
            .map(DeliverOutcome::Claimed),
            Msg::SubmitZkEntropy(submission) => self
                .submit_entropy(&params, height, submission)
                .map(DeliverOutcome::Entropy),
            Msg::UpdateParams(update) => {
                params::update_params(&mut self.store, update).map(|()| DeliverOutcome::ParamsUpdated)
            }
        };
        if let Err(err) = &result {
            warn!(kind = msg.kind(), class = err.class(), "message rejected: {err}");
        }
        result
    }

    fn submit_entropy(
        &mut self,
        params: &Params,
        height: u64,
        submission: &SubmitZkEntropy,
    ) -> RuntimeResult<SubmitOutcome> {
        let mut staged = Staged::new(&mut self.store);
        let outcome =
            ceremony::submit_entropy(&mut staged, params, submission, height, &self.validators)?;
        staged.commit()?;
        if let SubmitOutcome::Finalized(keys) = &outcome {
            self.install_setup_keys(keys)?;
        }
        Ok(outcome)
    }

    pub fn end_block(&mut self, height: u64) -> RuntimeResult<()> {
        let params = load_params(&self.store)?;
        if let Some(keys) = ceremony::end_block(&mut self.store, &params, height)? {
            self.install_setup_keys(&keys)?;
        }
        Ok(())
    }

    pub fn params(&self) -> RuntimeResult<Params> {
        load_params(&self.store)
    }

    pub fn utxo(&self, utxo_ref: &UtxoRef) -> RuntimeResult<Option<Utxo>> {
        Ok(ledger::get_utxo(&self.store, &utxo_ref.txid, utxo_ref.vout)?)
    }

    pub fn utxos(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> RuntimeResult<(Vec<Utxo>, Option<String>)> {
        Ok(ledger::list_utxos(&self.store, start_after, limit)?)
    }

    pub fn utxos_for_address(&self, address: &str) -> RuntimeResult<Vec<Utxo>> {
        Ok(ledger::utxos_for_address(&self.store, address)?)
    }

    pub fn last_processed_height(&self) -> RuntimeResult<u64> {
        Ok(ledger::last_processed_height(&self.store)?)
    }

    pub fn balance(&self, address: &Address, denom: &str) -> RuntimeResult<u128> {
        bank::balance(&self.store, address, denom)
    }

    pub fn entropy_state(&self) -> RuntimeResult<ZkEntropyState> {
        ceremony::load_state(&self.store)
    }

    pub fn setup_keys(&self) -> RuntimeResult<Option<ZkSetupKeys>> {
        ceremony::load_setup_keys(&self.store)
    }

    pub fn state_root(&self) -> Hash {
        self.store.root()
    }
}
