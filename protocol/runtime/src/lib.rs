//! State transition logic for the Bitcoin attestation bridge: block
//! ingestion, claims, the entropy ceremony and the message envelope tying
//! them together.

pub mod app;
pub mod bank;
pub mod bitcoin_block;
pub mod ceremony;
pub mod claim;
mod error;
pub mod genesis;
pub mod ingest;
pub mod msg;
pub mod params;

pub use app::{App, DeliverOutcome};
pub use ceremony::{SubmitOutcome, SubmitZkEntropy, ZkEntropyState, ZkEntropySubmission, ZkSetupKeys};
pub use claim::{ClaimResult, ClaimWithProof, GovClaimUtxo};
pub use error::{RuntimeError, RuntimeResult};
pub use genesis::{GenesisConfig, GenesisValidator};
pub use ingest::{AttestedBlock, IngestOutcome, IngestSummary};
pub use msg::Msg;
pub use params::{Params, UpdateParams};
