use bitgate_state::{module_address, parse_address, read, write, format_address, KvStore};
use serde::{Deserialize, Serialize};

use crate::{RuntimeError, RuntimeResult};

const PARAMS_KEY: &[u8] = b"params";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Hex chain address allowed to run governance claims and update params.
    pub authority: String,
    pub bond_denom: String,
    /// Bonded validators needed to open the ceremony, and submissions needed
    /// to close it.
    pub zk_entropy_threshold: u32,
    /// Blocks after activation during which entropy is accepted.
    pub zk_entropy_window: u64,
    pub chain_id: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            authority: format_address(&module_address("gov")),
            bond_denom: "ubgt".into(),
            zk_entropy_threshold: 3,
            zk_entropy_window: 100,
            chain_id: "bitgate-devnet".into(),
        }
    }
}

impl Params {
    pub fn validate(&self) -> RuntimeResult<()> {
        if parse_address(&self.authority).is_none() {
            return Err(RuntimeError::invalid("authority is not a chain address"));
        }
        if self.bond_denom.trim().is_empty() {
            return Err(RuntimeError::invalid("bond denom must not be empty"));
        }
        if self.zk_entropy_threshold == 0 {
            return Err(RuntimeError::invalid("entropy threshold must be positive"));
        }
        if self.zk_entropy_window == 0 {
            return Err(RuntimeError::invalid("entropy window must be positive"));
        }
        if self.chain_id.trim().is_empty() {
            return Err(RuntimeError::invalid("chain id must not be empty"));
        }
        Ok(())
    }

    pub fn is_authority(&self, candidate: &str) -> bool {
        match (parse_address(&self.authority), parse_address(candidate)) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParams {
    pub authority: String,
    pub params: Params,
}

/// Stored overrides, falling back to defaults before genesis wrote any.
pub fn load_params(store: &dyn KvStore) -> RuntimeResult<Params> {
    Ok(read::<Params>(store, PARAMS_KEY)?.unwrap_or_default())
}

pub fn store_params(store: &mut dyn KvStore, params: &Params) -> RuntimeResult<()> {
    params.validate()?;
    write(store, PARAMS_KEY, params)?;
    Ok(())
}

pub fn update_params(store: &mut dyn KvStore, msg: &UpdateParams) -> RuntimeResult<()> {
    let current = load_params(store)?;
    if !current.is_authority(&msg.authority) {
        return Err(RuntimeError::Unauthorized(format!(
            "{} is not the params authority",
            msg.authority
        )));
    }
    store_params(store, &msg.params)?;
    tracing::info!(
        threshold = msg.params.zk_entropy_threshold,
        window = msg.params.zk_entropy_window,
        "params updated"
    );
    Ok(())
}
