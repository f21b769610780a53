//! Minimal balance keeping for minted claim tokens.

use bitgate_state::{format_address, read, write, Address, KvStore};

use crate::{RuntimeError, RuntimeResult};

fn balance_key(address: &Address, denom: &str) -> Vec<u8> {
    format!("bank/balance/{}/{}", format_address(address), denom).into_bytes()
}

fn supply_key(denom: &str) -> Vec<u8> {
    format!("bank/supply/{denom}").into_bytes()
}

pub fn balance(store: &dyn KvStore, address: &Address, denom: &str) -> RuntimeResult<u128> {
    Ok(read::<u128>(store, &balance_key(address, denom))?.unwrap_or(0))
}

pub fn supply(store: &dyn KvStore, denom: &str) -> RuntimeResult<u128> {
    Ok(read::<u128>(store, &supply_key(denom))?.unwrap_or(0))
}

pub fn mint(store: &mut dyn KvStore, to: &Address, denom: &str, amount: u128) -> RuntimeResult<()> {
    let next_supply = supply(store, denom)?
        .checked_add(amount)
        .ok_or_else(|| RuntimeError::invalid("supply overflow"))?;
    let next_balance = balance(store, to, denom)?
        .checked_add(amount)
        .ok_or_else(|| RuntimeError::invalid("balance overflow"))?;
    write(store, &supply_key(denom), &next_supply)?;
    write(store, &balance_key(to, denom), &next_balance)?;
    Ok(())
}

pub fn transfer(
    store: &mut dyn KvStore,
    from: &Address,
    to: &Address,
    denom: &str,
    amount: u128,
) -> RuntimeResult<()> {
    let from_balance = balance(store, from, denom)?;
    if from_balance < amount {
        return Err(RuntimeError::InsufficientFunds {
            balance: from_balance,
            needed: amount,
        });
    }
    if from == to {
        return Ok(());
    }
    write(store, &balance_key(from, denom), &(from_balance - amount))?;
    let to_balance = balance(store, to, denom)?
        .checked_add(amount)
        .ok_or_else(|| RuntimeError::invalid("balance overflow"))?;
    write(store, &balance_key(to, denom), &to_balance)?;
    Ok(())
}
