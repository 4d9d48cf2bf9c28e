//! The indexers the binary runs
//!
//! Every `[[indexers]]` entry of `chainstore.toml` is treated as an ERC-20
//! token: `Transfer` events maintain one [`TokenHolder`] per (token, address)
//! and one [`TokenSupply`] per token.

use alloy_primitives::{Address, U256};
use chainstore_core::{
    compound_key, encode_descending_decimal, Entity, EntityDefinitions, Error, Result, TypedIndex,
};
use chainstore_engine::{ChainstoreConfig, EntityHandle, IndexerConfig, IndexerDefinition, Indexers};
use serde::{Deserialize, Serialize};

const TRANSFER: &str = "event Transfer(address indexed from, address indexed to, uint256 value)";

/// Balance of one address in one token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHolder {
    /// Indexer name of the token
    pub token: String,
    /// Holder address
    pub address: Address,
    /// Current balance
    pub tokens_owned: U256,
}

impl Entity for TokenHolder {
    const NAME: &'static str = "TokenHolder";

    fn indexes() -> Vec<TypedIndex<Self>> {
        vec![TypedIndex::new("byTokensOwned", |h: &TokenHolder| {
            let balance = encode_descending_decimal(&h.tokens_owned.to_string())?;
            compound_key(&[h.token.as_str(), balance.as_str()])
        })]
    }
}

/// Totals of one token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSupply {
    /// Minted minus burned
    pub total_supply: U256,
    /// Addresses with a non-zero balance
    pub total_owners: u64,
}

impl Entity for TokenSupply {
    const NAME: &'static str = "TokenSupply";

    fn indexes() -> Vec<TypedIndex<Self>> {
        Vec::new()
    }
}

/// Entity types written by the token indexers.
pub fn entity_definitions() -> EntityDefinitions {
    EntityDefinitions::new()
        .register::<TokenHolder>()
        .register::<TokenSupply>()
}

/// One token indexer per configured contract.
pub fn indexers(config: &ChainstoreConfig) -> Result<Indexers> {
    config
        .indexers
        .iter()
        .try_fold(Indexers::new(), |acc, entry| Ok(acc.with(token_indexer(entry)?)))
}

fn token_indexer(entry: &IndexerConfig) -> Result<IndexerDefinition> {
    let token = entry.name.clone();
    IndexerDefinition::new(&entry.name, entry.address, entry.starting_block).with_handler(
        TRANSFER,
        move |handle, args, _log| {
            apply_transfer(handle, &token, args.address(0)?, args.address(1)?, args.uint(2)?)
        },
    )
}

fn holder_id(token: &str, address: Address) -> Result<String> {
    compound_key(&[token, address.to_string().as_str()])
}

fn load_holder(handle: &mut dyn EntityHandle, token: &str, address: Address) -> Result<TokenHolder> {
    Ok(handle
        .get::<TokenHolder>(&holder_id(token, address)?)?
        .unwrap_or_else(|| TokenHolder {
            token: token.to_string(),
            address,
            tokens_owned: U256::ZERO,
        }))
}

fn apply_transfer(
    handle: &mut dyn EntityHandle,
    token: &str,
    from: Address,
    to: Address,
    value: U256,
) -> Result<()> {
    if from == to {
        return Ok(());
    }

    let mut supply = handle.get::<TokenSupply>(token)?.unwrap_or_default();

    if from == Address::ZERO {
        supply.total_supply = supply.total_supply.saturating_add(value);
    } else {
        let mut sender = load_holder(handle, token, from)?;
        sender.tokens_owned = sender.tokens_owned.checked_sub(value).ok_or_else(|| {
            Error::Decode(format!(
                "transfer of {} exceeds balance {} of {}",
                value, sender.tokens_owned, from
            ))
        })?;
        if sender.tokens_owned.is_zero() && !value.is_zero() {
            supply.total_owners = supply.total_owners.saturating_sub(1);
        }
        handle.save(&holder_id(token, from)?, &sender)?;
    }

    if to == Address::ZERO {
        supply.total_supply = supply.total_supply.saturating_sub(value);
    } else {
        let mut receiver = load_holder(handle, token, to)?;
        if receiver.tokens_owned.is_zero() && !value.is_zero() {
            supply.total_owners += 1;
        }
        receiver.tokens_owned = receiver.tokens_owned.saturating_add(value);
        handle.save(&holder_id(token, to)?, &receiver)?;
    }

    handle.save(token, &supply)
}
