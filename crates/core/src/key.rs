//! Storage key namespace
//!
//! Every durable record lives under one of these string keys:
//!
//! ```text
//! entity|<type>|<id>                            entity value
//! indexes|<type>|<index>|<computed key>|<id>    index entry (value = id)
//! latest                                        finalized block pointer
//! undoLog|<encoded sequence>                    undo log entry
//! rollingBackStartedKey                         rollback-in-progress marker
//! ```
//!
//! `|` is reserved and rejected in every raw component, so a key can always
//! be split back into its parts.

use crate::encoding::encode_natural;
use crate::error::{Error, Result};

/// Separator between key components.
pub const SEPARATOR: char = '|';

/// Separator between parts of a compound index key.
pub const COMPOUND_SEPARATOR: char = ':';

/// Prefix of entity value keys.
pub const ENTITY_PREFIX: &str = "entity";

/// Prefix of index entry keys.
pub const INDEX_PREFIX: &str = "indexes";

/// Key holding the finalized block identifier.
pub const FINALIZED_BLOCK_KEY: &str = "latest";

/// Prefix of undo log entries.
pub const UNDO_LOG_PREFIX: &str = "undoLog|";

/// Key set while a rollback is in progress.
pub const ROLLBACK_MARKER_KEY: &str = "rollingBackStartedKey";

fn check_component(kind: &str, component: &str) -> Result<()> {
    if component.contains(SEPARATOR) {
        return Err(Error::InvalidKey(format!(
            "{} {:?} contains reserved separator '{}'",
            kind, component, SEPARATOR
        )));
    }
    Ok(())
}

/// Key of an entity value: `entity|<type>|<id>`.
pub fn entity_key(entity_type: &str, id: &str) -> Result<String> {
    check_component("entity type", entity_type)?;
    check_component("entity id", id)?;
    Ok(format!("{ENTITY_PREFIX}|{entity_type}|{id}"))
}

/// Prefix shared by every entry of one index: `indexes|<type>|<index>|`.
pub fn index_prefix(entity_type: &str, index_name: &str) -> Result<String> {
    check_component("entity type", entity_type)?;
    check_component("index name", index_name)?;
    Ok(format!("{INDEX_PREFIX}|{entity_type}|{index_name}|"))
}

/// Full key of one index entry.
///
/// # Arguments
///
/// * `entity_type` - Registered entity type name
/// * `index_name` - Index name on that type
/// * `computed` - Sortable key computed by the index definition
/// * `id` - Entity id, appended so equal computed keys stay distinct
pub fn index_key(entity_type: &str, index_name: &str, computed: &str, id: &str) -> Result<String> {
    check_component("index key", computed)?;
    check_component("entity id", id)?;
    Ok(format!(
        "{}{}{}{}",
        index_prefix(entity_type, index_name)?,
        computed,
        SEPARATOR,
        id
    ))
}

/// The computed index key portion of a full index entry key.
pub fn computed_index_key(storage_key: &str) -> Option<&str> {
    storage_key.split(SEPARATOR).nth(3)
}

/// The entity id portion of a full index entry key.
pub fn index_entry_id(storage_key: &str) -> Option<&str> {
    storage_key.split(SEPARATOR).nth(4)
}

/// Key of the `seq`-th undo log entry; sorts in sequence order.
pub fn undo_log_key(seq: u64) -> String {
    format!("{UNDO_LOG_PREFIX}{}", encode_natural(seq))
}

/// Join sortable parts into one computed index key.
///
/// Parts are compared left to right, so `compound_key(&[owner, amount])`
/// groups by owner and sorts by amount within an owner.
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] if a part contains `:` or `|`.
pub fn compound_key<S: AsRef<str>>(parts: &[S]) -> Result<String> {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        let part = part.as_ref();
        check_component("compound key part", part)?;
        if part.contains(COMPOUND_SEPARATOR) {
            return Err(Error::InvalidKey(format!(
                "compound key part {:?} contains '{}'",
                part, COMPOUND_SEPARATOR
            )));
        }
        if i > 0 {
            out.push(COMPOUND_SEPARATOR);
        }
        out.push_str(part);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_layout() {
        assert_eq!(entity_key("Account", "0xabc").unwrap(), "entity|Account|0xabc");
    }

    #[test]
    fn test_index_key_layout_and_split() {
        let key = index_key("Account", "byBalance", "==212", "0xabc").unwrap();
        assert_eq!(key, "indexes|Account|byBalance|==212|0xabc");
        assert!(key.starts_with(&index_prefix("Account", "byBalance").unwrap()));
        assert_eq!(computed_index_key(&key), Some("==212"));
        assert_eq!(index_entry_id(&key), Some("0xabc"));
    }

    #[test]
    fn test_separator_rejected_everywhere() {
        assert!(entity_key("Acc|ount", "1").is_err());
        assert!(entity_key("Account", "1|2").is_err());
        assert!(index_prefix("Account", "by|x").is_err());
        assert!(index_key("Account", "byX", "a|b", "1").is_err());
    }

    #[test]
    fn test_undo_log_keys_sort_by_sequence() {
        let keys: Vec<String> = [0u64, 1, 9, 10, 11, 100, 1000].iter().map(|s| undo_log_key(*s)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(undo_log_key(0), "undoLog|0");
    }

    #[test]
    fn test_compound_key() {
        assert_eq!(compound_key(&["0xabc", "=5"]).unwrap(), "0xabc:=5");
        assert!(compound_key(&["a:b"]).is_err());
        assert!(compound_key(&["a|b"]).is_err());
    }
}
