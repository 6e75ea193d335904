use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{normalize_address, InvalidAddress, TrackedAddress};

/// Shared between the pipeline (reloads, single writer) and the copy engine.
pub type SharedRegistry = Arc<RwLock<TrackedRegistry>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidAddress(#[from] InvalidAddress),

    #[error("copy ratio must be in (0, 1], got {0}")]
    InvalidCopyRatio(Decimal),

    #[error("max position size must be positive")]
    ZeroMaxPosition,
}

/// Build a validated `TrackedAddress` for an operator "add" action.
pub fn tracked_address(
    address: &str,
    max_position_size: u64,
    copy_ratio: Decimal,
) -> Result<TrackedAddress, RegistryError> {
    let address = normalize_address(address)?;
    if copy_ratio <= Decimal::ZERO || copy_ratio > Decimal::ONE {
        return Err(RegistryError::InvalidCopyRatio(copy_ratio));
    }
    if max_position_size == 0 {
        return Err(RegistryError::ZeroMaxPosition);
    }

    Ok(TrackedAddress {
        address,
        added_at: Utc::now(),
        max_position_size,
        copy_ratio,
    })
}

/// Addresses whose trades are replicated, keyed by normalized address.
///
/// Nothing in the pipeline promotes ranked traders into this set; entries
/// come only from operator actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedRegistry {
    entries: BTreeMap<String, TrackedAddress>,
}

impl TrackedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = TrackedAddress>) -> Self {
        let mut registry = Self::new();
        for entry in entries {
            registry.add(entry);
        }
        registry
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Insert or replace. Returns the previous entry for the address.
    pub fn add(&mut self, mut entry: TrackedAddress) -> Option<TrackedAddress> {
        entry.address = entry.address.to_lowercase();
        self.entries.insert(entry.address.clone(), entry)
    }

    pub fn remove(&mut self, address: &str) -> Option<TrackedAddress> {
        self.entries.remove(&address.to_lowercase())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(&address.to_lowercase())
    }

    pub fn get(&self, address: &str) -> Option<&TrackedAddress> {
        self.entries.get(&address.to_lowercase())
    }

    /// All entries ordered by address.
    pub fn list(&self) -> Vec<TrackedAddress> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "0x00000000000000000000000000000000000000AA";

    #[test]
    fn test_add_contains_remove() {
        let mut registry = TrackedRegistry::new();
        let entry = tracked_address(ADDR, 50, Decimal::new(1, 1)).unwrap();

        assert!(registry.add(entry).is_none());
        assert!(registry.contains(ADDR));
        assert!(registry.contains(&ADDR.to_lowercase()));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(ADDR).is_some());
        assert!(!registry.contains(ADDR));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_replaces_existing() {
        let mut registry = TrackedRegistry::new();
        registry.add(tracked_address(ADDR, 50, Decimal::new(1, 1)).unwrap());
        let previous = registry.add(tracked_address(ADDR, 80, Decimal::new(2, 1)).unwrap());

        assert_eq!(previous.unwrap().max_position_size, 50);
        assert_eq!(registry.get(ADDR).unwrap().max_position_size, 80);
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = TrackedRegistry::from_entries([
            tracked_address("0x00000000000000000000000000000000000000cc", 1, Decimal::ONE).unwrap(),
            tracked_address("0x00000000000000000000000000000000000000aa", 1, Decimal::ONE).unwrap(),
        ]);
        let addresses: Vec<String> = registry.list().into_iter().map(|e| e.address).collect();
        assert_eq!(
            addresses,
            vec![
                "0x00000000000000000000000000000000000000aa",
                "0x00000000000000000000000000000000000000cc"
            ]
        );
    }

    #[test]
    fn test_tracked_address_validation() {
        assert!(matches!(
            tracked_address("nope", 1, Decimal::ONE),
            Err(RegistryError::InvalidAddress(_))
        ));
        assert!(matches!(
            tracked_address(ADDR, 1, Decimal::ZERO),
            Err(RegistryError::InvalidCopyRatio(_))
        ));
        assert!(matches!(
            tracked_address(ADDR, 1, Decimal::from(2)),
            Err(RegistryError::InvalidCopyRatio(_))
        ));
        assert_eq!(
            tracked_address(ADDR, 0, Decimal::ONE),
            Err(RegistryError::ZeroMaxPosition)
        );
    }
}
