#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use cycle_kernel_domain::{
    chain_hash, now_utc, CycleError, EntryId, EntryType, LedgerEntry,
};
use serde_json::Value;

/// Append-only storage for hash-chained ledger entries.
///
/// Implementations only store and retrieve rows; chain construction and
/// verification live in this crate so every backend shares one hashing
/// discipline.
pub trait LedgerStore {
    #[allow(clippy::missing_errors_doc)]
    fn head_hash(&self) -> Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_entry(&self, entry: &LedgerEntry) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_entry(&self, hash: &str) -> Result<Option<LedgerEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_entries(&self) -> Result<Vec<LedgerEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn entries_of_type(&self, entry_type: EntryType) -> Result<Vec<LedgerEntry>>;
}

/// Commits a payload to the chain: canonicalize, link to the current head,
/// digest, append. Returns the new head hash.
///
/// # Errors
/// Returns an error when the payload cannot be serialized or the backend
/// append fails; a failed append is fatal for the cycle in progress.
pub fn commit(
    store: &dyn LedgerStore,
    entry_type: EntryType,
    payload: Value,
    parent_hashes: Vec<String>,
) -> Result<String> {
    let prev_hash = store.head_hash()?;
    let hash = chain_hash(&payload, prev_hash.as_deref())?;

    let entry = LedgerEntry {
        entry_id: EntryId::new(),
        entry_type,
        payload,
        parent_hashes,
        prev_hash,
        hash: hash.clone(),
        recorded_at: now_utc(),
    };
    store.append_entry(&entry)?;
    Ok(hash)
}

/// Walks the chain in insertion order, recomputing every hash from the
/// stored payload and previous hash. Stored hashes are treated as an
/// untrusted cache; the first mismatch is fatal corruption.
///
/// # Errors
/// Returns [`CycleError::Integrity`] carrying the first broken index.
pub fn verify_entries(entries: &[LedgerEntry]) -> Result<(), CycleError> {
    let mut prev: Option<String> = None;
    for (index, entry) in entries.iter().enumerate() {
        if entry.prev_hash != prev {
            return Err(CycleError::Integrity {
                index,
                detail: "prev_hash does not match preceding entry".to_string(),
            });
        }
        let recomputed = chain_hash(&entry.payload, prev.as_deref())?;
        if recomputed != entry.hash {
            return Err(CycleError::Integrity {
                index,
                detail: "stored hash does not match recomputed hash".to_string(),
            });
        }
        prev = Some(entry.hash.clone());
    }
    Ok(())
}

/// Loads the full chain from a store and verifies it.
///
/// # Errors
/// Returns [`CycleError::Io`] when the backend read fails and
/// [`CycleError::Integrity`] with the offending index on a broken chain.
pub fn verify_chain(store: &dyn LedgerStore) -> Result<(), CycleError> {
    let entries = store
        .list_entries()
        .map_err(|err| CycleError::Io(format!("ledger read failed: {err}")))?;
    verify_entries(&entries)
}

/// In-memory ledger. Each append publishes a fresh immutable view so
/// concurrent readers never observe a partially built chain.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    view: RwLock<Arc<Vec<LedgerEntry>>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Result<Arc<Vec<LedgerEntry>>> {
        self.view
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| anyhow!("ledger view lock poisoned"))
    }
}

impl LedgerStore for MemoryLedger {
    fn head_hash(&self) -> Result<Option<String>> {
        Ok(self.snapshot()?.last().map(|entry| entry.hash.clone()))
    }

    fn append_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let mut guard = self
            .view
            .write()
            .map_err(|_| anyhow!("ledger view lock poisoned"))?;
        let mut next: Vec<LedgerEntry> = guard.as_ref().clone();
        next.push(entry.clone());
        *guard = Arc::new(next);
        Ok(())
    }

    fn get_entry(&self, hash: &str) -> Result<Option<LedgerEntry>> {
        Ok(self
            .snapshot()?
            .iter()
            .find(|entry| entry.hash == hash)
            .cloned())
    }

    fn list_entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.snapshot()?.as_ref().clone())
    }

    fn entries_of_type(&self, entry_type: EntryType) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .snapshot()?
            .iter()
            .filter(|entry| entry.entry_type == entry_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn seeded_ledger(payload_count: usize) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        for index in 0..payload_count {
            let _ = must(commit(
                &ledger,
                EntryType::CycleOutcome,
                json!({"cycle": index}),
                Vec::new(),
            ));
        }
        ledger
    }

    #[test]
    fn genesis_entry_has_no_prev_hash() {
        let ledger = seeded_ledger(1);
        let entries = must(ledger.list_entries());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].prev_hash.is_none());
    }

    #[test]
    fn commit_links_each_entry_to_the_previous_head() {
        let ledger = seeded_ledger(3);
        let entries = must(ledger.list_entries());
        assert_eq!(entries[1].prev_hash.as_deref(), Some(entries[0].hash.as_str()));
        assert_eq!(entries[2].prev_hash.as_deref(), Some(entries[1].hash.as_str()));
        assert_eq!(must(ledger.head_hash()).as_deref(), Some(entries[2].hash.as_str()));
    }

    #[test]
    fn verify_chain_accepts_committed_entries() {
        let ledger = seeded_ledger(5);
        assert!(verify_chain(&ledger).is_ok());
    }

    #[test]
    fn payload_mutation_breaks_verification_at_that_index() {
        let ledger = seeded_ledger(4);
        let mut entries = must(ledger.list_entries());
        entries[2].payload = json!({"cycle": "tampered"});

        match verify_entries(&entries) {
            Err(CycleError::Integrity { index, .. }) => assert_eq!(index, 2),
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn relinked_prev_hash_breaks_verification() {
        let ledger = seeded_ledger(3);
        let mut entries = must(ledger.list_entries());
        entries[2].prev_hash = Some("forged".to_string());

        match verify_entries(&entries) {
            Err(CycleError::Integrity { index, .. }) => assert_eq!(index, 2),
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn get_entry_returns_none_for_unknown_hash() {
        let ledger = seeded_ledger(2);
        assert!(must(ledger.get_entry("missing")).is_none());

        let head = must(ledger.head_hash());
        let head = head.unwrap_or_default();
        assert!(must(ledger.get_entry(&head)).is_some());
    }

    #[test]
    fn entries_of_type_filters_by_type() {
        let ledger = MemoryLedger::new();
        let _ = must(commit(
            &ledger,
            EntryType::Decision,
            json!({"choice": "apply"}),
            Vec::new(),
        ));
        let _ = must(commit(
            &ledger,
            EntryType::Artifact,
            json!({"title": "report"}),
            Vec::new(),
        ));
        let _ = must(commit(
            &ledger,
            EntryType::Decision,
            json!({"choice": "defer"}),
            Vec::new(),
        ));

        assert_eq!(must(ledger.entries_of_type(EntryType::Decision)).len(), 2);
        assert_eq!(must(ledger.entries_of_type(EntryType::Artifact)).len(), 1);
        assert!(must(ledger.entries_of_type(EntryType::Governance)).is_empty());
    }

    proptest! {
        #[test]
        fn any_single_byte_flip_is_detected(
            payloads in proptest::collection::vec(0u32..1000, 2..12),
            flip_index in 0usize..12,
        ) {
            let ledger = MemoryLedger::new();
            for value in &payloads {
                let _ = must(commit(
                    &ledger,
                    EntryType::CycleOutcome,
                    json!({"value": value, "tag": "prop"}),
                    Vec::new(),
                ));
            }

            let mut entries = must(ledger.list_entries());
            prop_assert!(verify_entries(&entries).is_ok());

            let target = flip_index % entries.len();
            entries[target].payload = json!({"value": "flipped", "tag": "prop"});

            match verify_entries(&entries) {
                Err(CycleError::Integrity { index, .. }) => prop_assert_eq!(index, target),
                other => prop_assert!(false, "expected integrity failure, got {:?}", other),
            }
        }
    }
}
