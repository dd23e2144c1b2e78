//! Fault injection around artifact storage
//!
//! A payload write that fails after the version was reserved must burn that
//! version, leave no lookupable card and no readable payload, and not
//! disturb the next registration.

use cardvault_rs::{
    Artifact, BumpKind, CardQuery, CardRegistry, DataCardMetadata, MemoryStorage, NewCard,
    RegistryBuilder, RegistryConfig, RegistryError, Result, RetrySettings, StorageClient,
    StorageSystem, Table, Column, ColumnData, Tracking,
};
use cardvault_rs::core::storage::PathIter;
use cardvault_rs::core::tracking::{CardStore, MemoryTracking};
use cardvault_rs::{Card, CardStatus};
use semver::Version;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Memory storage that fails or truncates puts on request
struct FaultyStorage {
    inner: MemoryStorage,
    failing_puts: AtomicU32,
    transient: AtomicBool,
    truncate: AtomicBool,
    rename: bool,
    puts: AtomicU32,
}

impl FaultyStorage {
    fn new(rename: bool) -> Self {
        FaultyStorage {
            inner: MemoryStorage::new(),
            failing_puts: AtomicU32::new(0),
            transient: AtomicBool::new(false),
            truncate: AtomicBool::new(false),
            rename,
            puts: AtomicU32::new(0),
        }
    }

    fn fail_next_puts(&self, count: u32, transient: bool) {
        self.transient.store(transient, Ordering::SeqCst);
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    fn paths(&self) -> Vec<String> {
        self.inner.list("").unwrap().map(|p| p.unwrap()).collect()
    }
}

impl StorageClient for FaultyStorage {
    fn system(&self) -> StorageSystem {
        StorageSystem::Memory
    }

    fn root_uri(&self) -> String {
        "faulty://".to_string()
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_puts.store(remaining - 1, Ordering::SeqCst);
            return if self.transient.load(Ordering::SeqCst) {
                Err(RegistryError::transient(path, "connection reset"))
            } else {
                Err(RegistryError::storage(path, "bucket is read-only"))
            };
        }
        if self.truncate.load(Ordering::SeqCst) {
            return self.inner.put(path, &data[..data.len() / 2]);
        }
        self.inner.put(path, data)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.get(path)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path)
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.inner.size(path)
    }

    fn list(&self, prefix: &str) -> Result<PathIter<'_>> {
        self.inner.list(prefix)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path)
    }

    fn supports_rename(&self) -> bool {
        self.rename
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }
}

fn registry(storage: Arc<FaultyStorage>) -> CardRegistry {
    RegistryBuilder::from_config(RegistryConfig::in_memory())
        .with_tracking(Tracking::memory())
        .with_storage(storage)
        .retry(RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        })
        .build()
        .unwrap()
}

fn card() -> NewCard {
    let table = Table::new(vec![Column {
        name: "label".into(),
        data: ColumnData::Bool(vec![true, false, true]),
    }])
    .unwrap();
    NewCard::data("risk", "labels", DataCardMetadata::default()).with_payload(Artifact::Tabular(table))
}

fn assert_failed_registration_is_invisible(reg: &CardRegistry, storage: &FaultyStorage) {
    assert!(reg
        .list(&CardQuery::new().team("risk").name("labels").include_inactive())
        .unwrap()
        .is_empty());
    assert!(storage.paths().is_empty(), "orphans: {:?}", storage.paths());

    let abandoned = reg.abandoned_versions("risk", "labels").unwrap();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].version, Version::new(0, 0, 1));
}

#[test]
fn test_permanent_failure_abandons_reservation() {
    for rename in [true, false] {
        let storage = Arc::new(FaultyStorage::new(rename));
        let reg = registry(Arc::clone(&storage));

        storage.fail_next_puts(1, false);
        let err = reg.register(card(), BumpKind::Patch).unwrap_err();
        assert!(matches!(err, RegistryError::Storage { transient: false, .. }));
        assert!(err.to_string().contains("risk/labels v0.0.1"), "{}", err);
        // permanent errors are not retried
        assert_eq!(storage.puts.load(Ordering::SeqCst), 1);

        assert_failed_registration_is_invisible(&reg, &storage);

        // the next reservation skips the burnt version
        let next = reg.register(card(), BumpKind::Patch).unwrap();
        assert_eq!(next.version, Version::new(0, 0, 2));
        assert_eq!(next.storage_path, "risk/labels/v0.0.2/tabular");
        assert!(reg.load_artifact(&next.uid).is_ok());
    }
}

#[test]
fn test_transient_failure_within_budget_succeeds() {
    let storage = Arc::new(FaultyStorage::new(true));
    let reg = registry(Arc::clone(&storage));

    storage.fail_next_puts(2, true);
    let registered = reg.register(card(), BumpKind::Patch).unwrap();
    assert_eq!(registered.version, Version::new(0, 0, 1));
    assert_eq!(storage.puts.load(Ordering::SeqCst), 3);
    assert!(reg.abandoned_versions("risk", "labels").unwrap().is_empty());

    // staging leftovers never survive
    assert_eq!(storage.paths(), vec!["risk/labels/v0.0.1/tabular".to_string()]);
}

#[test]
fn test_transient_failure_beyond_budget_abandons() {
    let storage = Arc::new(FaultyStorage::new(true));
    let reg = registry(Arc::clone(&storage));

    storage.fail_next_puts(10, true);
    let err = reg.register(card(), BumpKind::Patch).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(storage.puts.load(Ordering::SeqCst), 3);

    assert_failed_registration_is_invisible(&reg, &storage);
}

#[test]
fn test_truncated_write_is_never_readable() {
    let storage = Arc::new(FaultyStorage::new(false));
    let reg = registry(Arc::clone(&storage));

    storage.truncate.store(true, Ordering::SeqCst);
    assert!(matches!(
        reg.register(card(), BumpKind::Patch),
        Err(RegistryError::Storage { .. })
    ));
    assert_failed_registration_is_invisible(&reg, &storage);

    storage.truncate.store(false, Ordering::SeqCst);
    let next = reg.register(card(), BumpKind::Patch).unwrap();
    assert_eq!(next.version, Version::new(0, 0, 2));
}

#[test]
fn test_validation_failure_reserves_nothing() {
    let storage = Arc::new(FaultyStorage::new(true));
    let reg = registry(Arc::clone(&storage));

    let mut bad = card();
    if let cardvault_rs::CardMetadata::Data(meta) = &mut bad.metadata {
        meta.feature_map.insert("label".into(), "int64".into());
    }
    assert!(matches!(
        reg.register(bad, BumpKind::Patch),
        Err(RegistryError::Validation(_))
    ));
    assert_eq!(storage.puts.load(Ordering::SeqCst), 0);
    assert!(reg.abandoned_versions("risk", "labels").unwrap().is_empty());

    let first = reg.register(card(), BumpKind::Patch).unwrap();
    assert_eq!(first.version, Version::new(0, 0, 1));
}

/// Card store whose next inserts fail with a chosen error
struct FailingCards {
    inner: Arc<MemoryTracking>,
    failing_inserts: AtomicU32,
    busy: AtomicBool,
    inserts: AtomicU32,
}

impl FailingCards {
    fn new(inner: Arc<MemoryTracking>) -> Self {
        FailingCards {
            inner,
            failing_inserts: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            inserts: AtomicU32::new(0),
        }
    }

    fn fail_next_inserts(&self, count: u32, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
        self.failing_inserts.store(count, Ordering::SeqCst);
    }
}

impl CardStore for FailingCards {
    fn insert(&self, card: &Card) -> Result<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_inserts.store(remaining - 1, Ordering::SeqCst);
            return if self.busy.load(Ordering::SeqCst) {
                Err(RegistryError::Tracking(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    Some("database is locked".to_string()),
                )))
            } else {
                Err(RegistryError::Conflict(format!(
                    "path {} already committed",
                    card.storage_path
                )))
            };
        }
        self.inner.insert(card)
    }

    fn get(&self, uid: &str) -> Result<Option<Card>> {
        self.inner.get(uid)
    }

    fn query(&self, query: &CardQuery) -> Result<Vec<Card>> {
        self.inner.query(query)
    }

    fn set_status(&self, uid: &str, expected: CardStatus, next: CardStatus) -> Result<()> {
        self.inner.set_status(uid, expected, next)
    }

    fn teams(&self) -> Result<Vec<String>> {
        self.inner.teams()
    }

    fn names(&self, team: Option<&str>) -> Result<Vec<String>> {
        self.inner.names(team)
    }
}

fn registry_with_cards(storage: Arc<FaultyStorage>, cards: Arc<FailingCards>) -> CardRegistry {
    RegistryBuilder::from_config(RegistryConfig::in_memory())
        .with_tracking(Tracking {
            ledger: Arc::clone(&cards.inner) as _,
            cards,
        })
        .with_storage(storage)
        .retry(RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        })
        .build()
        .unwrap()
}

#[test]
fn test_commit_failure_abandons_and_removes_payload() {
    for (busy, expected_inserts) in [(false, 1), (true, 3)] {
        let storage = Arc::new(FaultyStorage::new(true));
        let cards = Arc::new(FailingCards::new(Arc::new(MemoryTracking::new())));
        let reg = registry_with_cards(Arc::clone(&storage), Arc::clone(&cards));

        cards.fail_next_inserts(10, busy);
        let err = reg.register(card(), BumpKind::Patch).unwrap_err();
        if busy {
            assert!(matches!(err, RegistryError::Tracking(_)));
        } else {
            assert!(matches!(err, RegistryError::Conflict(_)));
        }
        assert_eq!(cards.inserts.load(Ordering::SeqCst), expected_inserts);

        // the payload was written before the commit and must be gone again
        assert_eq!(storage.puts.load(Ordering::SeqCst), 1);
        assert!(!storage.exists("risk/labels/v0.0.1/tabular").unwrap());
        assert_failed_registration_is_invisible(&reg, &storage);

        cards.fail_next_inserts(0, false);
        let next = reg.register(card(), BumpKind::Patch).unwrap();
        assert_eq!(next.version, Version::new(0, 0, 2));
        assert!(reg.load_artifact(&next.uid).is_ok());
    }
}

#[test]
fn test_busy_commit_within_budget_succeeds() {
    let storage = Arc::new(FaultyStorage::new(true));
    let cards = Arc::new(FailingCards::new(Arc::new(MemoryTracking::new())));
    let reg = registry_with_cards(Arc::clone(&storage), Arc::clone(&cards));

    cards.fail_next_inserts(2, true);
    let registered = reg.register(card(), BumpKind::Patch).unwrap();
    assert_eq!(registered.version, Version::new(0, 0, 1));
    assert_eq!(cards.inserts.load(Ordering::SeqCst), 3);
    assert!(reg.load(&registered.uid).is_ok());
    assert!(reg.abandoned_versions("risk", "labels").unwrap().is_empty());
}
