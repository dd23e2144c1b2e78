//! Tracking store: the version ledger and committed card rows
//!
//! Two seams live here. [`Ledger`] holds one entry per family (last issued
//! version plus a revision token) and exposes compare-and-swap on that
//! token; it is the only serialization point between writers. [`CardStore`]
//! holds committed cards and is append-only apart from the status column.
//!
//! Both are implemented over SQLite and over an in-process map.

mod memory;
mod sqlite;

pub use memory::MemoryTracking;
pub use sqlite::SqliteTracking;

use crate::card::{Card, CardKind, CardStatus, Tags};
use crate::error::{RegistryError, Result};
use crate::version::VersionFilter;
use chrono::{DateTime, Utc};
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;

/// Last issued version of a family and the token guarding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub version: Version,
    pub revision: u64,
}

/// A reservation that was issued but never committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbandonedVersion {
    pub team: String,
    pub name: String,
    pub version: Version,
    pub reason: String,
    pub abandoned_at: DateTime<Utc>,
}

/// Durable per-family version ledger
pub trait Ledger: Send + Sync {
    /// Current entry, `None` if the family never issued a version
    fn entry(&self, team: &str, name: &str) -> Result<Option<LedgerEntry>>;

    /// Replace the entry if its revision is still `expected`
    ///
    /// `expected == None` creates the entry and succeeds only if the family
    /// has none yet. Returns the new entry, or `None` if another writer got
    /// there first.
    fn compare_and_swap(
        &self,
        team: &str,
        name: &str,
        expected: Option<u64>,
        next: &Version,
    ) -> Result<Option<LedgerEntry>>;

    /// Remember that `version` was issued but will never be committed
    fn record_abandoned(&self, abandoned: &AbandonedVersion) -> Result<()>;

    /// Abandoned reservations of a family, oldest first
    fn abandoned(&self, team: &str, name: &str) -> Result<Vec<AbandonedVersion>>;
}

/// Committed card rows
pub trait CardStore: Send + Sync {
    /// Insert a committed card
    ///
    /// A duplicate uid, storage path or (team, name, version) is a
    /// `Conflict`: the ledger must never let one happen.
    fn insert(&self, card: &Card) -> Result<()>;

    fn get(&self, uid: &str) -> Result<Option<Card>>;

    /// Cards matching `query`, ordered and limited as [`CardQuery::finish`] does
    fn query(&self, query: &CardQuery) -> Result<Vec<Card>>;

    /// Move a committed card from `expected` to `next`
    ///
    /// `NotFound` if the uid is unknown, `Conflict` if the stored status is
    /// no longer `expected`.
    fn set_status(&self, uid: &str, expected: CardStatus, next: CardStatus) -> Result<()>;

    /// Teams with at least one visible card, sorted
    fn teams(&self) -> Result<Vec<String>>;

    /// Distinct card names, optionally within one team, sorted
    fn names(&self, team: Option<&str>) -> Result<Vec<String>>;
}

/// Filters for card listings
///
/// `team` and `name` are compared after cleaning, like registration does.
#[derive(Debug, Clone, Default)]
pub struct CardQuery {
    pub uid: Option<String>,
    pub team: Option<String>,
    pub name: Option<String>,
    pub kind: Option<CardKind>,
    pub version: Option<VersionFilter>,
    /// Every pair must be present on the card
    pub tags: Tags,
    /// Only cards created at or before this instant
    pub max_date: Option<DateTime<Utc>>,
    pub ignore_prerelease: bool,
    pub include_inactive: bool,
    pub limit: Option<usize>,
}

impl CardQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn kind(mut self, kind: CardKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Restrict to versions matching `req` (`1.2.3`, `^1.2`, `~1.2`, `1.*`)
    pub fn version(mut self, req: &str) -> Result<Self> {
        self.version = Some(VersionFilter::parse(req)?);
        Ok(self)
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn max_date(mut self, max_date: DateTime<Utc>) -> Self {
        self.max_date = Some(max_date);
        self
    }

    pub fn ignore_prerelease(mut self) -> Self {
        self.ignore_prerelease = true;
        self
    }

    pub fn include_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `card` passes every filter
    pub fn matches(&self, card: &Card) -> bool {
        if let Some(uid) = &self.uid {
            if &card.uid != uid {
                return false;
            }
        }
        if let Some(team) = &self.team {
            if &card.team != team {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &card.name != name {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if card.kind != kind {
                return false;
            }
        }
        if !self.include_inactive && !card.status.is_visible() {
            return false;
        }
        if self.ignore_prerelease && card.is_prerelease() {
            return false;
        }
        if let Some(max_date) = self.max_date {
            if card.created_at > max_date {
                return false;
            }
        }
        if let Some(filter) = &self.version {
            if !filter.matches(&card.version) {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(key, value)| card.tags.get(key) == Some(value))
    }

    /// Filter, order and truncate candidate rows
    ///
    /// Families are ordered by (team, name); within a family newest version
    /// first.
    pub fn finish(&self, candidates: impl IntoIterator<Item = Card>) -> Vec<Card> {
        let mut cards: Vec<Card> = candidates.into_iter().filter(|c| self.matches(c)).collect();
        cards.sort_by(|a, b| {
            a.team
                .cmp(&b.team)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| b.version.cmp(&a.version))
        });
        if let Some(limit) = self.limit {
            cards.truncate(limit);
        }
        cards
    }
}

/// Parsed tracking-store location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingUri {
    Sqlite(PathBuf),
    SqliteMemory,
    Memory,
}

impl TrackingUri {
    /// Parse `sqlite://<path>`, `sqlite::memory:` or `memory://`
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        match uri {
            "sqlite::memory:" | "sqlite://:memory:" => return Ok(TrackingUri::SqliteMemory),
            "memory://" | "memory" => return Ok(TrackingUri::Memory),
            _ => {}
        }

        match uri.strip_prefix("sqlite://") {
            Some(path) if !path.is_empty() => Ok(TrackingUri::Sqlite(PathBuf::from(path))),
            _ => Err(RegistryError::Config(format!(
                "unsupported tracking URI '{}'. Valid options: sqlite://<path>, sqlite::memory:, memory://",
                uri
            ))),
        }
    }
}

/// Ledger and card store opened from one backing store
#[derive(Clone)]
pub struct Tracking {
    pub ledger: Arc<dyn Ledger>,
    pub cards: Arc<dyn CardStore>,
}

impl Tracking {
    pub fn sqlite(store: SqliteTracking) -> Self {
        let store = Arc::new(store);
        Tracking {
            ledger: store.clone(),
            cards: store,
        }
    }

    pub fn memory() -> Self {
        let store = Arc::new(MemoryTracking::new());
        Tracking {
            ledger: store.clone(),
            cards: store,
        }
    }
}

/// Open the tracking store selected by `uri`
pub fn open_tracking(uri: &TrackingUri) -> Result<Tracking> {
    match uri {
        TrackingUri::Sqlite(path) => Ok(Tracking::sqlite(SqliteTracking::open(path)?)),
        TrackingUri::SqliteMemory => Ok(Tracking::sqlite(SqliteTracking::open_in_memory()?)),
        TrackingUri::Memory => Ok(Tracking::memory()),
    }
}
