//! SQLite tracking store
//!
//! One connection guarded by a mutex. Cross-process writers are serialized
//! by SQLite itself (WAL plus a busy timeout); the ledger compare-and-swap is
//! a conditional `UPDATE` on the revision token, so it stays correct even
//! when another process shares the database file.

use super::{AbandonedVersion, CardQuery, CardStore, Ledger, LedgerEntry};
use crate::card::{Card, CardKind, CardMetadata, CardStatus, Tags};
use crate::codec::ArtifactKind;
use crate::error::{RegistryError, Result};
use crate::version::parse_version;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use semver::Version;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS version_ledger (
    team            TEXT    NOT NULL,
    name            TEXT    NOT NULL,
    version_major   INTEGER NOT NULL,
    version_minor   INTEGER NOT NULL,
    version_patch   INTEGER NOT NULL,
    prerelease      TEXT    NOT NULL DEFAULT '',
    revision_token  INTEGER NOT NULL,
    updated_at      TEXT    NOT NULL,
    PRIMARY KEY (team, name)
);

CREATE TABLE IF NOT EXISTS cards (
    uid             TEXT    PRIMARY KEY,
    kind            TEXT    NOT NULL,
    team            TEXT    NOT NULL,
    name            TEXT    NOT NULL,
    version         TEXT    NOT NULL,
    version_major   INTEGER NOT NULL,
    version_minor   INTEGER NOT NULL,
    version_patch   INTEGER NOT NULL,
    prerelease      TEXT    NOT NULL DEFAULT '',
    storage_path    TEXT    NOT NULL UNIQUE,
    artifact_kind   TEXT    NOT NULL,
    tags            TEXT    NOT NULL,
    metadata        TEXT    NOT NULL,
    status          TEXT    NOT NULL,
    created_at      TEXT    NOT NULL,
    UNIQUE (team, name, version)
);

CREATE INDEX IF NOT EXISTS idx_cards_family ON cards (team, name);

CREATE TABLE IF NOT EXISTS abandoned_versions (
    team            TEXT    NOT NULL,
    name            TEXT    NOT NULL,
    version         TEXT    NOT NULL,
    reason          TEXT    NOT NULL,
    abandoned_at    TEXT    NOT NULL,
    PRIMARY KEY (team, name, version)
);
";

const CARD_COLUMNS: &str = "uid, kind, team, name, version, storage_path, artifact_kind, \
                            tags, metadata, status, created_at";

pub struct SqliteTracking {
    conn: Mutex<Connection>,
}

impl SqliteTracking {
    /// Open (creating if needed) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns a row, so it cannot go through execute
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        info!("Opened SQLite tracking store at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        debug!("Opened in-memory SQLite tracking store");
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteTracking {
            conn: Mutex::new(conn),
        })
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| RegistryError::Conflict(format!("bad timestamp '{}' in tracking store: {}", raw, e)))
}

fn version_from_parts(major: u64, minor: u64, patch: u64, pre: &str) -> Result<Version> {
    if pre.is_empty() {
        Ok(Version::new(major, minor, patch))
    } else {
        parse_version(&format!("{}.{}.{}-{}", major, minor, patch, pre))
    }
}

/// Raw column values of one `cards` row
struct CardRow {
    uid: String,
    kind: String,
    team: String,
    name: String,
    version: String,
    storage_path: String,
    artifact_kind: String,
    tags: String,
    metadata: String,
    status: String,
    created_at: String,
}

impl CardRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CardRow {
            uid: row.get(0)?,
            kind: row.get(1)?,
            team: row.get(2)?,
            name: row.get(3)?,
            version: row.get(4)?,
            storage_path: row.get(5)?,
            artifact_kind: row.get(6)?,
            tags: row.get(7)?,
            metadata: row.get(8)?,
            status: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_card(self) -> Result<Card> {
        let kind: CardKind = self
            .kind
            .parse()
            .map_err(|_| RegistryError::Conflict(format!("unknown card kind '{}'", self.kind)))?;
        let artifact_kind: ArtifactKind = self.artifact_kind.parse()?;
        let tags: Tags = serde_json::from_str(&self.tags)?;
        let metadata = CardMetadata::from_json(&self.metadata)?;

        if metadata.kind() != kind {
            return Err(RegistryError::Conflict(format!(
                "card {} is a {} card but carries {} metadata",
                self.uid,
                kind,
                metadata.kind()
            )));
        }

        Ok(Card {
            kind,
            team: self.team,
            name: self.name,
            version: parse_version(&self.version)?,
            tags,
            created_at: parse_timestamp(&self.created_at)?,
            storage_path: self.storage_path,
            artifact_kind,
            status: self.status.parse()?,
            metadata,
            uid: self.uid,
        })
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Ledger for SqliteTracking {
    fn entry(&self, team: &str, name: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT version_major, version_minor, version_patch, prerelease, revision_token
                 FROM version_ledger WHERE team = ?1 AND name = ?2",
                params![team, name],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, u64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u64>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((major, minor, patch, pre, revision)) => Ok(Some(LedgerEntry {
                version: version_from_parts(major, minor, patch, &pre)?,
                revision,
            })),
            None => Ok(None),
        }
    }

    fn compare_and_swap(
        &self,
        team: &str,
        name: &str,
        expected: Option<u64>,
        next: &Version,
    ) -> Result<Option<LedgerEntry>> {
        let conn = self.conn.lock();
        let now = timestamp(&Utc::now());
        let pre = next.pre.as_str();

        let (changed, revision) = match expected {
            None => {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO version_ledger
                     (team, name, version_major, version_minor, version_patch, prerelease,
                      revision_token, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                    params![team, name, next.major, next.minor, next.patch, pre, now],
                )?;
                (changed, 1)
            }
            Some(current) => {
                let revision = current + 1;
                let changed = conn.execute(
                    "UPDATE version_ledger
                     SET version_major = ?1, version_minor = ?2, version_patch = ?3,
                         prerelease = ?4, revision_token = ?5, updated_at = ?6
                     WHERE team = ?7 AND name = ?8 AND revision_token = ?9",
                    params![
                        next.major, next.minor, next.patch, pre, revision, now, team, name, current
                    ],
                )?;
                (changed, revision)
            }
        };

        if changed == 1 {
            Ok(Some(LedgerEntry {
                version: next.clone(),
                revision,
            }))
        } else {
            Ok(None)
        }
    }

    fn record_abandoned(&self, abandoned: &AbandonedVersion) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO abandoned_versions (team, name, version, reason, abandoned_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                abandoned.team,
                abandoned.name,
                abandoned.version.to_string(),
                abandoned.reason,
                timestamp(&abandoned.abandoned_at)
            ],
        )?;
        Ok(())
    }

    fn abandoned(&self, team: &str, name: &str) -> Result<Vec<AbandonedVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT version, reason, abandoned_at FROM abandoned_versions
             WHERE team = ?1 AND name = ?2 ORDER BY abandoned_at, version",
        )?;
        let rows = stmt
            .query_map(params![team, name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(version, reason, at)| {
                Ok(AbandonedVersion {
                    team: team.to_string(),
                    name: name.to_string(),
                    version: parse_version(&version)?,
                    reason,
                    abandoned_at: parse_timestamp(&at)?,
                })
            })
            .collect()
    }
}

impl CardStore for SqliteTracking {
    fn insert(&self, card: &Card) -> Result<()> {
        let tags = serde_json::to_string(&card.tags)?;
        let metadata = card.metadata.to_json()?;
        let conn = self.conn.lock();

        let inserted = conn.execute(
            "INSERT INTO cards
             (uid, kind, team, name, version, version_major, version_minor, version_patch,
              prerelease, storage_path, artifact_kind, tags, metadata, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                card.uid,
                card.kind.as_str(),
                card.team,
                card.name,
                card.version.to_string(),
                card.version.major,
                card.version.minor,
                card.version.patch,
                card.version.pre.as_str(),
                card.storage_path,
                card.artifact_kind.as_str(),
                tags,
                metadata,
                card.status.as_str(),
                timestamp(&card.created_at),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RegistryError::Conflict(format!(
                "card {} ({}/{} v{} at {}) collides with a committed card: {}",
                card.uid, card.team, card.name, card.version, card.storage_path, err
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, uid: &str) -> Result<Option<Card>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM cards WHERE uid = ?1", CARD_COLUMNS),
                params![uid],
                CardRow::from_row,
            )
            .optional()?;
        drop(conn);

        row.map(CardRow::into_card).transpose()
    }

    fn query(&self, query: &CardQuery) -> Result<Vec<Card>> {
        // narrow by indexed columns; the rest is filtered in Rust
        let mut sql = format!("SELECT {} FROM cards WHERE 1 = 1", CARD_COLUMNS);
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();

        if let Some(uid) = &query.uid {
            args.push(uid);
            sql.push_str(&format!(" AND uid = ?{}", args.len()));
        }
        if let Some(team) = &query.team {
            args.push(team);
            sql.push_str(&format!(" AND team = ?{}", args.len()));
        }
        if let Some(name) = &query.name {
            args.push(name);
            sql.push_str(&format!(" AND name = ?{}", args.len()));
        }
        let kind = query.kind.map(|k| k.as_str());
        if let Some(kind) = &kind {
            args.push(kind);
            sql.push_str(&format!(" AND kind = ?{}", args.len()));
        }
        if !query.include_inactive {
            sql.push_str(" AND status != 'deleted'");
        }

        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(args.as_slice(), CardRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        // one undecodable row must not hide the rest of the listing
        let cards = rows.into_iter().filter_map(|row| {
            let uid = row.uid.clone();
            match row.into_card() {
                Ok(card) => Some(card),
                Err(err) => {
                    warn!("Skipping unreadable card row {}: {}", uid, err);
                    None
                }
            }
        });
        Ok(query.finish(cards))
    }

    fn set_status(&self, uid: &str, expected: CardStatus, next: CardStatus) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE cards SET status = ?1 WHERE uid = ?2 AND status = ?3",
            params![next.as_str(), uid, expected.as_str()],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM cards WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            None => Err(RegistryError::NotFound(format!("card {}", uid))),
            Some(current) => Err(RegistryError::Conflict(format!(
                "card {} is {}, not {}",
                uid,
                current,
                expected.as_str()
            ))),
        }
    }

    fn teams(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT team FROM cards WHERE status != 'deleted' ORDER BY team",
        )?;
        let teams = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(teams)
    }

    fn names(&self, team: Option<&str>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT name FROM cards
             WHERE status != 'deleted' AND (?1 IS NULL OR team = ?1)
             ORDER BY name",
        )?;
        let names = stmt
            .query_map(params![team], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}
