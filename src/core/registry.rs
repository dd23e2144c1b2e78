//! Card registration and lookup
//!
//! [`CardRegistry`] ties the pieces together. Registration runs:
//!
//! 1. validate the card (names, variant metadata, cross-card references)
//! 2. reserve the next version of its family in the ledger
//! 3. encode and write the payload at the resolved storage path
//! 4. commit the metadata row
//!
//! A failure after step 2 marks the reservation abandoned and removes
//! whatever payload made it to storage, so the version is burnt but no
//! lookup can ever reach a card without a readable payload.

use crate::allocator::{Reservation, VersionAllocator};
use crate::card::{Card, CardKind, CardStatus, NewCard, RegisteredCard};
use crate::codec::{self, Artifact, CompressionConfig};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::path;
use crate::retry::RetryPolicy;
use crate::storage::{open_storage, StorageClient};
use crate::tracking::{open_tracking, AbandonedVersion, CardQuery, CardStore, Tracking};
use crate::validation::{clean_string, Slug};
use crate::version::{BumpKind, VersionFilter};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct CardRegistry {
    storage: Arc<dyn StorageClient>,
    cards: Arc<dyn CardStore>,
    allocator: VersionAllocator,
    retry: RetryPolicy,
    compression: CompressionConfig,
}

impl CardRegistry {
    /// Open the tracking store and storage backend named by `config`
    pub fn open(config: &RegistryConfig) -> Result<Self> {
        config.check()?;
        let tracking = open_tracking(&config.tracking()?)?;
        let storage = open_storage(&config.storage()?)?;

        info!(
            "Opened card registry: tracking={} storage={}",
            config.tracking_uri,
            storage.root_uri()
        );

        Ok(Self::with_policies(
            tracking,
            storage,
            RetryPolicy::from_settings(&config.retry),
            RetryPolicy::from_settings(&config.reservation),
            config.compression,
        ))
    }

    /// Registry over already-opened backends with default policies
    pub fn new(tracking: Tracking, storage: Arc<dyn StorageClient>) -> Self {
        let defaults = RegistryConfig::default();
        Self::with_policies(
            tracking,
            storage,
            RetryPolicy::from_settings(&defaults.retry),
            RetryPolicy::from_settings(&defaults.reservation),
            defaults.compression,
        )
    }

    pub fn with_policies(
        tracking: Tracking,
        storage: Arc<dyn StorageClient>,
        retry: RetryPolicy,
        reservation: RetryPolicy,
        compression: CompressionConfig,
    ) -> Self {
        CardRegistry {
            storage,
            cards: tracking.cards,
            allocator: VersionAllocator::new(tracking.ledger, reservation, retry),
            retry,
            compression,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageClient> {
        &self.storage
    }

    /// Validate, version and persist a new card
    ///
    /// # Errors
    ///
    /// - `Validation` for malformed names, metadata, payloads or dangling
    ///   references; nothing is reserved
    /// - `Contention` if the family's ledger entry stayed contended for the
    ///   whole reservation budget; nothing is reserved
    /// - `Storage` if the payload could not be written; the reserved version
    ///   is recorded as abandoned
    /// - `Conflict` if the tracking store already holds the uid or path
    pub fn register(&self, card: NewCard, bump: BumpKind) -> Result<RegisteredCard> {
        let team = Slug::new(&card.team)?;
        let name = Slug::new(&card.name)?;
        card.validate()?;
        self.check_references(&card)?;

        let NewCard {
            tags,
            metadata,
            payload,
            ..
        } = card;
        let payload = match payload {
            Some(payload) => payload,
            None => metadata.default_payload()?,
        };

        let reservation = self.allocator.reserve(&team, &name, &bump)?;
        let storage_path = path::resolve(&team, &name, &reservation.version, payload.kind());

        if let Err(err) = codec::write_artifact(
            self.storage.as_ref(),
            &storage_path,
            &payload,
            &self.compression,
            &self.retry,
        ) {
            warn!(
                "Payload write for {} v{} at {} failed: {}",
                reservation.family(),
                reservation.version,
                storage_path,
                err
            );
            self.abandon(&reservation, &storage_path, &err);
            return Err(err.for_version(
                &reservation.family(),
                &reservation.version,
                &storage_path,
            ));
        }

        let committed = Card {
            uid: Uuid::new_v4().simple().to_string(),
            kind: metadata.kind(),
            team: team.into_string(),
            name: name.into_string(),
            version: reservation.version.clone(),
            tags,
            created_at: Utc::now(),
            storage_path,
            artifact_kind: payload.kind(),
            status: CardStatus::Active,
            metadata,
        };

        if let Err(err) = self
            .retry
            .run("commit card", |_| self.cards.insert(&committed))
        {
            warn!(
                "Commit of {} v{} failed: {}",
                reservation.family(),
                reservation.version,
                err
            );
            self.abandon(&reservation, &committed.storage_path, &err);
            return Err(err);
        }

        info!(
            "Registered {} card {}/{} v{} (uid={}, path={})",
            committed.kind,
            committed.team,
            committed.name,
            committed.version,
            committed.uid,
            committed.storage_path
        );

        Ok(committed.summary())
    }

    /// Burn a reservation and drop whatever payload reached storage
    fn abandon(&self, reservation: &Reservation, storage_path: &str, cause: &RegistryError) {
        if let Err(err) = self.allocator.abandon(reservation, &cause.to_string()) {
            warn!(
                "Could not record abandoned {} v{}: {}",
                reservation.family(),
                reservation.version,
                err
            );
        }
        if let Err(err) = self.storage.delete(storage_path) {
            warn!("Could not remove orphan payload {}: {}", storage_path, err);
        }
    }

    /// Every uid the card points at must name a committed card of the right kind
    fn check_references(&self, card: &NewCard) -> Result<()> {
        for (field, uid) in card.metadata.references() {
            let target = self.cards.get(uid)?.ok_or_else(|| {
                RegistryError::Validation(format!("{} refers to unknown card {}", field, uid))
            })?;

            if let Some(expected) = referenced_kind(field) {
                if target.kind != expected {
                    return Err(RegistryError::Validation(format!(
                        "{} refers to card {}, which is a {} card, not a {} card",
                        field, uid, target.kind, expected
                    )));
                }
            }
        }
        Ok(())
    }

    /// Exact lookup by uid; soft-deleted cards are still returned
    pub fn load(&self, uid: &str) -> Result<Card> {
        self.cards
            .get(uid)?
            .ok_or_else(|| RegistryError::NotFound(format!("card {}", uid)))
    }

    /// Decode the payload of a committed card
    pub fn load_artifact(&self, uid: &str) -> Result<Artifact> {
        let card = self.load(uid)?;
        debug!("Loading {} artifact of {} from {}", card.artifact_kind, uid, card.storage_path);
        codec::read_artifact(self.storage.as_ref(), &card.storage_path, &self.retry)
    }

    /// Cards matching `query`, newest version first within each family
    pub fn list(&self, query: &CardQuery) -> Result<Vec<Card>> {
        let mut query = query.clone();
        query.team = query.team.as_deref().map(clean_string);
        query.name = query.name.as_deref().map(clean_string);
        self.cards.query(&query)
    }

    /// Newest visible card of a family matching `version_req`
    ///
    /// `version_req` is an exact version (`1.2.3`) or a requirement such as
    /// `^1.2`, `~1.2`, `1.*` or `*`.
    pub fn resolve(&self, team: &str, name: &str, version_req: &str) -> Result<Card> {
        let team = Slug::new(team)?;
        let name = Slug::new(name)?;
        let filter = VersionFilter::parse(version_req)?;

        let mut query = CardQuery::new().team(team.as_str()).name(name.as_str()).limit(1);
        query.version = Some(filter);

        self.cards.query(&query)?.into_iter().next().ok_or_else(|| {
            RegistryError::NotFound(format!("{}/{} matching {}", team, name, version_req))
        })
    }

    /// Newest visible card of a family, pre-releases included
    pub fn latest(&self, team: &str, name: &str) -> Result<Card> {
        let team = Slug::new(team)?;
        let name = Slug::new(name)?;
        let query = CardQuery::new().team(team.as_str()).name(name.as_str()).limit(1);

        self.cards
            .query(&query)?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::NotFound(format!("{}/{}", team, name)))
    }

    pub fn promote(&self, uid: &str) -> Result<Card> {
        self.transition(uid, CardStatus::Promoted)
    }

    pub fn deprecate(&self, uid: &str) -> Result<Card> {
        self.transition(uid, CardStatus::Deprecated)
    }

    /// Hide a card from listings; its version and path stay taken
    pub fn soft_delete(&self, uid: &str) -> Result<Card> {
        self.transition(uid, CardStatus::Deleted)
    }

    /// Apply a status change against the status currently stored
    ///
    /// The write only lands if the card still has the status it was checked
    /// against; if another writer got there first the card is reloaded and
    /// the move is checked again.
    fn transition(&self, uid: &str, next: CardStatus) -> Result<Card> {
        let attempts = self.retry.max_attempts().max(1);
        for attempt in 1..=attempts {
            let mut card = self.load(uid)?;
            if !card.status.can_transition_to(next) {
                return Err(RegistryError::Validation(format!(
                    "card {} cannot go from {} to {}",
                    uid,
                    card.status.as_str(),
                    next.as_str()
                )));
            }

            let previous = card.status;
            match self.retry.run("update card status", |_| {
                self.cards.set_status(uid, previous, next)
            }) {
                Ok(()) => {
                    info!(
                        "Card {} ({}/{} v{}) is now {}",
                        uid,
                        card.team,
                        card.name,
                        card.version,
                        next.as_str()
                    );
                    card.status = next;
                    return Ok(card);
                }
                Err(RegistryError::Conflict(reason)) => {
                    debug!(
                        "Status of {} changed underneath (attempt {}/{}): {}",
                        uid, attempt, attempts, reason
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(RegistryError::Conflict(format!(
            "status of card {} kept changing while moving it to {}",
            uid,
            next.as_str()
        )))
    }

    /// Teams with at least one visible card
    pub fn unique_teams(&self) -> Result<Vec<String>> {
        self.cards.teams()
    }

    /// Card names, across all teams or within one
    pub fn card_names(&self, team: Option<&str>) -> Result<Vec<String>> {
        let team = team.map(clean_string);
        self.cards.names(team.as_deref())
    }

    /// Reservations of a family that were never committed
    pub fn abandoned_versions(&self, team: &str, name: &str) -> Result<Vec<AbandonedVersion>> {
        let team = Slug::new(team)?;
        let name = Slug::new(name)?;
        self.allocator.abandoned(&team, &name)
    }
}

/// Card kind a reference field must point at
fn referenced_kind(field: &str) -> Option<CardKind> {
    match field {
        "datacard_uid" | "datacard_uids" => Some(CardKind::Data),
        "modelcard_uids" => Some(CardKind::Model),
        "runcard_uid" | "runcard_uids" => Some(CardKind::Run),
        "pipelinecard_uid" => Some(CardKind::Pipeline),
        _ => None,
    }
}
