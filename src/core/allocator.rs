//! Version reservation for card families
//!
//! A reservation reads the family's ledger entry, applies the requested
//! bump and compare-and-swaps the result on the entry's revision token.
//! Losing the swap means another writer issued a version in between: the
//! allocator re-reads and bumps again on top of the new head, so racing
//! writers are ordered by the order their swaps land.
//!
//! Issued versions are never handed back. A reservation whose payload
//! could not be written is recorded as abandoned and leaves a gap.

use crate::error::{RegistryError, Result};
use crate::retry::RetryPolicy;
use crate::tracking::{AbandonedVersion, Ledger};
use crate::validation::Slug;
use crate::version::BumpKind;
use chrono::Utc;
use semver::Version;
use std::sync::Arc;
use tracing::{debug, info};

/// A version durably issued to one writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub team: Slug,
    pub name: Slug,
    pub version: Version,
    /// Head the bump was applied to
    pub previous: Version,
    /// Ledger revision after the swap
    pub revision: u64,
    /// Swap attempts it took
    pub attempts: u32,
}

impl Reservation {
    pub fn family(&self) -> String {
        format!("{}/{}", self.team, self.name)
    }
}

pub struct VersionAllocator {
    ledger: Arc<dyn Ledger>,
    contention: RetryPolicy,
    ledger_retry: RetryPolicy,
}

impl VersionAllocator {
    /// `contention` bounds swap attempts; `ledger_retry` covers transient
    /// ledger errors (a busy database) on each individual call
    pub fn new(ledger: Arc<dyn Ledger>, contention: RetryPolicy, ledger_retry: RetryPolicy) -> Self {
        VersionAllocator {
            ledger,
            contention,
            ledger_retry,
        }
    }

    /// Last issued version of a family, 0.0.0 if none
    pub fn current(&self, team: &Slug, name: &Slug) -> Result<Version> {
        let entry = self.ledger_retry.run("read ledger", |_| {
            self.ledger.entry(team.as_str(), name.as_str())
        })?;
        Ok(entry.map_or_else(|| Version::new(0, 0, 0), |e| e.version))
    }

    /// Issue the next version of `team/name` under `bump`
    ///
    /// # Errors
    ///
    /// - `Validation` if the bump cannot advance the family
    /// - `Contention` if every swap attempt lost a race
    pub fn reserve(&self, team: &Slug, name: &Slug, bump: &BumpKind) -> Result<Reservation> {
        let max_attempts = self.contention.max_attempts();

        for attempt in 1..=max_attempts {
            let entry = self.ledger_retry.run("read ledger", |_| {
                self.ledger.entry(team.as_str(), name.as_str())
            })?;

            let (head, expected) = match &entry {
                Some(entry) => (entry.version.clone(), Some(entry.revision)),
                None => (Version::new(0, 0, 0), None),
            };
            let candidate = bump.apply(&head)?;

            let swapped = self.ledger_retry.run("swap ledger", |_| {
                self.ledger
                    .compare_and_swap(team.as_str(), name.as_str(), expected, &candidate)
            })?;

            if let Some(entry) = swapped {
                info!(
                    "Reserved {}/{} v{} ({} bump from {}, attempt {})",
                    team, name, candidate, bump, head, attempt
                );
                return Ok(Reservation {
                    team: team.clone(),
                    name: name.clone(),
                    version: candidate,
                    previous: head,
                    revision: entry.revision,
                    attempts: attempt,
                });
            }

            debug!(
                "Lost version race on {}/{} at v{} (attempt {}/{})",
                team, name, candidate, attempt, max_attempts
            );
            if attempt < max_attempts {
                std::thread::sleep(self.contention.backoff(attempt));
            }
        }

        Err(RegistryError::Contention {
            family: format!("{}/{}", team, name),
            attempts: max_attempts,
        })
    }

    /// Record that a reservation will never be committed
    ///
    /// The version stays issued: the ledger is not rolled back.
    pub fn abandon(&self, reservation: &Reservation, reason: &str) -> Result<()> {
        let abandoned = AbandonedVersion {
            team: reservation.team.to_string(),
            name: reservation.name.to_string(),
            version: reservation.version.clone(),
            reason: reason.to_string(),
            abandoned_at: Utc::now(),
        };
        self.ledger_retry
            .run("record abandoned version", |_| self.ledger.record_abandoned(&abandoned))?;
        info!(
            "Abandoned {} v{}: {}",
            reservation.family(),
            reservation.version,
            reason
        );
        Ok(())
    }

    pub fn abandoned(&self, team: &Slug, name: &Slug) -> Result<Vec<AbandonedVersion>> {
        self.ledger.abandoned(team.as_str(), name.as_str())
    }
}
