//! In-process tracking store

use super::{AbandonedVersion, CardQuery, CardStore, Ledger, LedgerEntry};
use crate::card::{Card, CardStatus};
use crate::error::{RegistryError, Result};
use parking_lot::RwLock;
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

type FamilyKey = (String, String);

#[derive(Default)]
struct State {
    ledger: HashMap<FamilyKey, LedgerEntry>,
    abandoned: HashMap<FamilyKey, Vec<AbandonedVersion>>,
    cards: BTreeMap<String, Card>,
    paths: HashSet<String>,
    versions: HashSet<(String, String, Version)>,
}

/// Ledger and cards held in a map; lost with the process
#[derive(Default)]
pub struct MemoryTracking {
    state: RwLock<State>,
}

impl MemoryTracking {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(team: &str, name: &str) -> FamilyKey {
    (team.to_string(), name.to_string())
}

impl Ledger for MemoryTracking {
    fn entry(&self, team: &str, name: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.state.read().ledger.get(&key(team, name)).cloned())
    }

    fn compare_and_swap(
        &self,
        team: &str,
        name: &str,
        expected: Option<u64>,
        next: &Version,
    ) -> Result<Option<LedgerEntry>> {
        let mut state = self.state.write();
        let family = key(team, name);
        let current = state.ledger.get(&family).map(|entry| entry.revision);

        if current != expected {
            return Ok(None);
        }

        let entry = LedgerEntry {
            version: next.clone(),
            revision: expected.map_or(1, |rev| rev + 1),
        };
        state.ledger.insert(family, entry.clone());
        Ok(Some(entry))
    }

    fn record_abandoned(&self, abandoned: &AbandonedVersion) -> Result<()> {
        let mut state = self.state.write();
        let list = state
            .abandoned
            .entry(key(&abandoned.team, &abandoned.name))
            .or_default();
        list.retain(|a| a.version != abandoned.version);
        list.push(abandoned.clone());
        Ok(())
    }

    fn abandoned(&self, team: &str, name: &str) -> Result<Vec<AbandonedVersion>> {
        Ok(self
            .state
            .read()
            .abandoned
            .get(&key(team, name))
            .cloned()
            .unwrap_or_default())
    }
}

impl CardStore for MemoryTracking {
    fn insert(&self, card: &Card) -> Result<()> {
        let mut state = self.state.write();
        let version_key = (card.team.clone(), card.name.clone(), card.version.clone());

        if state.cards.contains_key(&card.uid)
            || state.paths.contains(&card.storage_path)
            || state.versions.contains(&version_key)
        {
            return Err(RegistryError::Conflict(format!(
                "card {} ({}/{} v{} at {}) collides with a committed card",
                card.uid, card.team, card.name, card.version, card.storage_path
            )));
        }

        state.paths.insert(card.storage_path.clone());
        state.versions.insert(version_key);
        state.cards.insert(card.uid.clone(), card.clone());
        Ok(())
    }

    fn get(&self, uid: &str) -> Result<Option<Card>> {
        Ok(self.state.read().cards.get(uid).cloned())
    }

    fn query(&self, query: &CardQuery) -> Result<Vec<Card>> {
        let state = self.state.read();
        let candidates: Vec<Card> = match &query.uid {
            Some(uid) => state.cards.get(uid).cloned().into_iter().collect(),
            None => state.cards.values().cloned().collect(),
        };
        Ok(query.finish(candidates))
    }

    fn set_status(&self, uid: &str, expected: CardStatus, next: CardStatus) -> Result<()> {
        let mut state = self.state.write();
        let card = state
            .cards
            .get_mut(uid)
            .ok_or_else(|| RegistryError::NotFound(format!("card {}", uid)))?;
        if card.status != expected {
            return Err(RegistryError::Conflict(format!(
                "card {} is {}, not {}",
                uid,
                card.status.as_str(),
                expected.as_str()
            )));
        }
        card.status = next;
        Ok(())
    }

    fn teams(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        let teams: BTreeSet<&String> = state
            .cards
            .values()
            .filter(|c| c.status.is_visible())
            .map(|c| &c.team)
            .collect();
        Ok(teams.into_iter().cloned().collect())
    }

    fn names(&self, team: Option<&str>) -> Result<Vec<String>> {
        let state = self.state.read();
        let names: BTreeSet<&String> = state
            .cards
            .values()
            .filter(|c| c.status.is_visible())
            .filter(|c| team.map_or(true, |t| c.team == t))
            .map(|c| &c.name)
            .collect();
        Ok(names.into_iter().cloned().collect())
    }
}
