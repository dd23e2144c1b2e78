//! Concurrent registration tests
//!
//! Many writers registering into the same family must each get a distinct,
//! strictly ordered version and a distinct storage path.

use cardvault_rs::{
    BumpKind, CardQuery, CardRegistry, NewCard, PipelineCardMetadata, RegistryBuilder,
    RegistryConfig, RetrySettings, RunCardMetadata,
};
use semver::Version;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn race_settings() -> RetrySettings {
    RetrySettings {
        max_attempts: 1_000,
        base_delay_ms: 1,
        max_delay_ms: 20,
        jitter: true,
    }
}

fn in_memory() -> CardRegistry {
    init_tracing();
    RegistryBuilder::from_config(RegistryConfig::in_memory())
        .reservation_retry(race_settings())
        .build()
        .unwrap()
}

fn pipeline(team: &str, name: &str) -> NewCard {
    NewCard::pipeline(team, name, PipelineCardMetadata::default())
}

/// Spawn `writers` threads that start together and each register once
fn register_concurrently(
    registry: &Arc<CardRegistry>,
    writers: usize,
    bump_for: impl Fn(usize) -> BumpKind,
) -> Vec<cardvault_rs::RegisteredCard> {
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let registry = Arc::clone(registry);
            let barrier = Arc::clone(&barrier);
            let bump = bump_for(i);
            thread::spawn(move || {
                barrier.wait();
                registry.register(pipeline("team", "nightly"), bump).unwrap()
            })
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_50_concurrent_patch_registrations() {
    let registry = Arc::new(in_memory());
    let cards = register_concurrently(&registry, 50, |_| BumpKind::Patch);

    let versions: HashSet<Version> = cards.iter().map(|c| c.version.clone()).collect();
    let expected: HashSet<Version> = (1..=50).map(|p| Version::new(0, 0, p)).collect();
    assert_eq!(versions, expected);

    let uids: HashSet<&str> = cards.iter().map(|c| c.uid.as_str()).collect();
    let paths: HashSet<&str> = cards.iter().map(|c| c.storage_path.as_str()).collect();
    assert_eq!(uids.len(), 50);
    assert_eq!(paths.len(), 50);

    let listed = registry
        .list(&CardQuery::new().team("team").name("nightly"))
        .unwrap();
    assert_eq!(listed.len(), 50);
    assert_eq!(listed[0].version, Version::new(0, 0, 50));
    assert!(listed.windows(2).all(|w| w[0].version > w[1].version));
}

#[test]
fn test_concurrent_registrations_over_sqlite_and_disk() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let registry = Arc::new(
        RegistryBuilder::from_config(RegistryConfig::local(temp_dir.path()))
            .reservation_retry(race_settings())
            .build()
            .unwrap(),
    );

    let cards = register_concurrently(&registry, 20, |_| BumpKind::Patch);
    let versions: HashSet<Version> = cards.iter().map(|c| c.version.clone()).collect();
    assert_eq!(versions.len(), 20);
    assert_eq!(
        versions.iter().max().cloned(),
        Some(Version::new(0, 0, 20))
    );

    for card in &cards {
        assert!(temp_dir
            .path()
            .join("artifacts")
            .join(&card.storage_path)
            .is_file());
        assert!(registry.load_artifact(&card.uid).is_ok());
    }
}

#[test]
fn test_racing_bump_kinds_follow_swap_order() {
    let registry = Arc::new(in_memory());
    registry
        .register(pipeline("team", "nightly"), BumpKind::Patch)
        .unwrap();

    let cards = register_concurrently(&registry, 12, |i| match i % 3 {
        0 => BumpKind::Major,
        1 => BumpKind::Minor,
        _ => BumpKind::Patch,
    });

    // every committed version is one bump applied to the version before it
    let mut history = registry
        .list(&CardQuery::new().team("team").name("nightly"))
        .unwrap();
    history.reverse();
    assert_eq!(history.len(), 13);

    let mut majors = 0;
    for pair in history.windows(2) {
        let (prev, next) = (&pair[0].version, &pair[1].version);
        let bump = [BumpKind::Major, BumpKind::Minor, BumpKind::Patch]
            .into_iter()
            .find(|bump| &bump.apply(prev).unwrap() == next)
            .unwrap_or_else(|| panic!("{} -> {} is not a single bump", prev, next));
        if bump == BumpKind::Major {
            majors += 1;
        }
    }
    assert_eq!(majors, 4);

    let issued: HashSet<Version> = cards.iter().map(|c| c.version.clone()).collect();
    assert_eq!(issued.len(), 12);
    assert_eq!(history.last().unwrap().version.major, 4);
}

#[test]
fn test_distinct_families_do_not_contend() {
    let registry = Arc::new(in_memory());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let name = format!("experiment-{}", i);
                (0..5)
                    .map(|_| {
                        registry
                            .register(
                                NewCard::run("research", &name, RunCardMetadata::default()),
                                BumpKind::Minor,
                            )
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        let cards = handle.join().unwrap();
        let versions: Vec<String> = cards.iter().map(|c| c.version.to_string()).collect();
        assert_eq!(versions, vec!["0.1.0", "0.2.0", "0.3.0", "0.4.0", "0.5.0"]);
    }
    assert_eq!(registry.card_names(Some("research")).unwrap().len(), 8);
}
