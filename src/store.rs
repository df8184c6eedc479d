use crate::source::SourceId;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Per-source counts, sorted by class name.
pub type Snapshot = BTreeMap<SourceId, Vec<(String, u32)>>;

#[derive(Default, Debug)]
struct SourceTally {
    seen: HashSet<String>,
    counts: BTreeMap<String, u32>,
}

impl SourceTally {
    fn clear(&mut self) {
        self.seen.clear();
        self.counts.clear();
    }
}

/// First-seen class counts for every source.
///
/// All state sits behind one mutex. Each operation takes it once, so a
/// `reset` is ordered entirely before or after any batch recorded by a
/// worker.
#[derive(Default, Debug)]
pub struct CountStore {
    tallies: Mutex<BTreeMap<SourceId, SourceTally>>,
}

impl CountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: &[SourceId]) -> Self {
        let store = Self::new();
        for &source in sources {
            store.register(source);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SourceId, SourceTally>> {
        self.tallies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `source` visible in snapshots before it has any detections.
    pub fn register(&self, source: SourceId) {
        self.lock().entry(source).or_default();
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.lock().keys().copied().collect()
    }

    /// Counts every class in `classes` not yet seen on `source` since the
    /// last reset. Returns the classes counted by this call.
    pub fn record_first_seen(&self, source: SourceId, classes: &BTreeSet<String>) -> Vec<String> {
        if classes.is_empty() {
            return Vec::new();
        }
        let mut tallies = self.lock();
        let tally = tallies.entry(source).or_default();
        let mut counted = Vec::new();
        for class in classes {
            if tally.seen.insert(class.clone()) {
                *tally.counts.entry(class.clone()).or_insert(0) += 1;
                counted.push(class.clone());
            }
        }
        drop(tallies);
        if !counted.is_empty() {
            debug!(source = %source, ?counted, "new classes counted");
        }
        counted
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock()
            .iter()
            .map(|(source, tally)| {
                let counts = tally
                    .counts
                    .iter()
                    .map(|(class, count)| (class.clone(), *count))
                    .collect();
                (*source, counts)
            })
            .collect()
    }

    /// Count of `class` on `source`, zero if never seen.
    pub fn count(&self, source: SourceId, class: &str) -> u32 {
        self.lock()
            .get(&source)
            .and_then(|tally| tally.counts.get(class).copied())
            .unwrap_or(0)
    }

    /// Forgets every seen class on every source. Sources stay registered.
    pub fn reset(&self) {
        let mut tallies = self.lock();
        for tally in tallies.values_mut() {
            tally.clear();
        }
        let sources = tallies.len();
        drop(tallies);
        info!(sources, "counts reset");
    }
}
