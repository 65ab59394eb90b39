//! The decider owns every live run, advances them against incoming
//! events, spawns new ones, and merges reconciliation deltas from peer
//! instances.
//!
//! Locking: the decider holds one coarse table lock; each run sits
//! behind its own mutex. Lock order is always decider then run, never
//! reversed. `update()` is written for a single external driver but is
//! safe under concurrent calls regardless.

use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{CepError, Result};
use crate::event::{Event, History};
use crate::logging::{self, obj, v_num, v_str, Domain, Level};
use crate::pattern::Pattern;
use crate::queue::BoundedQueue;
use crate::run::{next_run_id, DeltaBatch, Run, RunRecord};
use crate::tasks::Task;

/// Named higher-level occurrence: one or more patterns that detect it.
#[derive(Debug, Clone)]
pub struct Phenomenon {
    pub name: String,
    pub patterns: Vec<Arc<Pattern>>,
}

impl Phenomenon {
    pub fn new(name: &str, patterns: Vec<Pattern>) -> Self {
        Self {
            name: name.to_string(),
            patterns: patterns.into_iter().map(Arc::new).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeciderConfig {
    /// Ingest queue bound; a full queue raises to the pusher.
    pub max_queue: usize,
    /// Most-recent-N completed/halted caches for reconciliation
    /// idempotence and `snapshot()`. 0 disables caching entirely.
    pub max_cache: usize,
    /// Mute integrity errors for the benign races reconciliation can
    /// legitimately create (e.g. a completed record for a run this
    /// instance already resolved and evicted).
    pub quiet: bool,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            max_queue: 1024,
            max_cache: 0,
            quiet: false,
        }
    }
}

impl DeciderConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_queue: env_parse("CEP_MAX_QUEUE", d.max_queue),
            max_cache: env_parse("CEP_MAX_CACHE", d.max_cache),
            quiet: std::env::var("CEP_QUIET").map(|v| v == "1" || v == "true").unwrap_or(d.quiet),
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Downstream consumer of decide-cycle results. `local=false` marks a
/// batch relayed from a peer instance; consumers treat it identically
/// except for provenance.
pub trait DeciderSubscriber: Send + Sync {
    fn on_decider_update(
        &self,
        completed: &[RunRecord],
        halted: &[RunRecord],
        updated: &[RunRecord],
        local: bool,
    );
}

type RunKey = (String, String); // (phenomenon, pattern)
type RunSlot = Arc<Mutex<Run>>;

struct DeciderInner {
    runs: HashMap<RunKey, HashMap<String, RunSlot>>,
    completed_cache: VecDeque<RunRecord>,
    halted_cache: VecDeque<RunRecord>,
}

pub struct Decider {
    cfg: DeciderConfig,
    phenomena: Vec<Phenomenon>,
    ingest: BoundedQueue<Event>,
    inner: Mutex<DeciderInner>,
    subscribers: Mutex<Vec<Arc<dyn DeciderSubscriber>>>,
}

impl Decider {
    pub fn new(phenomena: Vec<Phenomenon>, cfg: DeciderConfig) -> Result<Self> {
        let mut names = HashSet::new();
        for ph in &phenomena {
            if !names.insert(ph.name.clone()) {
                return Err(CepError::Configuration(format!(
                    "duplicate phenomenon name {}",
                    ph.name
                )));
            }
            if ph.patterns.is_empty() {
                return Err(CepError::Configuration(format!(
                    "phenomenon {} has no patterns",
                    ph.name
                )));
            }
            let mut pattern_names = HashSet::new();
            for pat in &ph.patterns {
                if !pattern_names.insert(pat.name.clone()) {
                    return Err(CepError::Configuration(format!(
                        "duplicate pattern name {} in phenomenon {}",
                        pat.name, ph.name
                    )));
                }
            }
        }
        let ingest = BoundedQueue::new("ingest", cfg.max_queue);
        Ok(Self {
            cfg,
            phenomena,
            ingest,
            inner: Mutex::new(DeciderInner {
                runs: HashMap::new(),
                completed_cache: VecDeque::new(),
                halted_cache: VecDeque::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self, subscriber: Arc<dyn DeciderSubscriber>) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    /// Push one event onto the bounded ingest queue. A full queue is
    /// the caller's backpressure signal, never retried here.
    pub fn on_receiver_update(&self, event: Event) -> Result<()> {
        self.ingest.push(event)
    }

    /// One decide cycle: pop one event, advance every live run, spawn
    /// runs for matching pattern heads, notify subscribers. Returns
    /// true iff anything changed (the gate the outer scheduler uses to
    /// keep looping).
    pub fn update(&self) -> bool {
        let Some(event) = self.ingest.pop() else {
            return false;
        };
        let (completed, halted, updated) = {
            let mut inner = self.lock_inner();
            self.decide_locked(&mut inner, &event)
        };
        if completed.is_empty() && halted.is_empty() && updated.is_empty() {
            return false;
        }
        logging::log(
            Level::Debug,
            Domain::Decide,
            "cycle",
            obj(&[
                ("event_id", v_str(event.event_id())),
                ("completed", v_num(completed.len() as f64)),
                ("halted", v_num(halted.len() as f64)),
                ("updated", v_num(updated.len() as f64)),
            ]),
        );
        self.notify(&completed, &halted, &updated, true);
        true
    }

    /// Active runs of one (phenomenon, pattern) slot, serialized.
    pub fn runs_from(&self, phenomenon: &str, pattern: &str) -> Vec<RunRecord> {
        let inner = self.lock_inner();
        let key = (phenomenon.to_string(), pattern.to_string());
        inner
            .runs
            .get(&key)
            .map(|runs| {
                runs.values()
                    .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).record())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn run_count(&self) -> usize {
        let inner = self.lock_inner();
        inner.runs.values().map(HashMap::len).sum()
    }

    /// Full state for a peer resync: cached completed and halted runs
    /// plus every live run.
    pub fn snapshot(&self) -> DeltaBatch {
        let inner = self.lock_inner();
        let updated = inner
            .runs
            .values()
            .flat_map(|runs| runs.values())
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).record())
            .collect();
        DeltaBatch::new(
            inner.completed_cache.iter().cloned().collect(),
            inner.halted_cache.iter().cloned().collect(),
            updated,
        )
    }

    /// Merge a peer's delta into local state, then relay the surviving
    /// (possibly identity-rewritten) batch to local subscribers tagged
    /// `local=false`. Idempotent under repeat delivery when caching is
    /// enabled.
    pub fn on_distributed_update(&self, batch: DeltaBatch) -> Result<DeltaBatch> {
        let mut relay = DeltaBatch::default();
        {
            let mut inner = self.lock_inner();
            // Precedence across classes: completed > halted > updated.
            let mut seen: HashSet<(String, String, String)> = HashSet::new();

            for rec in batch.completed {
                if !self.known(&rec) || !seen.insert(rec.key()) {
                    continue;
                }
                if self.resolved_locally(&inner, &rec) {
                    continue;
                }
                let mut out = rec.clone();
                self.absorb_resolved(&mut inner, &mut out);
                if out.run_id != rec.run_id {
                    // The identity was rewritten; remember the remote
                    // identity too, or redelivery would miss the cache.
                    Self::cache(&mut inner.completed_cache, rec, self.cfg.max_cache);
                }
                Self::cache(&mut inner.completed_cache, out.clone(), self.cfg.max_cache);
                relay.completed.push(out);
            }

            for rec in batch.halted {
                if !self.known(&rec) || !seen.insert(rec.key()) {
                    continue;
                }
                if self.resolved_locally(&inner, &rec) {
                    continue;
                }
                let mut out = rec.clone();
                self.absorb_resolved(&mut inner, &mut out);
                if out.run_id != rec.run_id {
                    Self::cache(&mut inner.halted_cache, rec, self.cfg.max_cache);
                }
                Self::cache(&mut inner.halted_cache, out.clone(), self.cfg.max_cache);
                relay.halted.push(out);
            }

            for rec in batch.updated {
                let Some(pattern) = self.find_pattern(&rec.phenomenon_name, &rec.pattern_name)
                else {
                    continue; // unknown phenomenon/pattern: drop
                };
                if !seen.insert(rec.key()) || self.resolved_locally(&inner, &rec) {
                    continue;
                }
                // Only relay what actually changed local state, so that
                // redelivering the same batch notifies nobody twice.
                if self.merge_updated(&mut inner, &pattern, &rec)? {
                    relay.updated.push(rec);
                }
            }
        }

        if !relay.is_empty() {
            self.notify(&relay.completed, &relay.halted, &relay.updated, false);
        }
        Ok(relay)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, DeciderInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decide_locked(
        &self,
        inner: &mut DeciderInner,
        event: &Event,
    ) -> (Vec<RunRecord>, Vec<RunRecord>, Vec<RunRecord>) {
        let mut completed = Vec::new();
        let mut halted = Vec::new();
        let mut updated = Vec::new();
        let mut remove: Vec<(RunKey, String)> = Vec::new();

        // Pass 1: every live run sees the event.
        for (key, runs) in &inner.runs {
            for (run_id, slot) in runs {
                let mut run = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if !run.process(event) {
                    continue;
                }
                let rec = run.record();
                if run.is_halted() {
                    if run.is_complete() {
                        completed.push(rec);
                    } else {
                        halted.push(rec);
                    }
                    remove.push((key.clone(), run_id.clone()));
                } else {
                    updated.push(rec);
                }
            }
        }
        // Halted runs leave the table after the full scan, never while
        // iterating.
        for (key, run_id) in remove {
            Self::remove_run(inner, &key, &run_id);
        }

        // Pass 2: pattern heads, evaluated with empty history.
        let empty = History::default();
        for ph in &self.phenomena {
            for pat in &ph.patterns {
                if !pat.blocks[0].matches(event, &empty) {
                    continue;
                }
                let run = Run::new(next_run_id(), &ph.name, Arc::clone(pat), event.clone());
                if run.is_halted() {
                    // One-block pattern: emit directly, never stored.
                    completed.push(run.record());
                    continue;
                }
                let key = (ph.name.clone(), pat.name.clone());
                if pat.singleton && inner.runs.get(&key).is_some_and(|m| !m.is_empty()) {
                    continue; // singleton slot occupied: discard silently
                }
                let rec = run.record();
                if let Err(err) = Self::insert_run(inner, key, run) {
                    // Fresh random id collided; drop the spawn.
                    logging::log(
                        Level::Error,
                        Domain::Decide,
                        "integrity",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                    continue;
                }
                updated.push(rec);
            }
        }

        if self.cfg.max_cache > 0 {
            for rec in &completed {
                Self::cache(&mut inner.completed_cache, rec.clone(), self.cfg.max_cache);
            }
            for rec in &halted {
                Self::cache(&mut inner.halted_cache, rec.clone(), self.cfg.max_cache);
            }
        }

        (completed, halted, updated)
    }

    /// Returns whether the record changed local state: a cursor advance
    /// on an existing run or a newly seeded mirror.
    fn merge_updated(
        &self,
        inner: &mut DeciderInner,
        pattern: &Arc<Pattern>,
        rec: &RunRecord,
    ) -> Result<bool> {
        let key = (rec.phenomenon_name.clone(), rec.pattern_name.clone());
        let local = inner.runs.get(&key).and_then(|runs| {
            runs.get(&rec.run_id).cloned().or_else(|| {
                if pattern.singleton {
                    // Any active run occupies the singleton slot.
                    runs.values().next().cloned()
                } else {
                    None
                }
            })
        });

        match local {
            Some(slot) => {
                let mut run = slot.lock().unwrap_or_else(PoisonError::into_inner);
                // Never regress a local run that is further along.
                if rec.block_index <= run.block_index() {
                    return Ok(false);
                }
                run.set_block(rec.block_index, rec.history.clone());
                if run.is_halted() {
                    let run_id = run.run_id().to_string();
                    drop(run);
                    Self::remove_run(inner, &key, &run_id);
                }
                Ok(true)
            }
            None => {
                let run = Run::from_record(Arc::clone(pattern), rec);
                if run.is_halted() {
                    // An "updated" record whose cursor is already past
                    // the end has nothing active to store.
                    return Ok(false);
                }
                if let Err(err) = Self::insert_run(inner, key, run) {
                    if self.cfg.quiet {
                        logging::log(
                            Level::Debug,
                            Domain::Sync,
                            "merge_race",
                            obj(&[("error", v_str(&err.to_string()))]),
                        );
                        return Ok(false);
                    }
                    return Err(err);
                }
                Ok(true)
            }
        }
    }

    /// Absorb a remote completed/halted record: evict the local
    /// counterpart. For singleton slots the local identity wins and the
    /// outgoing record is rewritten to it, so subscribers never see two
    /// identities for one slot.
    fn absorb_resolved(&self, inner: &mut DeciderInner, rec: &mut RunRecord) {
        let key = (rec.phenomenon_name.clone(), rec.pattern_name.clone());
        let singleton = self
            .find_pattern(&rec.phenomenon_name, &rec.pattern_name)
            .map(|p| p.singleton)
            .unwrap_or(false);
        if singleton {
            let local_id = inner
                .runs
                .get(&key)
                .and_then(|runs| runs.keys().next().cloned());
            if let Some(local_id) = local_id {
                Self::remove_run(inner, &key, &local_id);
                rec.run_id = local_id;
            }
        } else if !Self::remove_run(inner, &key, &rec.run_id) {
            // Absence is a benign reconciliation race.
            let level = if self.cfg.quiet { Level::Debug } else { Level::Warn };
            logging::log(
                level,
                Domain::Sync,
                "absent_on_remove",
                obj(&[("run_id", v_str(&rec.run_id)), ("pattern", v_str(&rec.pattern_name))]),
            );
        }
    }

    fn insert_run(inner: &mut DeciderInner, key: RunKey, run: Run) -> Result<()> {
        let runs = inner.runs.entry(key).or_default();
        if runs.contains_key(run.run_id()) {
            return Err(CepError::Integrity(format!(
                "duplicate run_id {}",
                run.run_id()
            )));
        }
        runs.insert(run.run_id().to_string(), Arc::new(Mutex::new(run)));
        Ok(())
    }

    fn remove_run(inner: &mut DeciderInner, key: &RunKey, run_id: &str) -> bool {
        let Some(runs) = inner.runs.get_mut(key) else {
            return false;
        };
        let removed = runs.remove(run_id).is_some();
        if runs.is_empty() {
            inner.runs.remove(key);
        }
        removed
    }

    fn cache(cache: &mut VecDeque<RunRecord>, rec: RunRecord, max: usize) {
        if max == 0 {
            return;
        }
        cache.push_back(rec);
        while cache.len() > max {
            cache.pop_front();
        }
    }

    fn resolved_locally(&self, inner: &DeciderInner, rec: &RunRecord) -> bool {
        let key = rec.key();
        inner.completed_cache.iter().any(|r| r.key() == key)
            || inner.halted_cache.iter().any(|r| r.key() == key)
    }

    fn known(&self, rec: &RunRecord) -> bool {
        self.find_pattern(&rec.phenomenon_name, &rec.pattern_name)
            .is_some()
    }

    fn find_pattern(&self, phenomenon: &str, pattern: &str) -> Option<Arc<Pattern>> {
        self.phenomena
            .iter()
            .find(|ph| ph.name == phenomenon)?
            .patterns
            .iter()
            .find(|p| p.name == pattern)
            .cloned()
    }

    fn notify(
        &self,
        completed: &[RunRecord],
        halted: &[RunRecord],
        updated: &[RunRecord],
        local: bool,
    ) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for s in subscribers {
            s.on_decider_update(completed, halted, updated, local);
        }
    }
}

impl Task for Decider {
    fn update(&self) -> bool {
        Decider::update(self)
    }

    fn size(&self) -> usize {
        self.ingest.len()
    }
}

impl std::fmt::Debug for Decider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decider")
            .field("phenomena", &self.phenomena.len())
            .field("queued", &self.ingest.len())
            .field("runs", &json!(self.run_count()))
            .finish()
    }
}
