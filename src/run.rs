//! One in-flight attempt to satisfy one pattern.
//!
//! The cursor `block_index` is 0-based and points at the next block to
//! match. A run is only ever created by matching block 0, so the cursor
//! starts at 1 and is monotone non-decreasing; a run is complete once
//! the cursor moves past the last block. `halted` is monotone: once a
//! run halts (complete or failed) it never accepts another event.
//!
//! Block dispatch walks forward through fall-through blocks (loop and
//! optional non-matches) with an explicit local index inside a single
//! `process` call, bounded by the pattern length.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event::{Event, History};
use crate::logging::ts_epoch_ms;
use crate::pattern::{eval_quiet, Block, Pattern};

pub fn next_run_id() -> String {
    format!("{}-{:08x}", ts_epoch_ms(), rand::thread_rng().gen::<u32>())
}

#[derive(Debug)]
pub struct Run {
    run_id: String,
    phenomenon: String,
    pattern: Arc<Pattern>,
    block_index: usize,
    history: History,
    halted: bool,
}

impl Run {
    /// Spawn a run from an event that matched the pattern's head block.
    pub fn new(run_id: String, phenomenon: &str, pattern: Arc<Pattern>, first_event: Event) -> Self {
        let mut history = History::default();
        history.append(&pattern.blocks[0].group, first_event);
        let mut run = Self {
            run_id,
            phenomenon: phenomenon.to_string(),
            pattern,
            block_index: 1,
            history,
            halted: false,
        };
        // A one-block pattern is complete the moment it spawns.
        run.halted = run.is_complete();
        run
    }

    /// Rehydrate a run from a remote record during reconciliation,
    /// seeded at the remote cursor and history.
    pub fn from_record(pattern: Arc<Pattern>, record: &RunRecord) -> Self {
        let block_index = record.block_index.max(1);
        let mut run = Self {
            run_id: record.run_id.clone(),
            phenomenon: record.phenomenon_name.clone(),
            pattern,
            block_index,
            history: record.history.clone(),
            halted: false,
        };
        run.halted = run.is_complete();
        run
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phenomenon(&self) -> &str {
        &self.phenomenon
    }

    pub fn pattern(&self) -> &Arc<Pattern> {
        &self.pattern
    }

    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_complete(&self) -> bool {
        self.block_index > self.pattern.last_index()
    }

    /// Reconciliation identity rewrite: for singleton slots the local
    /// run_id always wins over a remote one.
    pub fn rename(&mut self, run_id: &str) {
        self.run_id = run_id.to_string();
    }

    /// Feed one event through the automaton. Returns whether any
    /// internal state changed.
    pub fn process(&mut self, event: &Event) -> bool {
        if self.halted {
            return false;
        }

        for p in &self.pattern.preconditions {
            if !eval_quiet(p.as_ref(), event, &self.history) {
                self.halted = true;
                return true;
            }
        }
        for p in &self.pattern.haltconditions {
            if eval_quiet(p.as_ref(), event, &self.history) {
                self.halted = true;
                return true;
            }
        }

        let mut idx = self.block_index;
        while idx <= self.pattern.last_index() {
            let block = &self.pattern.blocks[idx];
            let matched = block.matches(event, &self.history);

            if block.looping {
                if matched {
                    // Stay on the loop block; the cursor lands on it in
                    // case we fell through from an earlier optional.
                    self.history.append(&block.group, event.clone());
                    self.block_index = idx;
                    return true;
                }
                // Loop blocks are never terminal or strict: retry the
                // same event against the next block.
                idx += 1;
                continue;
            }

            if block.negated {
                if matched {
                    if block.strict {
                        self.halted = true; // contiguity violated
                        return true;
                    }
                    return false; // ignored, block stays pending
                }
                // The triggering event lands in the negated block's own
                // group; downstream consumers read it from there.
                self.advance(idx, event);
                return true;
            }

            if block.optional {
                if matched {
                    self.advance(idx, event);
                    return true;
                }
                idx += 1;
                continue;
            }

            // Plain mandatory block.
            if matched {
                self.advance(idx, event);
                return true;
            }
            if block.strict {
                self.halted = true;
                return true;
            }
            return false; // relaxed: await a later event
        }

        // Unreachable while pattern validation forces a plain last
        // block, which always returns from the loop above.
        false
    }

    /// Forward-only cursor jump used by distributed merges. Returns
    /// false (and changes nothing) unless `block_index` advances.
    pub fn set_block(&mut self, block_index: usize, history: History) -> bool {
        if block_index <= self.block_index {
            return false;
        }
        self.block_index = block_index;
        self.history = history;
        self.halted = self.halted || self.is_complete();
        true
    }

    /// Serialized snapshot for subscribers and the wire.
    pub fn record(&self) -> RunRecord {
        RunRecord {
            run_id: self.run_id.clone(),
            phenomenon_name: self.phenomenon.clone(),
            pattern_name: self.pattern.name.clone(),
            block_index: self.block_index,
            history: self.history.clone(),
        }
    }

    fn advance(&mut self, idx: usize, event: &Event) {
        let block: &Block = &self.pattern.blocks[idx];
        self.history.append(&block.group, event.clone());
        self.block_index = idx + 1;
        self.halted = self.halted || self.is_complete();
    }
}

/// Wire form of a run: everything a peer needs to mirror it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub phenomenon_name: String,
    pub pattern_name: String,
    pub block_index: usize,
    pub history: History,
}

impl RunRecord {
    pub fn key(&self) -> (String, String, String) {
        (
            self.phenomenon_name.clone(),
            self.pattern_name.clone(),
            self.run_id.clone(),
        )
    }
}

/// One reconciliation unit: the three state-change classes of a decide
/// cycle, in wire form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    #[serde(default)]
    pub completed: Vec<RunRecord>,
    #[serde(default)]
    pub halted: Vec<RunRecord>,
    #[serde(default)]
    pub updated: Vec<RunRecord>,
}

impl DeltaBatch {
    pub fn new(completed: Vec<RunRecord>, halted: Vec<RunRecord>, updated: Vec<RunRecord>) -> Self {
        Self {
            completed,
            halted,
            updated,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.halted.is_empty() && self.updated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.completed.len() + self.halted.len() + self.updated.len()
    }

    /// Fold another batch in (stash accumulation). Order within each
    /// class is preserved; duplicates are the receiver's problem, the
    /// merge path is idempotent.
    pub fn merge(&mut self, other: DeltaBatch) {
        self.completed.extend(other.completed);
        self.halted.extend(other.halted);
        self.updated.extend(other.updated);
    }

    /// Most recent record per run identity, newest wins. Used to keep a
    /// stash from growing unbounded across repeated send failures.
    pub fn dedupe(&mut self) {
        fn keep_last(records: &mut Vec<RunRecord>) {
            let mut last: BTreeMap<(String, String, String), usize> = BTreeMap::new();
            for (i, r) in records.iter().enumerate() {
                last.insert(r.key(), i);
            }
            let mut i = 0usize;
            records.retain(|r| {
                let keep = last.get(&r.key()) == Some(&i);
                i += 1;
                keep
            });
        }
        keep_last(&mut self.completed);
        keep_last(&mut self.halted);
        keep_last(&mut self.updated);
    }
}
