//! Declarative matching language: predicates, blocks, patterns.
//!
//! A `Pattern` is an ordered sequence of `Block`s. Each block is one
//! matching step whose predicates are OR'd together, with four flags:
//!
//! - `strict`: the block must match the very next event (contiguity);
//! - `looping`: the block may match any number of consecutive events
//!   and falls through to the next block on the first non-match;
//! - `negated`: a match is a failure (strict) or ignored (relaxed);
//! - `optional`: a non-match falls through to the next block.
//!
//! Flag combinations that have no coherent semantics are rejected at
//! construction time, as are patterns whose first or last block is
//! anything but a plain mandatory step.

use std::fmt;
use std::sync::Arc;

use crate::error::{CepError, Result};
use crate::event::{Event, History};
use crate::logging::{self, obj, v_str, Domain, Level};

/// Atomic boolean test. Implementations must be deterministic; an `Err`
/// is swallowed by the engine and treated as a non-match so a broken
/// predicate can never abort a decide cycle.
pub trait Predicate: Send + Sync {
    fn evaluate(&self, event: &Event, history: &History) -> anyhow::Result<bool>;
}

struct FnPredicate<F>(F);

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Event, &History) -> bool + Send + Sync,
{
    fn evaluate(&self, event: &Event, history: &History) -> anyhow::Result<bool> {
        Ok((self.0)(event, history))
    }
}

struct TryFnPredicate<F>(F);

impl<F> Predicate for TryFnPredicate<F>
where
    F: Fn(&Event, &History) -> anyhow::Result<bool> + Send + Sync,
{
    fn evaluate(&self, event: &Event, history: &History) -> anyhow::Result<bool> {
        (self.0)(event, history)
    }
}

/// Wrap an infallible closure as a predicate.
pub fn pred<F>(f: F) -> Arc<dyn Predicate>
where
    F: Fn(&Event, &History) -> bool + Send + Sync + 'static,
{
    Arc::new(FnPredicate(f))
}

/// Wrap a fallible closure as a predicate. Errors count as non-match.
pub fn try_pred<F>(f: F) -> Arc<dyn Predicate>
where
    F: Fn(&Event, &History) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(TryFnPredicate(f))
}

/// Evaluate a predicate, downgrading errors to non-match with a log.
pub(crate) fn eval_quiet(p: &dyn Predicate, event: &Event, history: &History) -> bool {
    match p.evaluate(event, history) {
        Ok(b) => b,
        Err(err) => {
            logging::log(
                Level::Warn,
                Domain::Run,
                "predicate_error",
                obj(&[
                    ("event_id", v_str(event.event_id())),
                    ("error", v_str(&err.to_string())),
                ]),
            );
            false
        }
    }
}

#[derive(Clone)]
pub struct Block {
    pub group: String,
    pub predicates: Vec<Arc<dyn Predicate>>,
    pub strict: bool,
    pub looping: bool,
    pub negated: bool,
    pub optional: bool,
}

impl Block {
    fn new(group: &str, predicates: Vec<Arc<dyn Predicate>>, strict: bool, negated: bool) -> Self {
        Self {
            group: group.to_string(),
            predicates,
            strict,
            looping: false,
            negated,
            optional: false,
        }
    }

    /// True if any predicate matches (predicates are OR'd, order is
    /// irrelevant).
    pub(crate) fn matches(&self, event: &Event, history: &History) -> bool {
        self.predicates
            .iter()
            .any(|p| eval_quiet(p.as_ref(), event, history))
    }

    pub(crate) fn is_plain(&self) -> bool {
        !self.negated && !self.optional && !self.looping
    }

    fn validate(&self) -> Result<()> {
        if self.group.is_empty() {
            return Err(CepError::Configuration("block with empty group".to_string()));
        }
        if self.predicates.is_empty() {
            return Err(CepError::Configuration(format!(
                "block {} has no predicates",
                self.group
            )));
        }
        if self.strict && self.optional {
            return Err(CepError::Configuration(format!(
                "block {} is strict and optional",
                self.group
            )));
        }
        if self.looping && (self.strict || self.negated || self.optional) {
            return Err(CepError::Configuration(format!(
                "loop block {} cannot be strict, negated or optional",
                self.group
            )));
        }
        if self.negated && self.optional {
            return Err(CepError::Configuration(format!(
                "block {} is negated and optional",
                self.group
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("group", &self.group)
            .field("predicates", &self.predicates.len())
            .field("strict", &self.strict)
            .field("looping", &self.looping)
            .field("negated", &self.negated)
            .field("optional", &self.optional)
            .finish()
    }
}

/// Named block sequence plus pattern-global preconditions and
/// haltconditions. Shared read-only between all runs of the pattern.
#[derive(Clone)]
pub struct Pattern {
    pub name: String,
    pub blocks: Vec<Block>,
    pub preconditions: Vec<Arc<dyn Predicate>>,
    pub haltconditions: Vec<Arc<dyn Predicate>>,
    pub singleton: bool,
}

impl Pattern {
    pub fn builder(name: &str) -> PatternBuilder {
        PatternBuilder {
            name: name.to_string(),
            blocks: Vec::new(),
            preconditions: Vec::new(),
            haltconditions: Vec::new(),
            singleton: false,
            pending_error: None,
        }
    }

    /// Index of the last block; a run whose cursor moves past this is
    /// complete.
    pub fn last_index(&self) -> usize {
        self.blocks.len() - 1
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CepError::Configuration("pattern with empty name".to_string()));
        }
        if self.blocks.is_empty() {
            return Err(CepError::Configuration(format!(
                "pattern {} has no blocks",
                self.name
            )));
        }
        for block in &self.blocks {
            block.validate()?;
        }
        let first = &self.blocks[0];
        let last = &self.blocks[self.last_index()];
        if !(first.is_plain() && last.is_plain()) {
            return Err(CepError::Configuration(format!(
                "pattern {}: first and last block must be mandatory (not negated, optional or loop)",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("name", &self.name)
            .field("blocks", &self.blocks)
            .field("singleton", &self.singleton)
            .finish()
    }
}

/// Fluent pattern construction. Modifier calls (`looping`, `optional`,
/// `times`) apply to the most recently added block; misuse is reported
/// as a configuration error from `build`, never silently ignored.
pub struct PatternBuilder {
    name: String,
    blocks: Vec<Block>,
    preconditions: Vec<Arc<dyn Predicate>>,
    haltconditions: Vec<Arc<dyn Predicate>>,
    singleton: bool,
    pending_error: Option<String>,
}

impl PatternBuilder {
    /// Strict-contiguity step: must match the very next event.
    pub fn next(self, group: &str, p: Arc<dyn Predicate>) -> Self {
        self.push(Block::new(group, vec![p], true, false))
    }

    pub fn next_any(self, group: &str, ps: Vec<Arc<dyn Predicate>>) -> Self {
        self.push(Block::new(group, ps, true, false))
    }

    /// Strict negation: the very next event must not match.
    pub fn not_next(self, group: &str, p: Arc<dyn Predicate>) -> Self {
        self.push(Block::new(group, vec![p], true, true))
    }

    pub fn not_next_any(self, group: &str, ps: Vec<Arc<dyn Predicate>>) -> Self {
        self.push(Block::new(group, ps, true, true))
    }

    /// Relaxed-contiguity step: irrelevant events may be skipped.
    pub fn followed_by(self, group: &str, p: Arc<dyn Predicate>) -> Self {
        self.push(Block::new(group, vec![p], false, false))
    }

    pub fn followed_by_any(self, group: &str, ps: Vec<Arc<dyn Predicate>>) -> Self {
        self.push(Block::new(group, ps, false, false))
    }

    /// Relaxed negation: matching events are ignored while pending.
    pub fn not_followed_by(self, group: &str, p: Arc<dyn Predicate>) -> Self {
        self.push(Block::new(group, vec![p], false, true))
    }

    pub fn not_followed_by_any(self, group: &str, ps: Vec<Arc<dyn Predicate>>) -> Self {
        self.push(Block::new(group, ps, false, true))
    }

    /// Mark the last added block as a loop step.
    pub fn looping(mut self) -> Self {
        match self.blocks.last_mut() {
            Some(b) => b.looping = true,
            None => self.defer_error("looping() before any block"),
        }
        self
    }

    /// Mark the last added block as optional.
    pub fn optional(mut self) -> Self {
        match self.blocks.last_mut() {
            Some(b) => b.optional = true,
            None => self.defer_error("optional() before any block"),
        }
        self
    }

    /// Replicate the last added block so it appears `n` times in
    /// sequence.
    pub fn times(mut self, n: usize) -> Self {
        if n == 0 {
            self.defer_error("times(0)");
            return self;
        }
        match self.blocks.last().cloned() {
            Some(b) => {
                for _ in 1..n {
                    self.blocks.push(b.clone());
                }
            }
            None => self.defer_error("times() before any block"),
        }
        self
    }

    /// Pattern-global predicate checked before block dispatch on every
    /// event; a run halts incomplete the moment one fails to hold.
    pub fn precondition(mut self, p: Arc<dyn Predicate>) -> Self {
        self.preconditions.push(p);
        self
    }

    /// Pattern-global predicate; a run halts incomplete the moment one
    /// holds.
    pub fn haltcondition(mut self, p: Arc<dyn Predicate>) -> Self {
        self.haltconditions.push(p);
        self
    }

    /// At most one concurrently active run per phenomenon for this
    /// pattern.
    pub fn singleton(mut self, yes: bool) -> Self {
        self.singleton = yes;
        self
    }

    pub fn build(self) -> Result<Pattern> {
        if let Some(msg) = self.pending_error {
            return Err(CepError::Configuration(format!(
                "pattern {}: {}",
                self.name, msg
            )));
        }
        let pattern = Pattern {
            name: self.name,
            blocks: self.blocks,
            preconditions: self.preconditions,
            haltconditions: self.haltconditions,
            singleton: self.singleton,
        };
        pattern.validate()?;
        Ok(pattern)
    }

    fn push(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    fn defer_error(&mut self, msg: &str) {
        if self.pending_error.is_none() {
            self.pending_error = Some(msg.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eq(n: i64) -> Arc<dyn Predicate> {
        pred(move |e, _| e.payload() == &json!(n))
    }

    fn ev(n: i64) -> Event {
        Event::simple(&format!("e{}", n), n as u64 + 1, json!(n)).unwrap()
    }

    #[test]
    fn test_builder_flags() {
        let p = Pattern::builder("p")
            .followed_by("a", eq(1))
            .next("b", eq(2))
            .not_followed_by("c", eq(3))
            .followed_by("d", eq(4))
            .build()
            .unwrap();
        assert_eq!(p.blocks.len(), 4);
        assert!(!p.blocks[0].strict);
        assert!(p.blocks[1].strict);
        assert!(p.blocks[2].negated && !p.blocks[2].strict);
    }

    #[test]
    fn test_times_replicates() {
        let p = Pattern::builder("p")
            .followed_by("a", eq(1))
            .followed_by("b", eq(2))
            .times(3)
            .followed_by("c", eq(3))
            .build()
            .unwrap();
        assert_eq!(p.blocks.len(), 5);
        assert_eq!(p.blocks[2].group, "b");
        assert_eq!(p.blocks[3].group, "b");
    }

    #[test]
    fn test_illegal_flag_combinations() {
        // strict + optional
        assert!(Pattern::builder("p")
            .followed_by("a", eq(1))
            .next("b", eq(2))
            .optional()
            .followed_by("c", eq(3))
            .build()
            .is_err());
        // loop + negated
        assert!(Pattern::builder("p")
            .followed_by("a", eq(1))
            .not_followed_by("b", eq(2))
            .looping()
            .followed_by("c", eq(3))
            .build()
            .is_err());
        // loop + strict: dispatch has no strict path for loop blocks
        assert!(Pattern::builder("p")
            .followed_by("a", eq(1))
            .next("b", eq(2))
            .looping()
            .followed_by("c", eq(3))
            .build()
            .is_err());
        // negated + optional
        assert!(Pattern::builder("p")
            .followed_by("a", eq(1))
            .not_followed_by("b", eq(2))
            .optional()
            .followed_by("c", eq(3))
            .build()
            .is_err());
    }

    #[test]
    fn test_edge_blocks_must_be_plain() {
        assert!(Pattern::builder("p")
            .followed_by("a", eq(1))
            .looping()
            .followed_by("b", eq(2))
            .build()
            .is_err());
        assert!(Pattern::builder("p")
            .followed_by("a", eq(1))
            .followed_by("b", eq(2))
            .optional()
            .build()
            .is_err());
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(Pattern::builder("p").build().is_err());
        assert!(Pattern::builder("").followed_by("a", eq(1)).build().is_err());
    }

    #[test]
    fn test_modifier_without_block_is_fatal() {
        assert!(Pattern::builder("p").looping().followed_by("a", eq(1)).build().is_err());
        assert!(Pattern::builder("p")
            .followed_by("a", eq(1))
            .times(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_predicates_are_ored() {
        let p = Pattern::builder("p")
            .followed_by_any("a", vec![eq(1), eq(2)])
            .followed_by("b", eq(9))
            .build()
            .unwrap();
        let h = History::default();
        assert!(p.blocks[0].matches(&ev(1), &h));
        assert!(p.blocks[0].matches(&ev(2), &h));
        assert!(!p.blocks[0].matches(&ev(3), &h));
    }

    #[test]
    fn test_predicate_error_is_non_match() {
        let failing = try_pred(|_, _| anyhow::bail!("boom"));
        let b = Block::new("g", vec![failing], false, false);
        assert!(!b.matches(&ev(1), &History::default()));
    }
}
