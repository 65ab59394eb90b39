//! End-to-end engine scenarios: spawn, advance, halt and complete runs
//! through the decider against real pattern shapes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use cepflow::{
    pred, CepError, Decider, DeciderConfig, DeciderSubscriber, DeltaBatch, Event, Pattern,
    Phenomenon, Predicate, RunRecord,
};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

fn eq(n: i64) -> Arc<dyn Predicate> {
    pred(move |e, _| e.payload() == &json!(n))
}

fn ev(n: i64) -> Event {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::SeqCst);
    Event::simple(&format!("e{}-{}", n, seq), seq, json!(n)).unwrap()
}

#[derive(Default)]
struct Collector {
    batches: Mutex<Vec<(DeltaBatch, bool)>>,
}

impl Collector {
    fn completed(&self) -> Vec<RunRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(b, _)| b.completed.clone())
            .collect()
    }

    fn halted(&self) -> Vec<RunRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(b, _)| b.halted.clone())
            .collect()
    }

    fn updated(&self) -> Vec<RunRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(b, _)| b.updated.clone())
            .collect()
    }
}

impl DeciderSubscriber for Collector {
    fn on_decider_update(
        &self,
        completed: &[RunRecord],
        halted: &[RunRecord],
        updated: &[RunRecord],
        local: bool,
    ) {
        self.batches.lock().unwrap().push((
            DeltaBatch::new(completed.to_vec(), halted.to_vec(), updated.to_vec()),
            local,
        ));
    }
}

fn engine(pattern: Pattern) -> (Decider, Arc<Collector>) {
    let decider = Decider::new(
        vec![Phenomenon::new("ph", vec![pattern])],
        DeciderConfig::default(),
    )
    .unwrap();
    let collector = Arc::new(Collector::default());
    decider.subscribe(collector.clone());
    (decider, collector)
}

fn feed(decider: &Decider, values: &[i64]) {
    for v in values {
        decider.on_receiver_update(ev(*v)).unwrap();
        decider.update();
    }
}

fn strict_123() -> Pattern {
    Pattern::builder("p")
        .next("g1", eq(1))
        .next("g2", eq(2))
        .next("g3", eq(3))
        .build()
        .unwrap()
}

#[test]
fn scenario_a_strict_sequence_completes() {
    let (decider, collector) = engine(strict_123());
    feed(&decider, &[1, 2, 3]);

    let completed = collector.completed();
    assert_eq!(completed.len(), 1);
    let run = &completed[0];
    assert_eq!(run.phenomenon_name, "ph");
    assert_eq!(run.pattern_name, "p");
    assert_eq!(run.history.get("g1").len(), 1);
    assert_eq!(run.history.get("g1")[0].payload(), &json!(1));
    assert_eq!(run.history.get("g2")[0].payload(), &json!(2));
    assert_eq!(run.history.get("g3")[0].payload(), &json!(3));
    assert_eq!(decider.run_count(), 0);
}

#[test]
fn scenario_b_strict_mismatch_halts_incomplete() {
    let (decider, collector) = engine(strict_123());
    feed(&decider, &[1, 2, 4]);

    assert!(collector.completed().is_empty());
    let halted = collector.halted();
    assert_eq!(halted.len(), 1);
    assert_eq!(halted[0].block_index, 2); // cursor froze where it failed
    assert_eq!(decider.run_count(), 0); // halted runs leave the table
}

#[test]
fn scenario_c_loop_with_zero_and_many_iterations() {
    let loop_pattern = || {
        Pattern::builder("p")
            .followed_by("g1", eq(1))
            .followed_by("g2", eq(2))
            .looping()
            .followed_by("g3", eq(3))
            .build()
            .unwrap()
    };

    // Zero loop iterations: 3 falls through the loop block.
    let (decider, collector) = engine(loop_pattern());
    feed(&decider, &[1, 3]);
    let completed = collector.completed();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].history.get("g2").is_empty());

    // Three iterations accumulate, then the same closing event.
    let (decider, collector) = engine(loop_pattern());
    feed(&decider, &[1, 2, 2, 2, 3]);
    let completed = collector.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].history.get("g2").len(), 3);
    assert_eq!(decider.run_count(), 0);
}

#[test]
fn scenario_d_bounded_ingest_backpressure() {
    let decider = Decider::new(
        vec![Phenomenon::new("ph", vec![strict_123()])],
        DeciderConfig {
            max_queue: 1,
            ..Default::default()
        },
    )
    .unwrap();

    decider.on_receiver_update(ev(1)).unwrap();
    let err = decider.on_receiver_update(ev(2)).unwrap_err();
    assert!(matches!(err, CepError::Capacity { capacity: 1, .. }));

    // One update drains the slot; ingest works again.
    decider.update();
    decider.on_receiver_update(ev(2)).unwrap();
}

#[test]
fn fresh_runs_start_at_cursor_one() {
    let (decider, collector) = engine(strict_123());
    feed(&decider, &[1]);
    let updated = collector.updated();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].block_index, 1);
}

#[test]
fn cursor_is_monotone_across_a_run() {
    let (decider, collector) = engine(
        Pattern::builder("p")
            .followed_by("a", eq(1))
            .followed_by("b", eq(2))
            .looping()
            .followed_by("c", eq(3))
            .build()
            .unwrap(),
    );
    feed(&decider, &[1, 2, 7, 2, 3]);

    let mut cursors: Vec<usize> = collector.updated().iter().map(|r| r.block_index).collect();
    cursors.extend(collector.completed().iter().map(|r| r.block_index));
    assert!(cursors.windows(2).all(|w| w[0] <= w[1]), "{:?}", cursors);
    assert_eq!(collector.completed().len(), 1);
}

#[test]
fn singleton_pattern_never_has_two_runs() {
    let pattern = Pattern::builder("p")
        .followed_by("a", eq(1))
        .followed_by("b", eq(2))
        .singleton(true)
        .build()
        .unwrap();
    let decider = Decider::new(
        vec![Phenomenon::new("ph", vec![pattern])],
        DeciderConfig::default(),
    )
    .unwrap();

    for v in [1, 1, 7, 1, 1, 2, 1, 1] {
        decider.on_receiver_update(ev(v)).unwrap();
        decider.update();
        assert!(decider.runs_from("ph", "p").len() <= 1);
    }
}

#[test]
fn multiple_patterns_one_event_stream() {
    let p1 = Pattern::builder("pair")
        .followed_by("a", eq(1))
        .followed_by("b", eq(2))
        .build()
        .unwrap();
    let p2 = Pattern::builder("single").followed_by("x", eq(2)).build().unwrap();
    let decider = Decider::new(
        vec![Phenomenon::new("ph", vec![p1, p2])],
        DeciderConfig::default(),
    )
    .unwrap();
    let collector = Arc::new(Collector::default());
    decider.subscribe(collector.clone());

    feed(&decider, &[1, 2]);

    // Event 2 both completes the pair run and fires the one-block
    // pattern directly.
    let completed = collector.completed();
    assert_eq!(completed.len(), 2);
    let names: Vec<&str> = completed.iter().map(|r| r.pattern_name.as_str()).collect();
    assert!(names.contains(&"pair"));
    assert!(names.contains(&"single"));
}

#[test]
fn haltcondition_stops_all_runs_of_the_pattern() {
    let pattern = Pattern::builder("p")
        .followed_by("a", eq(1))
        .followed_by("b", eq(2))
        .haltcondition(pred(|e, _| e.payload() == &json!(0)))
        .build()
        .unwrap();
    let (decider, collector) = engine(pattern);
    feed(&decider, &[1, 1, 0]);

    assert_eq!(collector.halted().len(), 2);
    assert_eq!(decider.run_count(), 0);
    assert!(collector.completed().is_empty());
}

#[test]
fn run_record_serde_round_trip() {
    let (decider, collector) = engine(strict_123());
    feed(&decider, &[1, 2, 3]);

    let rec = collector.completed().remove(0);
    let wire = serde_json::to_string(&rec).unwrap();
    let back: RunRecord = serde_json::from_str(&wire).unwrap();
    assert_eq!(back.run_id, rec.run_id);
    assert_eq!(back.phenomenon_name, rec.phenomenon_name);
    assert_eq!(back.pattern_name, rec.pattern_name);
    assert_eq!(back.block_index, rec.block_index);
    assert_eq!(back.history, rec.history);
}
