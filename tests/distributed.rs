//! Two live engine instances reconciling over a loopback TCP link.
//!
//! Timings are short but every assertion polls with a generous
//! deadline, so the tests tolerate slow CI machines without flaking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use cepflow::sync::{Frame, FrameCipher, MsgType};
use cepflow::{
    pred, Decider, DeciderConfig, DeciderSubscriber, DeltaBatch, DistributedSync, Event, Pattern,
    PeerConfig, Phenomenon, Predicate, RunRecord, Service, SyncConfig,
};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

fn eq(n: i64) -> Arc<dyn Predicate> {
    pred(move |e, _| e.payload() == &json!(n))
}

fn ev(n: i64) -> Event {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::SeqCst);
    Event::simple(&format!("e{}-{}", n, seq), seq, json!(n)).unwrap()
}

fn pair_pattern() -> Pattern {
    Pattern::builder("p")
        .followed_by("a", eq(1))
        .followed_by("b", eq(2))
        .build()
        .unwrap()
}

#[derive(Default)]
struct Collector {
    batches: Mutex<Vec<(DeltaBatch, bool)>>,
}

impl Collector {
    fn remote_completed(&self) -> Vec<RunRecord> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, local)| !local)
            .flat_map(|(b, _)| b.completed.clone())
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

struct Node {
    decider: Arc<Decider>,
    sync: Arc<DistributedSync>,
    collector: Arc<Collector>,
}

fn node(urn: &str, id_key: &str, peers: Vec<PeerConfig>) -> Node {
    let decider = Arc::new(
        Decider::new(
            vec![Phenomenon::new("ph", vec![pair_pattern()])],
            DeciderConfig {
                max_queue: 64,
                max_cache: 16,
                quiet: true,
            },
        )
        .unwrap(),
    );
    let sync = DistributedSync::start(
        SyncConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            urn: urn.to_string(),
            id_key: id_key.to_string(),
            secret: "loopback-test-secret".to_string(),
            peers,
            ping_ms: 200,
            resync_ms: 400,
            io_timeout_ms: 1_000,
            poll_ms: 25,
            max_queue: 64,
            ..Default::default()
        },
        decider.clone(),
    )
    .unwrap();
    decider.subscribe(sync.clone());
    let collector = Arc::new(Collector::default());
    decider.subscribe(collector.clone());
    Node {
        decider,
        sync,
        collector,
    }
}

fn wait_for(what: &str, deadline: Duration, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn two_instances_converge_over_loopback() {
    let a = node("urn:cep:a", "key-a", vec![]);
    let b = node(
        "urn:cep:b",
        "key-b",
        vec![PeerConfig {
            urn: "urn:cep:a".to_string(),
            addr: a.sync.local_addr().to_string(),
            id_key: "key-a".to_string(),
        }],
    );
    a.sync.add_peer(PeerConfig {
        urn: "urn:cep:b".to_string(),
        addr: b.sync.local_addr().to_string(),
        id_key: "key-b".to_string(),
    });
    assert_eq!(a.sync.peer_count(), 1);
    assert_eq!(b.sync.peer_count(), 1);

    // An active run on A is mirrored onto B.
    a.decider.on_receiver_update(ev(1)).unwrap();
    a.decider.update();
    wait_for("run mirrored to b", Duration::from_secs(10), || {
        b.decider.runs_from("ph", "p").len() == 1
    });
    let mirrored = b.decider.runs_from("ph", "p").remove(0);
    assert_eq!(mirrored.block_index, 1);

    // Completing it on A resolves the mirror on B, tagged remote.
    a.decider.on_receiver_update(ev(2)).unwrap();
    a.decider.update();
    wait_for("completion relayed to b", Duration::from_secs(10), || {
        !b.collector.remote_completed().is_empty()
    });
    let completed = b.collector.remote_completed().remove(0);
    assert_eq!(completed.run_id, mirrored.run_id);
    assert_eq!(completed.history.get("b").len(), 1);
    wait_for("mirror evicted on b", Duration::from_secs(10), || {
        b.decider.run_count() == 0
    });

    // B never echoes the relayed batch back out as its own.
    assert!(a.collector.remote_completed().is_empty());

    a.sync.close();
    b.sync.close();
    assert!(a.sync.is_closed());
    assert!(b.sync.is_closed());
}

#[test]
fn delta_survives_an_unreachable_peer() {
    let a = node("urn:cep:a2", "key-a", vec![]);
    // Reserve an address, then drop the listener so sends fail fast.
    let dead_addr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().to_string()
    };
    a.sync.add_peer(PeerConfig {
        urn: "urn:cep:gone".to_string(),
        addr: dead_addr.clone(),
        id_key: "k".to_string(),
    });

    a.decider.on_receiver_update(ev(1)).unwrap();
    a.decider.update();
    std::thread::sleep(Duration::from_millis(300));

    // Bring a real peer up at a fresh address and point a new entry at
    // it; the engine state still reaches it via resync.
    let b = node(
        "urn:cep:b2",
        "key-b",
        vec![PeerConfig {
            urn: "urn:cep:a2".to_string(),
            addr: a.sync.local_addr().to_string(),
            id_key: "key-a".to_string(),
        }],
    );
    a.sync.add_peer(PeerConfig {
        urn: "urn:cep:b2".to_string(),
        addr: b.sync.local_addr().to_string(),
        id_key: "key-b".to_string(),
    });
    wait_for("late peer catches up", Duration::from_secs(10), || {
        b.decider.runs_from("ph", "p").len() == 1
    });

    a.sync.close();
    b.sync.close();
}

#[test]
fn sealed_delta_frame_round_trips() {
    let cipher = FrameCipher::from_secret("loopback-test-secret");
    let batch = DeltaBatch::new(
        vec![RunRecord {
            run_id: "r-1".to_string(),
            phenomenon_name: "ph".to_string(),
            pattern_name: "p".to_string(),
            block_index: 2,
            history: Default::default(),
        }],
        vec![],
        vec![],
    );
    let frame = Frame::new(
        "urn:cep:a",
        "key-a",
        MsgType::Sync,
        0,
        serde_json::to_string(&batch).unwrap(),
    );
    let wire = cipher.seal(&frame).unwrap();
    let back = cipher.open(&wire).unwrap();
    assert_eq!(back.msg_type, MsgType::Sync);
    let parsed: DeltaBatch = serde_json::from_str(&back.payload).unwrap();
    assert_eq!(parsed.completed[0].run_id, "r-1");
    assert_eq!(parsed.completed[0].block_index, 2);
}
