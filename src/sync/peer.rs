//! Per-peer send-side state machine.
//!
//! Driven by wall-clock elapsed time since last confirmed contact:
//! recent contact with nothing queued means stay quiet, a queued delta
//! goes out immediately, silence past the ping threshold earns a
//! heartbeat, and silence past the resync threshold escalates to a full
//! snapshot that supersedes any stashed deltas.

use crate::run::DeltaBatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub urn: String,
    pub addr: String,
    pub id_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPlan {
    Skip,
    Delta,
    Ping,
    Resync,
}

#[derive(Debug)]
pub struct PeerState {
    pub cfg: PeerConfig,
    /// Epoch ms of the last confirmed contact; 0 means never, which
    /// guarantees the first cycle is a full resync.
    pub last_comms: u64,
    /// Epoch ms of the last send attempt, successful or not.
    pub last_attempt: u64,
    /// Undelivered deltas, folded into the next attempt. Cleared only
    /// on a confirmed success or a superseding resync.
    pub stash: DeltaBatch,
    /// Deltas queued since the last pass.
    pub pending: DeltaBatch,
    /// While set, outgoing frames carry FORCE_RESYNC so the peer pushes
    /// its full state back to a fresh instance. Cleared on success.
    pub force_reset: bool,
}

impl PeerState {
    pub fn new(cfg: PeerConfig) -> Self {
        Self {
            cfg,
            last_comms: 0,
            last_attempt: 0,
            stash: DeltaBatch::default(),
            pending: DeltaBatch::default(),
            force_reset: true,
        }
    }

    pub fn plan(&self, now_ms: u64, ping_ms: u64, resync_ms: u64) -> SendPlan {
        let elapsed = now_ms.saturating_sub(self.last_comms);
        if self.last_comms == 0 || elapsed >= resync_ms {
            return SendPlan::Resync;
        }
        if !self.stash.is_empty() || !self.pending.is_empty() {
            return SendPlan::Delta;
        }
        if elapsed >= ping_ms {
            return SendPlan::Ping;
        }
        SendPlan::Skip
    }

    pub fn queue(&mut self, batch: DeltaBatch) {
        self.pending.merge(batch);
    }

    /// Stash plus pending, drained for one send attempt. On failure the
    /// caller hands the batch back via `on_failure`.
    pub fn take_outgoing(&mut self) -> DeltaBatch {
        let mut out = std::mem::take(&mut self.stash);
        out.merge(std::mem::take(&mut self.pending));
        out.dedupe();
        out
    }

    /// A resync supersedes incremental history: everything pending for
    /// this peer is covered by the snapshot.
    pub fn clear_for_resync(&mut self) {
        self.stash = DeltaBatch::default();
        self.pending = DeltaBatch::default();
    }

    pub fn on_attempt(&mut self, now_ms: u64) {
        self.last_attempt = now_ms;
    }

    pub fn on_success(&mut self, now_ms: u64) {
        self.last_comms = now_ms;
        self.force_reset = false;
    }

    /// Transient send failure: nothing is lost, the undelivered batch
    /// rejoins the stash for the next cycle.
    pub fn on_failure(&mut self, undelivered: DeltaBatch) {
        let mut stash = std::mem::take(&mut self.stash);
        stash.merge(undelivered);
        stash.dedupe();
        self.stash = stash;
    }

    /// Incoming authenticated contact also proves liveness.
    pub fn on_contact(&mut self, now_ms: u64) {
        self.last_comms = now_ms;
    }

    /// FORCE_RESYNC received: zero the clocks so the next cycle ships a
    /// full snapshot.
    pub fn on_force_resync(&mut self) {
        self.last_comms = 0;
        self.last_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::History;
    use crate::run::RunRecord;

    fn peer() -> PeerState {
        PeerState::new(PeerConfig {
            urn: "urn:cep:b".into(),
            addr: "127.0.0.1:9".into(),
            id_key: "k".into(),
        })
    }

    fn rec(id: &str, cursor: usize) -> RunRecord {
        RunRecord {
            run_id: id.into(),
            phenomenon_name: "ph".into(),
            pattern_name: "p".into(),
            block_index: cursor,
            history: History::default(),
        }
    }

    fn delta(id: &str) -> DeltaBatch {
        DeltaBatch::new(vec![], vec![], vec![rec(id, 1)])
    }

    #[test]
    fn test_first_contact_is_resync() {
        let p = peer();
        assert_eq!(p.plan(1_000, 500, 10_000), SendPlan::Resync);
    }

    #[test]
    fn test_plan_transitions() {
        let mut p = peer();
        p.on_success(10_000);

        assert_eq!(p.plan(10_100, 5_000, 60_000), SendPlan::Skip);
        p.queue(delta("r1"));
        assert_eq!(p.plan(10_100, 5_000, 60_000), SendPlan::Delta);
        p.take_outgoing();
        assert_eq!(p.plan(16_000, 5_000, 60_000), SendPlan::Ping);
        assert_eq!(p.plan(80_000, 5_000, 60_000), SendPlan::Resync);
    }

    #[test]
    fn test_failure_stashes_and_success_clears() {
        let mut p = peer();
        p.on_success(1_000);
        p.queue(delta("r1"));
        let out = p.take_outgoing();
        assert_eq!(out.updated.len(), 1);

        p.on_failure(out);
        assert_eq!(p.stash.updated.len(), 1);
        // Next attempt folds the stash back in with newly queued work.
        p.queue(delta("r2"));
        let retry = p.take_outgoing();
        assert_eq!(retry.updated.len(), 2);
        assert!(p.stash.is_empty());
    }

    #[test]
    fn test_stash_dedupes_by_run_identity() {
        let mut p = peer();
        p.on_failure(DeltaBatch::new(vec![], vec![], vec![rec("r1", 1)]));
        p.on_failure(DeltaBatch::new(vec![], vec![], vec![rec("r1", 2)]));
        assert_eq!(p.stash.updated.len(), 1);
        assert_eq!(p.stash.updated[0].block_index, 2);
    }

    #[test]
    fn test_resync_supersedes_stash() {
        let mut p = peer();
        p.queue(delta("r1"));
        p.on_failure(delta("r2"));
        p.clear_for_resync();
        assert!(p.stash.is_empty());
        assert!(p.pending.is_empty());
    }

    #[test]
    fn test_force_resync_zeroes_clocks() {
        let mut p = peer();
        p.on_success(5_000);
        p.on_attempt(5_000);
        p.on_force_resync();
        assert_eq!(p.last_comms, 0);
        assert_eq!(p.last_attempt, 0);
        assert_eq!(p.plan(5_001, 500, 60_000), SendPlan::Resync);
    }

    #[test]
    fn test_force_reset_clears_on_success() {
        let mut p = peer();
        assert!(p.force_reset);
        p.on_success(1_000);
        assert!(!p.force_reset);
    }
}
