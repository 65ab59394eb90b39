//! cepflow: a complex-event-processing engine.
//!
//! A live stream of discrete events is matched against declaratively
//! defined multi-step patterns to detect higher-level phenomena. Each
//! in-flight match attempt is a [`run::Run`]; the [`decider::Decider`]
//! owns all runs, advances them one event at a time and fans results
//! out to subscribers. [`sync::DistributedSync`] keeps several engine
//! instances' detection state convergent over an encrypted TCP channel
//! with stash-based retry resilience.
//!
//! The engine is thread-based: coarse per-component mutexes, per-run
//! locks, no async runtime. External drivers tick the decider through
//! the [`tasks::Task`] seam and shut the sync service down through
//! [`tasks::Service`].

pub mod decider;
pub mod error;
pub mod event;
pub mod logging;
pub mod pattern;
pub mod queue;
pub mod run;
pub mod sync;
pub mod tasks;

pub use decider::{Decider, DeciderConfig, DeciderSubscriber, Phenomenon};
pub use error::{CepError, Result};
pub use event::{Event, EventData, History};
pub use pattern::{pred, try_pred, Block, Pattern, PatternBuilder, Predicate};
pub use run::{DeltaBatch, Run, RunRecord};
pub use sync::{DistributedSync, PeerConfig, SyncConfig};
pub use tasks::{Service, Task};
