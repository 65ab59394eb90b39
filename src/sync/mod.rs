//! Distributed reconciliation: keeps several engine instances' run
//! state convergent over an encrypted TCP channel. Eventually
//! consistent by design; no global ordering is attempted.

pub mod frame;
pub mod peer;
pub mod service;

pub use frame::{Frame, FrameCipher, MsgType, FLAG_FORCE_RESYNC};
pub use peer::{PeerConfig, PeerState, SendPlan};
pub use service::{DistributedSync, SyncConfig};
