//! Run flows, route their sessions, and keep them durable.
//!
//! # Overview
//!
//! The core of the module is the [Engine]. It is responsible for:
//! - Running flow state machines and applying the effects they request
//! - Routing session frames between peers and dropping redelivered ones
//! - Checkpointing every flow at every suspension point and restoring the
//!   whole set after a restart
//! - Relaying notarization requests to the uniqueness service
//!
//! # Details
//!
//! The engine owns a table of live flows. Each flow suspends by declaring
//! what it is waiting for; the engine writes its checkpoint (after applying
//! its effects, so session sequence counters stay consistent) and wakes it
//! when the awaited input arrives. A flow that finishes, fails, or is
//! canceled is removed, its sessions are torn down, its checkpoint is
//! deleted, and its result is reported to the handle and the monitor.
//!
//! The [Mailbox] is used to start flows on the [Engine]. The returned
//! receiver is the flow's handle: dropping it cancels the flow at its next
//! suspension point.

mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::Mailbox;
pub(crate) use ingress::Message;
mod metrics;
