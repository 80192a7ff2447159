//! Certify that each ledger input is consumed at most once.
//!
//! # Overview
//!
//! The core of the module is the [Engine]. It is responsible for:
//! - Certifying the first fully signed transaction to consume each input
//! - Rejecting every later transaction contesting a consumed input
//! - Re-serving the original certificate when a request is repeated
//!
//! # Details
//!
//! The engine keeps the set of consumed inputs and the certificates it has
//! issued in memory. A request either matches a prior certificate (and is
//! answered with it), is malformed (wrong notary, duplicate inputs, or
//! missing approvals), contests a consumed input (rejected with the winning
//! transaction id), or wins every input and is certified. A request never
//! consumes any input unless it wins all of them.
//!
//! The [Mailbox] is used to make requests to the [Engine]. It implements the
//! [crate::Notarizer] trait and may be cloned across any number of
//! schedulers; requests are serialized through the mailbox, so concurrent
//! conflicting requests resolve to exactly one winner.

mod config;
pub use config::Config;
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::Mailbox;
pub(crate) use ingress::Message;
mod metrics;
