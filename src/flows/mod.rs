//! Flow state machines and their registry.
//!
//! A flow is an explicit state machine: the scheduler drives it with
//! [Input]s, it returns [Effect]s to apply and a [Status] describing whether
//! it is suspended or done. Steps are synchronous and deterministic, so a
//! flow can be checkpointed at any suspension point by serializing its
//! [Flow::snapshot] and reconstructed later through the [Registry].
//!
//! Three canonical protocols are provided:
//!
//! - [collect]: gather approvals from every required signer.
//! - [finality]: notarize, commit, and distribute a fully signed transaction.
//! - [settle]: collect then finalize, as a composite of the other two.

use crate::{
    types::{
        FlowKind, Outcome, Payload, SessionId, SignedTransaction, Waiting,
    },
    Directory, Error, Ledger, Vault, Verifier,
};
use commonware_cryptography::PublicKey;
use std::collections::BTreeMap;

pub mod collect;
pub mod finality;
pub mod settle;

/// Kind of the signature collection protocol.
pub const COLLECT: FlowKind = FlowKind::new(1);

/// Kind of the finalization protocol.
pub const FINALIZE: FlowKind = FlowKind::new(2);

/// Kind of the composite collect-then-finalize protocol.
pub const SETTLE: FlowKind = FlowKind::new(3);

/// Event delivered to a flow by the scheduler.
#[derive(Debug)]
pub enum Input<P: PublicKey> {
    /// First step of a freshly started flow.
    Start,
    /// First step after a restart, restored from a checkpoint.
    Resume,
    /// A payload arrived on one of the flow's sessions.
    Message {
        /// The session the payload arrived on.
        session: SessionId,
        /// The payload.
        payload: Payload<P>,
    },
    /// A session was torn down by the peer.
    SessionFailed {
        /// The session that was torn down.
        session: SessionId,
    },
    /// The notary answered an outstanding request.
    Notary(crate::types::NotaryResponse<P>),
    /// An invoked subflow reached a terminal state.
    SubFlow(Result<Outcome<P>, Error>),
}

/// Action requested by a flow, applied by the scheduler before the flow's
/// checkpoint is written.
#[derive(Debug)]
pub enum Effect<P: PublicKey> {
    /// Open a session to `peer`, spawning its responder for `kind`, and
    /// deliver `payload` as the first message.
    Open {
        /// Session identifier allocated by the flow.
        session: SessionId,
        /// The counterparty.
        peer: P,
        /// The responder kind to spawn on the far end.
        kind: FlowKind,
        /// First payload of the session.
        payload: Payload<P>,
    },
    /// Send a payload on an established session.
    Send {
        /// The session to send on.
        session: SessionId,
        /// The payload.
        payload: Payload<P>,
    },
    /// Submit a fully signed transaction to the designated notary.
    Notarize(SignedTransaction<P>),
    /// Invoke a subflow and suspend until it finishes.
    Invoke {
        /// The kind of flow to invoke.
        kind: FlowKind,
        /// The transaction the subflow operates on.
        signed: SignedTransaction<P>,
    },
}

/// Whether a flow is suspended or done after a step.
#[derive(Debug)]
pub enum Status<P: PublicKey> {
    /// The flow is suspended until the described input arrives.
    Await(Waiting),
    /// The flow reached a terminal state.
    Done(Outcome<P>),
}

/// Result of a single flow step.
#[derive(Debug)]
pub struct Step<P: PublicKey> {
    /// Effects to apply, in order.
    pub effects: Vec<Effect<P>>,
    /// The flow's resulting status.
    pub status: Status<P>,
}

impl<P: PublicKey> Step<P> {
    /// A terminal step with no effects.
    pub fn done(outcome: Outcome<P>) -> Self {
        Self {
            effects: Vec::new(),
            status: Status::Done(outcome),
        }
    }

    /// A suspending step with no effects.
    pub fn wait(waiting: Waiting) -> Self {
        Self {
            effects: Vec::new(),
            status: Status::Await(waiting),
        }
    }

    /// A suspending step applying `effects` first.
    pub fn apply(effects: Vec<Effect<P>>, waiting: Waiting) -> Self {
        Self {
            effects,
            status: Status::Await(waiting),
        }
    }

    /// A terminal step applying `effects` first.
    pub fn finish(effects: Vec<Effect<P>>, outcome: Outcome<P>) -> Self {
        Self {
            effects,
            status: Status::Done(outcome),
        }
    }
}

/// A protocol state machine driven by the scheduler.
pub trait Flow<P: PublicKey>: Send + 'static {
    /// Advances the flow with one input.
    ///
    /// A returned error is terminal: the scheduler tears down the flow's
    /// sessions and reports the error through the flow's handle.
    fn step(&mut self, input: Input<P>) -> Result<Step<P>, Error>;

    /// Serializes the flow's state for checkpointing.
    fn snapshot(&self) -> Vec<u8>;
}

type Initiate<P> = Box<dyn Fn(u64, SignedTransaction<P>) -> Box<dyn Flow<P>> + Send>;
type Respond<P> = Box<dyn Fn(u64) -> Box<dyn Flow<P>> + Send>;
type Restore<P> = Box<dyn Fn(&[u8]) -> Result<Box<dyn Flow<P>>, Error> + Send>;

struct Entry<P: PublicKey> {
    initiate: Initiate<P>,
    respond: Option<Respond<P>>,
    restore: Restore<P>,
}

/// Explicit mapping from [FlowKind] to flow constructors.
///
/// Populated by registration calls at startup. Starting an unregistered kind
/// fails with [Error::UnknownFlowKind]; an inbound open for a kind with no
/// responder fails with [Error::NoResponderRegistered].
pub struct Registry<P: PublicKey> {
    entries: BTreeMap<FlowKind, Entry<P>>,
}

impl<P: PublicKey> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PublicKey> Registry<P> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registers a flow kind.
    ///
    /// `initiate` constructs the initiating side (given a session id seed and
    /// the transaction to operate on), `respond` the responding side (absent
    /// for kinds that are never opened by a peer), and `restore` rebuilds
    /// either side from a checkpointed snapshot.
    pub fn register(
        &mut self,
        kind: FlowKind,
        initiate: Initiate<P>,
        respond: Option<Respond<P>>,
        restore: Restore<P>,
    ) {
        self.entries.insert(
            kind,
            Entry {
                initiate,
                respond,
                restore,
            },
        );
    }

    pub(crate) fn initiate(
        &self,
        kind: FlowKind,
        seed: u64,
        signed: SignedTransaction<P>,
    ) -> Result<Box<dyn Flow<P>>, Error> {
        let entry = self.entries.get(&kind).ok_or(Error::UnknownFlowKind(kind))?;
        Ok((entry.initiate)(seed, signed))
    }

    pub(crate) fn respond(&self, kind: FlowKind, seed: u64) -> Result<Box<dyn Flow<P>>, Error> {
        let entry = self.entries.get(&kind).ok_or(Error::UnknownFlowKind(kind))?;
        let respond = entry
            .respond
            .as_ref()
            .ok_or(Error::NoResponderRegistered(kind))?;
        Ok(respond(seed))
    }

    pub(crate) fn restore(
        &self,
        kind: FlowKind,
        snapshot: &[u8],
    ) -> Result<Box<dyn Flow<P>>, Error> {
        let entry = self.entries.get(&kind).ok_or(Error::UnknownFlowKind(kind))?;
        (entry.restore)(snapshot)
    }
}

/// Application services shared by the canonical protocols.
pub struct Services<P: PublicKey, D, V, T, L> {
    /// Namespace for all signatures produced by this node.
    pub namespace: Vec<u8>,
    /// This node's well-known identity.
    pub me: P,
    /// Directory of well-known parties.
    pub directory: D,
    /// Application proposal predicate.
    pub verifier: V,
    /// Local signing keys.
    pub vault: T,
    /// Finalized transaction store.
    pub ledger: L,
}

impl<P: PublicKey, D: Clone, V: Clone, T: Clone, L: Clone> Clone for Services<P, D, V, T, L> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            me: self.me.clone(),
            directory: self.directory.clone(),
            verifier: self.verifier.clone(),
            vault: self.vault.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

/// Builds a registry with the three canonical protocols registered.
pub fn standard<P, D, V, T, L>(services: Services<P, D, V, T, L>) -> Registry<P>
where
    P: PublicKey,
    D: Directory<P>,
    V: Verifier<P>,
    T: Vault<P>,
    L: Ledger<P>,
{
    let mut registry = Registry::new();

    let initiate = services.clone();
    let respond = services.clone();
    let restore = services.clone();
    registry.register(
        COLLECT,
        Box::new(move |seed, signed| {
            Box::new(collect::Initiator::new(&initiate, signed, seed))
        }),
        Some(Box::new(move |_| Box::new(collect::Responder::new(&respond)))),
        Box::new(move |snapshot| collect::restore(&restore, snapshot)),
    );

    let initiate = services.clone();
    let respond = services.clone();
    let restore = services.clone();
    registry.register(
        FINALIZE,
        Box::new(move |seed, signed| {
            Box::new(finality::Initiator::new(&initiate, signed, seed))
        }),
        Some(Box::new(move |_| {
            Box::new(finality::Responder::new(&respond))
        })),
        Box::new(move |snapshot| finality::restore(&restore, snapshot)),
    );

    registry.register(
        SETTLE,
        Box::new(move |_, signed| Box::new(settle::Settle::new(signed))),
        None,
        Box::new(settle::restore),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};

    fn registry() -> Registry<commonware_cryptography::ed25519::PublicKey> {
        let me = PrivateKey::from_seed(0).public_key();
        standard(Services {
            namespace: b"test".to_vec(),
            me: me.clone(),
            directory: mocks::Directory::new([me]),
            verifier: mocks::Verifier::accepting(),
            vault: mocks::Vault::new([]),
            ledger: mocks::Ledger::new(),
        })
    }

    #[test]
    fn test_registry_unknown_kind() {
        let registry = registry();
        let tx = mocks::transaction(&[], PrivateKey::from_seed(9).public_key());
        let result = registry.initiate(FlowKind::new(99), 0, SignedTransaction::new(tx));
        assert!(matches!(result, Err(Error::UnknownFlowKind(_))));
    }

    #[test]
    fn test_registry_no_responder() {
        let registry = registry();
        assert!(registry.respond(COLLECT, 0).is_ok());
        assert!(matches!(
            registry.respond(SETTLE, 0),
            Err(Error::NoResponderRegistered(_))
        ));
    }
}
