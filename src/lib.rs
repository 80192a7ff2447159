//! Execute multi-party transaction protocols over a permissioned network.
//!
//! `txflow` coordinates the lifecycle of a shared-ledger transaction between
//! mutually known parties: collecting approvals from required signers,
//! obtaining a uniqueness certificate from a notary, committing the result,
//! and distributing it to every participant. Protocols ("flows") are explicit
//! state machines driven by a scheduler actor that owns their sessions,
//! checkpoints them at every suspension point, and restores them after a
//! restart.
//!
//! # Architecture
//!
//! The crate is composed of the following actors:
//!
//! - [scheduler::Engine]: runs flows, routes session traffic between peers,
//!   persists checkpoints through a [CheckpointStore], and relays
//!   notarization requests.
//! - [notary::Engine]: the uniqueness service; certifies the first
//!   transaction to consume each input and rejects all later conflicting
//!   requests.
//!
//! Applications plug in through capability traits: a [Verifier] that accepts
//! or rejects proposals, a [Vault] holding the local signing keys, a [Ledger]
//! of finalized transactions, a [Directory] of well-known parties, a
//! [CheckpointStore] for durable flow state, and a [Monitor] observing flow
//! terminations.

pub mod flows;
#[cfg(test)]
pub mod mocks;
pub mod notary;
pub mod scheduler;
pub mod types;

use commonware_cryptography::PublicKey;
use std::collections::BTreeSet;
use std::future::Future;
use thiserror::Error;
use types::{
    Approval, Checkpoint, FlowId, FlowKind, InputRef, NotaryError, NotaryResponse,
    NotarizedTransaction, Output, PayloadKind, SessionId, SignedTransaction, Transaction, TxId,
};

/// Errors that can occur while running a flow.
#[derive(Error, Debug)]
pub enum Error {
    // Registration errors
    /// The flow kind was never registered.
    #[error("unknown flow kind {0}")]
    UnknownFlowKind(FlowKind),
    /// A peer opened a session for a kind with no registered responder.
    #[error("no responder registered for kind {0}")]
    NoResponderRegistered(FlowKind),

    // Resolution errors
    /// A required party is not present in the [Directory].
    #[error("unknown party {0}")]
    UnknownParty(String),

    // Signature errors
    /// The initiator's own approval was missing before collection started.
    #[error("initiator signature missing")]
    InitiatorSignatureMissing,
    /// Finalization was requested without every required approval.
    #[error("incomplete signatures")]
    IncompleteSignatures,
    /// An approval failed cryptographic verification.
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    /// A counterparty returned an approval from a signer already covered.
    #[error("signer collision on {0}")]
    SignerCollision(String),
    /// A counterparty refused to approve the proposal.
    #[error("signature rejected: {}", String::from_utf8_lossy(reason))]
    SignatureRejected {
        /// Opaque reason provided by the counterparty.
        reason: Vec<u8>,
    },

    // Protocol violations
    /// A session delivered a payload of the wrong shape.
    #[error("unexpected payload: expected {expected}, got {got}")]
    UnexpectedPayload {
        /// The payload shape the flow was waiting for.
        expected: PayloadKind,
        /// The payload shape that arrived.
        got: PayloadKind,
    },
    /// A session identifier collided with one already live on the peer.
    #[error("duplicate session {0}")]
    DuplicateSession(SessionId),
    /// An input arrived that the flow was not waiting for.
    #[error("unexpected input")]
    UnexpectedInput,
    /// A session was torn down by the peer before the flow finished with it.
    #[error("session {0} closed")]
    SessionClosed(SessionId),

    // Notary errors
    /// The notary refused because an input was already consumed.
    #[error("notary conflict on {input}: competing transaction {competing}")]
    NotaryConflict {
        /// The contested input.
        input: InputRef,
        /// The transaction that consumed it first.
        competing: TxId,
    },
    /// The notary refused for a reason other than contention.
    #[error("notary rejected: {0}")]
    NotaryRejected(NotaryError),

    // Transport errors
    /// Unable to send a message over the P2P network.
    #[error("unable to send message")]
    UnableToSendMessage,

    // Lifecycle errors
    /// The flow was canceled by its owner.
    #[error("canceled")]
    Canceled,
    /// A checkpoint or snapshot could not be decoded.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(commonware_codec::Error),
}

impl Error {
    /// Returns true if the error is a transport failure worth retrying.
    pub fn retryable(&self) -> bool {
        matches!(self, Error::UnableToSendMessage)
    }
}

/// Application predicate that accepts or rejects a proposed transaction.
///
/// Runs on the responder side before any approval is produced. Must be pure:
/// the same proposal and resolved inputs always produce the same answer.
pub trait Verifier<P: PublicKey>: Clone + Send + 'static {
    /// Checks a proposal against the outputs its inputs resolved to.
    ///
    /// Returns an opaque reason on rejection, relayed to the initiator.
    fn verify(&self, tx: &Transaction<P>, resolved: &[Output<P>]) -> Result<(), Vec<u8>>;
}

/// Maps parties to their well-known identities.
///
/// Counterparties are resolved through the directory before any session is
/// opened; a miss is a fail-fast [Error::UnknownParty].
pub trait Directory<P: PublicKey>: Clone + Send + 'static {
    /// Resolves a party to its well-known identity, if known.
    fn resolve(&self, party: &P) -> Option<P>;
}

/// Holds the signing keys controlled by this node.
pub trait Vault<P: PublicKey>: Clone + Send + 'static {
    /// Signs a transaction with every controlled key in `required`.
    fn approve(
        &self,
        namespace: &[u8],
        tx: &Transaction<P>,
        required: &BTreeSet<P>,
    ) -> Vec<Approval<P>>;
}

/// Store of finalized transactions.
pub trait Ledger<P: PublicKey>: Clone + Send + 'static {
    /// Returns the finalized transaction with the given id, if committed.
    fn get(&self, tx: &TxId) -> Option<NotarizedTransaction<P>>;

    /// Resolves an input reference to the output it consumes, if known.
    fn resolve(&self, input: &InputRef) -> Option<Output<P>>;

    /// Commits a finalized transaction. Commits are idempotent by id.
    fn commit(&self, notarized: NotarizedTransaction<P>);
}

/// Durable store of flow checkpoints.
pub trait CheckpointStore<P: PublicKey>: Clone + Send + 'static {
    /// Persists a checkpoint, replacing any prior checkpoint for the flow.
    fn put(&self, checkpoint: Checkpoint<P>);

    /// Deletes the checkpoint for a flow, if present.
    fn delete(&self, flow: FlowId);

    /// Loads every persisted checkpoint.
    fn load(&self) -> Vec<Checkpoint<P>>;
}

/// Observes flow terminations.
pub trait Monitor<P: PublicKey>: Clone + Send + 'static {
    /// Called once when a flow reaches a terminal state.
    fn finished(
        &self,
        flow: FlowId,
        kind: FlowKind,
        result: &Result<types::Outcome<P>, Error>,
    );
}

/// Client contract of the uniqueness service.
pub trait Notarizer<P: PublicKey>: Clone + Send + 'static {
    /// Requests certification of a fully signed transaction.
    ///
    /// Repeated requests for the same transaction id are idempotent.
    fn notarize(
        &mut self,
        signed: SignedTransaction<P>,
    ) -> impl Future<Output = Result<NotaryResponse<P>, Error>> + Send;
}
