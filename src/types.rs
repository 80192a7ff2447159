//! Types shared across the crate.

use bytes::{Buf, BufMut};
use commonware_codec::{
    varint::UInt, Encode, EncodeSize, Error as CodecError, Read, ReadExt, ReadRangeExt, Write,
};
use commonware_cryptography::{sha256, Digestible, PublicKey, Signer};
use commonware_utils::union;
use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
};

/// Identifier of a transaction (the digest of its encoding).
pub type TxId = sha256::Digest;

/// Maximum number of inputs a transaction may reference.
pub const MAX_INPUTS: usize = 256;

/// Maximum number of outputs a transaction may produce.
pub const MAX_OUTPUTS: usize = 256;

/// Maximum number of commands a transaction may carry.
pub const MAX_COMMANDS: usize = 64;

/// Maximum number of parties attached to a single output or command.
pub const MAX_PARTIES: usize = 64;

/// Maximum size of opaque output or command data, in bytes.
pub const MAX_DATA: usize = 10_240;

/// Maximum number of approvals attached to a transaction.
pub const MAX_APPROVALS: usize = MAX_PARTIES * MAX_COMMANDS;

/// Maximum size of a serialized flow state snapshot, in bytes.
///
/// Sized for a full transaction with every approval attached.
pub const MAX_SNAPSHOT: usize = 1 << 24;

/// Maximum number of live sessions recorded in a single checkpoint
/// (at most one per distinct participant).
pub const MAX_SESSIONS: usize = MAX_PARTIES * (MAX_OUTPUTS + MAX_COMMANDS);

/// Maximum size of a rejection reason, in bytes.
pub const MAX_REASON: usize = 1_024;

/// Suffix used to identify a transaction approval namespace for domain separation.
const APPROVAL_SUFFIX: &[u8] = b"_TXFLOW_APPROVAL";

/// Suffix used to identify a notarization namespace for domain separation.
const NOTARY_SUFFIX: &[u8] = b"_TXFLOW_NOTARY";

/// Returns a suffixed namespace for signing a transaction approval.
#[inline]
pub fn approval_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, APPROVAL_SUFFIX)
}

/// Returns a suffixed namespace for signing a notarization certificate.
#[inline]
pub fn notary_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, NOTARY_SUFFIX)
}

/// Unique identifier of a flow run, assigned at start and stable across restarts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowId(u64);

impl FlowId {
    /// Creates a new flow identifier from a u64 value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying u64 value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Write for FlowId {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.0).write(buf);
    }
}

impl Read for FlowId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let value: u64 = UInt::read(buf)?.into();
        Ok(Self(value))
    }
}

impl EncodeSize for FlowId {
    fn encode_size(&self) -> usize {
        UInt(self.0).encode_size()
    }
}

/// Identifier of a session channel, unique per (initiating flow, counterparty).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a new session identifier from a u64 value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying u64 value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Write for SessionId {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.0).write(buf);
    }
}

impl Read for SessionId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let value: u64 = UInt::read(buf)?.into();
        Ok(Self(value))
    }
}

impl EncodeSize for SessionId {
    fn encode_size(&self) -> usize {
        UInt(self.0).encode_size()
    }
}

/// Identifier of a registered flow type, shared by initiator and responder logic.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKind(u64);

impl FlowKind {
    /// Creates a new flow kind from a u64 value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying u64 value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for FlowKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Write for FlowKind {
    fn write(&self, buf: &mut impl BufMut) {
        UInt(self.0).write(buf);
    }
}

impl Read for FlowKind {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let value: u64 = UInt::read(buf)?.into();
        Ok(Self(value))
    }
}

impl EncodeSize for FlowKind {
    fn encode_size(&self) -> usize {
        UInt(self.0).encode_size()
    }
}

/// Reference to an output of a prior transaction, consumed as an input.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputRef {
    /// Identifier of the transaction that produced the output.
    pub tx: TxId,
    /// Position of the output within that transaction.
    pub index: u32,
}

impl Display for InputRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx, self.index)
    }
}

impl Write for InputRef {
    fn write(&self, buf: &mut impl BufMut) {
        self.tx.write(buf);
        UInt(self.index).write(buf);
    }
}

impl Read for InputRef {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let tx = TxId::read(buf)?;
        let index: u32 = UInt::read(buf)?.into();
        Ok(Self { tx, index })
    }
}

impl EncodeSize for InputRef {
    fn encode_size(&self) -> usize {
        self.tx.encode_size() + UInt(self.index).encode_size()
    }
}

/// An output produced by a transaction: opaque application data plus the
/// parties that hold it once the transaction is final.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output<P: PublicKey> {
    /// Opaque application state.
    pub data: Vec<u8>,
    /// Parties that store this output in their vaults.
    pub participants: Vec<P>,
}

impl<P: PublicKey> Write for Output<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.data.write(buf);
        self.participants.write(buf);
    }
}

impl<P: PublicKey> Read for Output<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let data = Vec::<u8>::read_range(buf, ..=MAX_DATA)?;
        let participants = Vec::<P>::read_range(buf, ..=MAX_PARTIES)?;
        Ok(Self { data, participants })
    }
}

impl<P: PublicKey> EncodeSize for Output<P> {
    fn encode_size(&self) -> usize {
        self.data.encode_size() + self.participants.encode_size()
    }
}

/// A command carried by a transaction: an opaque action plus the parties
/// whose approvals the action requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command<P: PublicKey> {
    /// Opaque action payload, interpreted by the application policy.
    pub action: Vec<u8>,
    /// Parties that must approve the transaction for this command.
    pub signers: Vec<P>,
}

impl<P: PublicKey> Write for Command<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.action.write(buf);
        self.signers.write(buf);
    }
}

impl<P: PublicKey> Read for Command<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let action = Vec::<u8>::read_range(buf, ..=MAX_DATA)?;
        let signers = Vec::<P>::read_range(buf, ..=MAX_PARTIES)?;
        Ok(Self { action, signers })
    }
}

impl<P: PublicKey> EncodeSize for Command<P> {
    fn encode_size(&self) -> usize {
        self.action.encode_size() + self.signers.encode_size()
    }
}

/// A proposed state transition: inputs it consumes, outputs it produces,
/// commands that bind its required signers, and the notary that orders it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction<P: PublicKey> {
    /// Prior outputs consumed by this transaction.
    pub inputs: Vec<InputRef>,
    /// New outputs produced by this transaction.
    pub outputs: Vec<Output<P>>,
    /// Commands that determine the required signers.
    pub commands: Vec<Command<P>>,
    /// The notary that must certify this transaction before it is final.
    pub notary: P,
}

impl<P: PublicKey> Transaction<P> {
    /// Returns the identifier of this transaction (the digest of its encoding).
    pub fn id(&self) -> TxId {
        sha256::hash(&self.encode())
    }

    /// Returns the set of parties that must approve this transaction.
    pub fn required_signers(&self) -> BTreeSet<P> {
        self.commands
            .iter()
            .flat_map(|command| command.signers.iter().cloned())
            .collect()
    }

    /// Returns the set of parties that must receive the finalized transaction
    /// (output holders and required signers).
    pub fn participants(&self) -> BTreeSet<P> {
        let mut parties = self.required_signers();
        for output in &self.outputs {
            parties.extend(output.participants.iter().cloned());
        }
        parties
    }

    /// Returns true if no input is referenced more than once.
    pub fn distinct_inputs(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.inputs.iter().all(|input| seen.insert(*input))
    }
}

impl<P: PublicKey> Digestible for Transaction<P> {
    type Digest = TxId;

    fn digest(&self) -> TxId {
        self.id()
    }
}

impl<P: PublicKey> Write for Transaction<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.inputs.write(buf);
        self.outputs.write(buf);
        self.commands.write(buf);
        self.notary.write(buf);
    }
}

impl<P: PublicKey> Read for Transaction<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let inputs = Vec::<InputRef>::read_range(buf, ..=MAX_INPUTS)?;
        let outputs = Vec::<Output<P>>::read_range(buf, ..=MAX_OUTPUTS)?;
        let commands = Vec::<Command<P>>::read_range(buf, ..=MAX_COMMANDS)?;
        let notary = P::read(buf)?;
        Ok(Self {
            inputs,
            outputs,
            commands,
            notary,
        })
    }
}

impl<P: PublicKey> EncodeSize for Transaction<P> {
    fn encode_size(&self) -> usize {
        self.inputs.encode_size()
            + self.outputs.encode_size()
            + self.commands.encode_size()
            + self.notary.encode_size()
    }
}

/// A party's signature over a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Approval<P: PublicKey> {
    /// The approving party.
    pub signer: P,
    /// Signature over the transaction encoding.
    pub signature: P::Signature,
}

impl<P: PublicKey> Approval<P> {
    /// Signs a transaction, producing an approval bound to the signer's key.
    pub fn sign<S: Signer<PublicKey = P, Signature = P::Signature>>(
        namespace: &[u8],
        signer: &S,
        tx: &Transaction<P>,
    ) -> Self {
        let namespace = approval_namespace(namespace);
        let signature = signer.sign(Some(&namespace), &tx.encode());
        Self {
            signer: signer.public_key(),
            signature,
        }
    }

    /// Verifies this approval against a transaction.
    pub fn verify(&self, namespace: &[u8], tx: &Transaction<P>) -> bool {
        let namespace = approval_namespace(namespace);
        self.signer
            .verify(Some(&namespace), &tx.encode(), &self.signature)
    }
}

impl<P: PublicKey> Write for Approval<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.signer.write(buf);
        self.signature.write(buf);
    }
}

impl<P: PublicKey> Read for Approval<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let signer = P::read(buf)?;
        let signature = P::Signature::read(buf)?;
        Ok(Self { signer, signature })
    }
}

impl<P: PublicKey> EncodeSize for Approval<P> {
    fn encode_size(&self) -> usize {
        self.signer.encode_size() + self.signature.encode_size()
    }
}

/// A transaction together with the approvals collected so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction<P: PublicKey> {
    /// The proposed transaction.
    pub tx: Transaction<P>,
    /// Approvals collected so far, at most one per signer.
    pub approvals: Vec<Approval<P>>,
}

impl<P: PublicKey> SignedTransaction<P> {
    /// Creates a signed transaction with no approvals.
    pub fn new(tx: Transaction<P>) -> Self {
        Self {
            tx,
            approvals: Vec::new(),
        }
    }

    /// Adds an approval, rejecting duplicates from the same signer.
    ///
    /// The approval's signature is not checked here (use `verify`).
    pub fn add(&mut self, approval: Approval<P>) -> bool {
        if self
            .approvals
            .iter()
            .any(|existing| existing.signer == approval.signer)
        {
            return false;
        }
        self.approvals.push(approval);
        true
    }

    /// Returns the set of parties that have approved.
    pub fn signers(&self) -> BTreeSet<P> {
        self.approvals
            .iter()
            .map(|approval| approval.signer.clone())
            .collect()
    }

    /// Returns true if every required signer has approved.
    pub fn fully_signed(&self) -> bool {
        let signed = self.signers();
        self.tx
            .required_signers()
            .iter()
            .all(|signer| signed.contains(signer))
    }

    /// Verifies every attached approval, and that each comes from a
    /// required signer with no signer appearing twice.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        let required = self.tx.required_signers();
        let mut seen = BTreeSet::new();
        for approval in &self.approvals {
            if !required.contains(&approval.signer) {
                return false;
            }
            if !seen.insert(approval.signer.clone()) {
                return false;
            }
            if !approval.verify(namespace, &self.tx) {
                return false;
            }
        }
        true
    }
}

impl<P: PublicKey> Digestible for SignedTransaction<P> {
    type Digest = TxId;

    fn digest(&self) -> TxId {
        self.tx.id()
    }
}

impl<P: PublicKey> Write for SignedTransaction<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.tx.write(buf);
        self.approvals.write(buf);
    }
}

impl<P: PublicKey> Read for SignedTransaction<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let tx = Transaction::<P>::read(buf)?;
        let approvals = Vec::<Approval<P>>::read_range(buf, ..=MAX_APPROVALS)?;
        Ok(Self { tx, approvals })
    }
}

impl<P: PublicKey> EncodeSize for SignedTransaction<P> {
    fn encode_size(&self) -> usize {
        self.tx.encode_size() + self.approvals.encode_size()
    }
}

/// A notary's certificate that a transaction's inputs were unspent when the
/// transaction was certified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate<P: PublicKey> {
    /// The certified transaction.
    pub tx: TxId,
    /// The certifying notary.
    pub notary: P,
    /// Signature over the transaction identifier.
    pub signature: P::Signature,
}

impl<P: PublicKey> Certificate<P> {
    /// Signs a transaction identifier, producing a certificate.
    pub fn sign<S: Signer<PublicKey = P, Signature = P::Signature>>(
        namespace: &[u8],
        signer: &S,
        tx: TxId,
    ) -> Self {
        let namespace = notary_namespace(namespace);
        let signature = signer.sign(Some(&namespace), &tx);
        Self {
            tx,
            notary: signer.public_key(),
            signature,
        }
    }

    /// Verifies this certificate.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        let namespace = notary_namespace(namespace);
        self.notary.verify(Some(&namespace), &self.tx, &self.signature)
    }
}

impl<P: PublicKey> Write for Certificate<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.tx.write(buf);
        self.notary.write(buf);
        self.signature.write(buf);
    }
}

impl<P: PublicKey> Read for Certificate<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let tx = TxId::read(buf)?;
        let notary = P::read(buf)?;
        let signature = P::Signature::read(buf)?;
        Ok(Self {
            tx,
            notary,
            signature,
        })
    }
}

impl<P: PublicKey> EncodeSize for Certificate<P> {
    fn encode_size(&self) -> usize {
        self.tx.encode_size() + self.notary.encode_size() + self.signature.encode_size()
    }
}

/// A fully signed transaction together with its notary certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotarizedTransaction<P: PublicKey> {
    /// The signed transaction.
    pub signed: SignedTransaction<P>,
    /// The notary's certificate.
    pub certificate: Certificate<P>,
}

impl<P: PublicKey> NotarizedTransaction<P> {
    /// Verifies the full transaction: all required approvals present and
    /// valid, and the certificate issued over this transaction by its
    /// designated notary.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        if !self.signed.fully_signed() {
            return false;
        }
        if !self.signed.verify(namespace) {
            return false;
        }
        if self.certificate.tx != self.signed.tx.id() {
            return false;
        }
        if self.certificate.notary != self.signed.tx.notary {
            return false;
        }
        self.certificate.verify(namespace)
    }
}

impl<P: PublicKey> Digestible for NotarizedTransaction<P> {
    type Digest = TxId;

    fn digest(&self) -> TxId {
        self.signed.tx.id()
    }
}

impl<P: PublicKey> Write for NotarizedTransaction<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.signed.write(buf);
        self.certificate.write(buf);
    }
}

impl<P: PublicKey> Read for NotarizedTransaction<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let signed = SignedTransaction::<P>::read(buf)?;
        let certificate = Certificate::<P>::read(buf)?;
        Ok(Self {
            signed,
            certificate,
        })
    }
}

impl<P: PublicKey> EncodeSize for NotarizedTransaction<P> {
    fn encode_size(&self) -> usize {
        self.signed.encode_size() + self.certificate.encode_size()
    }
}

/// Reason a notary refused to certify a transaction.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NotaryError {
    /// An input was already consumed by a competing transaction.
    #[error("input {input} already consumed by {competing}")]
    Conflict {
        /// The contested input.
        input: InputRef,
        /// The transaction that consumed it first.
        competing: TxId,
    },
    /// The request was malformed (duplicate inputs or missing approvals).
    #[error("malformed request")]
    Malformed,
    /// The notary could not serve the request.
    #[error("notary unavailable")]
    Unavailable,
}

impl Write for NotaryError {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            NotaryError::Conflict { input, competing } => {
                0u8.write(buf);
                input.write(buf);
                competing.write(buf);
            }
            NotaryError::Malformed => 1u8.write(buf),
            NotaryError::Unavailable => 2u8.write(buf),
        }
    }
}

impl Read for NotaryError {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => {
                let input = InputRef::read(buf)?;
                let competing = TxId::read(buf)?;
                Ok(NotaryError::Conflict { input, competing })
            }
            1 => Ok(NotaryError::Malformed),
            2 => Ok(NotaryError::Unavailable),
            _ => Err(CodecError::Invalid("txflow::NotaryError", "Invalid type")),
        }
    }
}

impl EncodeSize for NotaryError {
    fn encode_size(&self) -> usize {
        1 + match self {
            NotaryError::Conflict { input, competing } => {
                input.encode_size() + competing.encode_size()
            }
            NotaryError::Malformed | NotaryError::Unavailable => 0,
        }
    }
}

/// A notary's reply to a certification request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotaryResponse<P: PublicKey> {
    /// The transaction was certified.
    Certificate(Certificate<P>),
    /// The transaction was refused.
    Rejection {
        /// The refused transaction.
        tx: TxId,
        /// Why it was refused.
        error: NotaryError,
    },
}

impl<P: PublicKey> NotaryResponse<P> {
    /// Returns the transaction this response refers to.
    pub fn tx(&self) -> TxId {
        match self {
            NotaryResponse::Certificate(certificate) => certificate.tx,
            NotaryResponse::Rejection { tx, .. } => *tx,
        }
    }
}

impl<P: PublicKey> Write for NotaryResponse<P> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            NotaryResponse::Certificate(certificate) => {
                0u8.write(buf);
                certificate.write(buf);
            }
            NotaryResponse::Rejection { tx, error } => {
                1u8.write(buf);
                tx.write(buf);
                error.write(buf);
            }
        }
    }
}

impl<P: PublicKey> Read for NotaryResponse<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(NotaryResponse::Certificate(Certificate::<P>::read(buf)?)),
            1 => {
                let tx = TxId::read(buf)?;
                let error = NotaryError::read(buf)?;
                Ok(NotaryResponse::Rejection { tx, error })
            }
            _ => Err(CodecError::Invalid("txflow::NotaryResponse", "Invalid type")),
        }
    }
}

impl<P: PublicKey> EncodeSize for NotaryResponse<P> {
    fn encode_size(&self) -> usize {
        1 + match self {
            NotaryResponse::Certificate(certificate) => certificate.encode_size(),
            NotaryResponse::Rejection { tx, error } => tx.encode_size() + error.encode_size(),
        }
    }
}

/// Discriminates session payload variants, for diagnostics on protocol
/// violations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// A partially signed transaction proposal.
    Proposal,
    /// Approvals over a previously received proposal.
    Approvals,
    /// A refusal to approve a proposal.
    Reject,
    /// A finalized transaction.
    Notarized,
    /// Receipt of a finalized transaction.
    Ack,
}

impl Display for PayloadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Proposal => write!(f, "proposal"),
            PayloadKind::Approvals => write!(f, "approvals"),
            PayloadKind::Reject => write!(f, "reject"),
            PayloadKind::Notarized => write!(f, "notarized"),
            PayloadKind::Ack => write!(f, "ack"),
        }
    }
}

/// Application payload carried over a session channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload<P: PublicKey> {
    /// A partially signed transaction, sent to a required signer.
    Proposal(SignedTransaction<P>),
    /// Approvals over the proposal received on this session.
    Approvals(Vec<Approval<P>>),
    /// A refusal to approve, with an opaque reason.
    Reject(Vec<u8>),
    /// A finalized transaction, distributed to a participant.
    Notarized(NotarizedTransaction<P>),
    /// Receipt of a finalized transaction.
    Ack(TxId),
}

impl<P: PublicKey> Payload<P> {
    /// Returns the kind of this payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Proposal(_) => PayloadKind::Proposal,
            Payload::Approvals(_) => PayloadKind::Approvals,
            Payload::Reject(_) => PayloadKind::Reject,
            Payload::Notarized(_) => PayloadKind::Notarized,
            Payload::Ack(_) => PayloadKind::Ack,
        }
    }
}

impl<P: PublicKey> Write for Payload<P> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Payload::Proposal(signed) => {
                0u8.write(buf);
                signed.write(buf);
            }
            Payload::Approvals(approvals) => {
                1u8.write(buf);
                approvals.write(buf);
            }
            Payload::Reject(reason) => {
                2u8.write(buf);
                reason.write(buf);
            }
            Payload::Notarized(notarized) => {
                3u8.write(buf);
                notarized.write(buf);
            }
            Payload::Ack(tx) => {
                4u8.write(buf);
                tx.write(buf);
            }
        }
    }
}

impl<P: PublicKey> Read for Payload<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Payload::Proposal(SignedTransaction::<P>::read(buf)?)),
            1 => Ok(Payload::Approvals(Vec::<Approval<P>>::read_range(
                buf,
                ..=MAX_APPROVALS,
            )?)),
            2 => Ok(Payload::Reject(Vec::<u8>::read_range(buf, ..=MAX_REASON)?)),
            3 => Ok(Payload::Notarized(NotarizedTransaction::<P>::read(buf)?)),
            4 => Ok(Payload::Ack(TxId::read(buf)?)),
            _ => Err(CodecError::Invalid("txflow::Payload", "Invalid type")),
        }
    }
}

impl<P: PublicKey> EncodeSize for Payload<P> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Payload::Proposal(signed) => signed.encode_size(),
            Payload::Approvals(approvals) => approvals.encode_size(),
            Payload::Reject(reason) => reason.encode_size(),
            Payload::Notarized(notarized) => notarized.encode_size(),
            Payload::Ack(tx) => tx.encode_size(),
        }
    }
}

/// Why a session was torn down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// The session identifier was already bound for this peer.
    Duplicate,
    /// The owning flow failed.
    Failed,
    /// The owning flow was canceled.
    Canceled,
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Duplicate => write!(f, "duplicate"),
            AbortReason::Failed => write!(f, "failed"),
            AbortReason::Canceled => write!(f, "canceled"),
        }
    }
}

impl Write for AbortReason {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            AbortReason::Duplicate => 0u8.write(buf),
            AbortReason::Failed => 1u8.write(buf),
            AbortReason::Canceled => 2u8.write(buf),
        }
    }
}

impl Read for AbortReason {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(AbortReason::Duplicate),
            1 => Ok(AbortReason::Failed),
            2 => Ok(AbortReason::Canceled),
            _ => Err(CodecError::Invalid("txflow::AbortReason", "Invalid type")),
        }
    }
}

impl EncodeSize for AbortReason {
    fn encode_size(&self) -> usize {
        1
    }
}

/// A message exchanged between schedulers on the session channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wire<P: PublicKey> {
    /// Opens a session: the receiver spawns a responder for `kind`, binds it
    /// to `session`, and delivers `payload` as the first inbound message.
    Open {
        /// Session identifier chosen by the initiator.
        session: SessionId,
        /// Flow type the responder should run.
        kind: FlowKind,
        /// First payload of the session (sequence zero).
        payload: Payload<P>,
    },
    /// Delivers an ordered payload on an established session.
    Data {
        /// The session this payload belongs to.
        session: SessionId,
        /// Per-session sequence number (the opening payload is zero).
        seq: u64,
        /// The application payload.
        payload: Payload<P>,
    },
    /// Tears down a session after a local failure or cancellation.
    Abort {
        /// The session being torn down.
        session: SessionId,
        /// Why the session was torn down.
        reason: AbortReason,
    },
}

impl<P: PublicKey> Wire<P> {
    /// Returns the session this message refers to.
    pub fn session(&self) -> SessionId {
        match self {
            Wire::Open { session, .. } => *session,
            Wire::Data { session, .. } => *session,
            Wire::Abort { session, .. } => *session,
        }
    }
}

impl<P: PublicKey> Write for Wire<P> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Wire::Open {
                session,
                kind,
                payload,
            } => {
                0u8.write(buf);
                session.write(buf);
                kind.write(buf);
                payload.write(buf);
            }
            Wire::Data {
                session,
                seq,
                payload,
            } => {
                1u8.write(buf);
                session.write(buf);
                UInt(*seq).write(buf);
                payload.write(buf);
            }
            Wire::Abort { session, reason } => {
                2u8.write(buf);
                session.write(buf);
                reason.write(buf);
            }
        }
    }
}

impl<P: PublicKey> Read for Wire<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => {
                let session = SessionId::read(buf)?;
                let kind = FlowKind::read(buf)?;
                let payload = Payload::<P>::read(buf)?;
                Ok(Wire::Open {
                    session,
                    kind,
                    payload,
                })
            }
            1 => {
                let session = SessionId::read(buf)?;
                let seq: u64 = UInt::read(buf)?.into();
                let payload = Payload::<P>::read(buf)?;
                Ok(Wire::Data {
                    session,
                    seq,
                    payload,
                })
            }
            2 => {
                let session = SessionId::read(buf)?;
                let reason = AbortReason::read(buf)?;
                Ok(Wire::Abort { session, reason })
            }
            _ => Err(CodecError::Invalid("txflow::Wire", "Invalid type")),
        }
    }
}

impl<P: PublicKey> EncodeSize for Wire<P> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Wire::Open {
                session,
                kind,
                payload,
            } => session.encode_size() + kind.encode_size() + payload.encode_size(),
            Wire::Data {
                session,
                seq,
                payload,
            } => session.encode_size() + UInt(*seq).encode_size() + payload.encode_size(),
            Wire::Abort { session, reason } => session.encode_size() + reason.encode_size(),
        }
    }
}

/// Terminal result of a flow, delivered through its handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<P: PublicKey> {
    /// Signature collection completed with every required approval.
    Signed(SignedTransaction<P>),
    /// The transaction was notarized, committed, and distributed.
    Notarized(NotarizedTransaction<P>),
    /// A responder refused to approve a proposal.
    Rejected {
        /// The refused transaction.
        tx: TxId,
        /// Opaque reason provided by the application.
        reason: Vec<u8>,
    },
    /// A responder committed a finalized transaction and acknowledged it.
    Acked(TxId),
}

impl<P: PublicKey> Outcome<P> {
    /// Returns the transaction this outcome refers to.
    pub fn tx(&self) -> TxId {
        match self {
            Outcome::Signed(signed) => signed.tx.id(),
            Outcome::Notarized(notarized) => notarized.signed.tx.id(),
            Outcome::Rejected { tx, .. } => *tx,
            Outcome::Acked(tx) => *tx,
        }
    }
}

/// What a suspended flow is waiting for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Waiting {
    /// Ready to run (freshly started or resumed after restart).
    Ready,
    /// Waiting for the next payload on one of the flow's sessions.
    Sessions,
    /// Waiting for the designated notary's response.
    Notary,
    /// Waiting for an invoked subflow to finish.
    SubFlow,
}

impl Write for Waiting {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Waiting::Ready => 0u8.write(buf),
            Waiting::Sessions => 1u8.write(buf),
            Waiting::Notary => 2u8.write(buf),
            Waiting::SubFlow => 3u8.write(buf),
        }
    }
}

impl Read for Waiting {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Waiting::Ready),
            1 => Ok(Waiting::Sessions),
            2 => Ok(Waiting::Notary),
            3 => Ok(Waiting::SubFlow),
            _ => Err(CodecError::Invalid("txflow::Waiting", "Invalid type")),
        }
    }
}

impl EncodeSize for Waiting {
    fn encode_size(&self) -> usize {
        1
    }
}

/// Durable record of one session channel, carried in a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState<P: PublicKey> {
    /// The session identifier.
    pub id: SessionId,
    /// The counterparty on the far end.
    pub peer: P,
    /// True if this end was opened by the peer.
    pub inbound: bool,
    /// Sequence number of the next payload to send.
    pub next_send: u64,
    /// Sequence number of the next payload expected.
    pub next_recv: u64,
}

impl<P: PublicKey> Write for SessionState<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.id.write(buf);
        self.peer.write(buf);
        self.inbound.write(buf);
        UInt(self.next_send).write(buf);
        UInt(self.next_recv).write(buf);
    }
}

impl<P: PublicKey> Read for SessionState<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let id = SessionId::read(buf)?;
        let peer = P::read(buf)?;
        let inbound = bool::read(buf)?;
        let next_send: u64 = UInt::read(buf)?.into();
        let next_recv: u64 = UInt::read(buf)?.into();
        Ok(Self {
            id,
            peer,
            inbound,
            next_send,
            next_recv,
        })
    }
}

impl<P: PublicKey> EncodeSize for SessionState<P> {
    fn encode_size(&self) -> usize {
        self.id.encode_size()
            + self.peer.encode_size()
            + 1
            + UInt(self.next_send).encode_size()
            + UInt(self.next_recv).encode_size()
    }
}

/// Durable snapshot of a suspended flow, written after every step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint<P: PublicKey> {
    /// The flow this checkpoint belongs to.
    pub flow: FlowId,
    /// The flow's registered type.
    pub kind: FlowKind,
    /// The parent flow, if this flow was spawned as a subflow.
    pub parent: Option<FlowId>,
    /// What the flow is waiting for.
    pub waiting: Waiting,
    /// Opaque serialized flow state.
    pub state: Vec<u8>,
    /// Live sessions owned by the flow.
    pub sessions: Vec<SessionState<P>>,
}

impl<P: PublicKey> Write for Checkpoint<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.flow.write(buf);
        self.kind.write(buf);
        match &self.parent {
            Some(parent) => {
                1u8.write(buf);
                parent.write(buf);
            }
            None => 0u8.write(buf),
        }
        self.waiting.write(buf);
        self.state.write(buf);
        self.sessions.write(buf);
    }
}

impl<P: PublicKey> Read for Checkpoint<P> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let flow = FlowId::read(buf)?;
        let kind = FlowKind::read(buf)?;
        let parent = match u8::read(buf)? {
            0 => None,
            1 => Some(FlowId::read(buf)?),
            _ => return Err(CodecError::Invalid("txflow::Checkpoint", "Invalid parent")),
        };
        let waiting = Waiting::read(buf)?;
        let state = Vec::<u8>::read_range(buf, ..=MAX_SNAPSHOT)?;
        let sessions = Vec::<SessionState<P>>::read_range(buf, ..=MAX_SESSIONS)?;
        Ok(Self {
            flow,
            kind,
            parent,
            waiting,
            state,
            sessions,
        })
    }
}

impl<P: PublicKey> EncodeSize for Checkpoint<P> {
    fn encode_size(&self) -> usize {
        self.flow.encode_size()
            + self.kind.encode_size()
            + 1
            + self.parent.as_ref().map_or(0, |parent| parent.encode_size())
            + self.waiting.encode_size()
            + self.state.encode_size()
            + self.sessions.encode_size()
    }
}
