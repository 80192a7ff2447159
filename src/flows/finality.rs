//! Notarization and distribution.
//!
//! The initiator checks that the transaction carries every required approval,
//! returns the prior result if the ledger already holds the id, and otherwise
//! submits the transaction to its designated notary. A certificate is
//! committed locally and then distributed to every participant, one session
//! each; the flow finishes when all participants have acknowledged. A notary
//! conflict fails the flow before anything is committed or broadcast.
//!
//! The responder verifies the certificate and the full approval set
//! independently before committing and acknowledging.

use super::{Effect, Flow, Input, Services, Step, FINALIZE};
use crate::{
    types::{
        NotarizedTransaction, NotaryError, NotaryResponse, Outcome, Payload, PayloadKind,
        SessionId, SignedTransaction, Waiting, MAX_SESSIONS,
    },
    Directory, Error, Ledger,
};
use bytes::BytesMut;
use commonware_codec::{
    varint::UInt, Error as CodecError, Read, ReadExt, Write,
};
use commonware_cryptography::PublicKey;
use std::collections::BTreeSet;

const ROLE_INITIATOR: u8 = 0;
const ROLE_RESPONDER: u8 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    /// Validation and idempotence check pending.
    Init,
    /// Notary request outstanding.
    Notarizing,
    /// Distribution in progress, acks outstanding.
    Broadcasting,
}

impl Phase {
    fn tag(self) -> u8 {
        match self {
            Phase::Init => 0,
            Phase::Notarizing => 1,
            Phase::Broadcasting => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Phase::Init),
            1 => Ok(Phase::Notarizing),
            2 => Ok(Phase::Broadcasting),
            _ => Err(CodecError::Invalid("txflow::finality", "Invalid phase")),
        }
    }
}

/// Initiating side of finalization.
pub struct Initiator<P: PublicKey, D: Directory<P>, L: Ledger<P>> {
    namespace: Vec<u8>,
    me: P,
    directory: D,
    ledger: L,

    signed: SignedTransaction<P>,
    phase: Phase,
    notarized: Option<NotarizedTransaction<P>>,
    pending: Vec<(SessionId, P)>,
    next_session: u64,
}

impl<P: PublicKey, D: Directory<P>, L: Ledger<P>> Initiator<P, D, L> {
    /// Creates an initiator for `signed`, allocating session ids from `seed`.
    pub fn new<V, T>(
        services: &Services<P, D, V, T, L>,
        signed: SignedTransaction<P>,
        seed: u64,
    ) -> Self {
        Self {
            namespace: services.namespace.clone(),
            me: services.me.clone(),
            directory: services.directory.clone(),
            ledger: services.ledger.clone(),
            signed,
            phase: Phase::Init,
            notarized: None,
            pending: Vec::new(),
            next_session: seed,
        }
    }

    fn allocate(&mut self) -> SessionId {
        let session = SessionId::new(self.next_session);
        self.next_session = self.next_session.wrapping_add(1);
        session
    }

    /// Validates the approval set and checks for a prior commit.
    fn begin(&mut self) -> Result<Step<P>, Error> {
        if !self.signed.fully_signed() {
            return Err(Error::IncompleteSignatures);
        }
        let required = self.signed.tx.required_signers();
        for approval in &self.signed.approvals {
            if !required.contains(&approval.signer)
                || !approval.verify(&self.namespace, &self.signed.tx)
            {
                return Err(Error::InvalidSignature(approval.signer.to_string()));
            }
        }

        // Already committed: return the prior result without contacting the
        // notary.
        if let Some(prior) = self.ledger.get(&self.signed.tx.id()) {
            return Ok(Step::done(Outcome::Notarized(prior)));
        }

        self.phase = Phase::Notarizing;
        Ok(Step::apply(
            vec![Effect::Notarize(self.signed.clone())],
            Waiting::Notary,
        ))
    }

    /// Commits the certified transaction and opens distribution sessions.
    fn distribute(&mut self, notarized: NotarizedTransaction<P>) -> Result<Step<P>, Error> {
        self.ledger.commit(notarized.clone());

        // Every participant must resolve before any session is opened.
        let mut peers = BTreeSet::new();
        for participant in notarized.signed.tx.participants() {
            let party = self
                .directory
                .resolve(&participant)
                .ok_or_else(|| Error::UnknownParty(participant.to_string()))?;
            if party != self.me {
                peers.insert(party);
            }
        }

        self.notarized = Some(notarized.clone());
        if peers.is_empty() {
            return Ok(Step::done(Outcome::Notarized(notarized)));
        }

        let mut effects = Vec::with_capacity(peers.len());
        for peer in peers {
            let session = self.allocate();
            self.pending.push((session, peer.clone()));
            effects.push(Effect::Open {
                session,
                peer,
                kind: FINALIZE,
                payload: Payload::Notarized(notarized.clone()),
            });
        }
        self.phase = Phase::Broadcasting;
        Ok(Step::apply(effects, Waiting::Sessions))
    }
}

impl<P: PublicKey, D: Directory<P>, L: Ledger<P>> Flow<P> for Initiator<P, D, L> {
    fn step(&mut self, input: Input<P>) -> Result<Step<P>, Error> {
        match input {
            Input::Start => self.begin(),
            Input::Resume => match self.phase {
                Phase::Init => self.begin(),
                // Requests are idempotent by transaction id, so an in-flight
                // request is simply re-issued.
                Phase::Notarizing => Ok(Step::apply(
                    vec![Effect::Notarize(self.signed.clone())],
                    Waiting::Notary,
                )),
                Phase::Broadcasting => Ok(Step::wait(Waiting::Sessions)),
            },
            Input::Notary(response) => {
                if self.phase != Phase::Notarizing {
                    return Err(Error::UnexpectedInput);
                }
                match response {
                    NotaryResponse::Certificate(certificate) => {
                        if certificate.tx != self.signed.tx.id()
                            || certificate.notary != self.signed.tx.notary
                            || !certificate.verify(&self.namespace)
                        {
                            return Err(Error::InvalidSignature(
                                certificate.notary.to_string(),
                            ));
                        }
                        let notarized = NotarizedTransaction {
                            signed: self.signed.clone(),
                            certificate,
                        };
                        self.distribute(notarized)
                    }
                    NotaryResponse::Rejection { error, .. } => match error {
                        NotaryError::Conflict { input, competing } => {
                            Err(Error::NotaryConflict { input, competing })
                        }
                        other => Err(Error::NotaryRejected(other)),
                    },
                }
            }
            Input::Message { session, payload } => {
                if self.phase != Phase::Broadcasting {
                    return Err(Error::UnexpectedInput);
                }
                let Some(position) = self.pending.iter().position(|(id, _)| *id == session)
                else {
                    return Err(Error::UnexpectedInput);
                };
                match payload {
                    Payload::Ack(tx) => {
                        if tx != self.signed.tx.id() {
                            return Err(Error::UnexpectedInput);
                        }
                        self.pending.remove(position);
                        if self.pending.is_empty() {
                            let notarized = self
                                .notarized
                                .clone()
                                .ok_or(Error::UnexpectedInput)?;
                            Ok(Step::done(Outcome::Notarized(notarized)))
                        } else {
                            Ok(Step::wait(Waiting::Sessions))
                        }
                    }
                    other => Err(Error::UnexpectedPayload {
                        expected: PayloadKind::Ack,
                        got: other.kind(),
                    }),
                }
            }
            Input::SessionFailed { session } => Err(Error::SessionClosed(session)),
            Input::SubFlow(_) => Err(Error::UnexpectedInput),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ROLE_INITIATOR.write(&mut buf);
        self.phase.tag().write(&mut buf);
        self.signed.write(&mut buf);
        match &self.notarized {
            Some(notarized) => {
                1u8.write(&mut buf);
                notarized.write(&mut buf);
            }
            None => 0u8.write(&mut buf),
        }
        UInt(self.pending.len() as u64).write(&mut buf);
        for (session, peer) in &self.pending {
            session.write(&mut buf);
            peer.write(&mut buf);
        }
        UInt(self.next_session).write(&mut buf);
        buf.to_vec()
    }
}

/// Responding side of finalization.
pub struct Responder<P: PublicKey, L: Ledger<P>> {
    namespace: Vec<u8>,
    ledger: L,
    done: bool,

    _marker: std::marker::PhantomData<P>,
}

impl<P: PublicKey, L: Ledger<P>> Responder<P, L> {
    /// Creates a responder.
    pub fn new<D, V, T>(services: &Services<P, D, V, T, L>) -> Self {
        Self {
            namespace: services.namespace.clone(),
            ledger: services.ledger.clone(),
            done: false,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<P: PublicKey, L: Ledger<P>> Flow<P> for Responder<P, L> {
    fn step(&mut self, input: Input<P>) -> Result<Step<P>, Error> {
        match input {
            Input::Message { session, payload } => {
                if self.done {
                    return Err(Error::UnexpectedInput);
                }
                let Payload::Notarized(notarized) = payload else {
                    return Err(Error::UnexpectedPayload {
                        expected: PayloadKind::Notarized,
                        got: payload.kind(),
                    });
                };

                // Trust nothing: the certificate and the full approval set
                // are verified independently of the sender.
                if !notarized.verify(&self.namespace) {
                    return Err(Error::InvalidSignature(
                        notarized.certificate.notary.to_string(),
                    ));
                }
                let tx = notarized.signed.tx.id();
                self.ledger.commit(notarized);
                self.done = true;
                Ok(Step::finish(
                    vec![Effect::Send {
                        session,
                        payload: Payload::Ack(tx),
                    }],
                    Outcome::Acked(tx),
                ))
            }
            Input::Resume => {
                if self.done {
                    Err(Error::UnexpectedInput)
                } else {
                    Ok(Step::wait(Waiting::Sessions))
                }
            }
            Input::SessionFailed { session } => Err(Error::SessionClosed(session)),
            Input::Start | Input::Notary(_) | Input::SubFlow(_) => Err(Error::UnexpectedInput),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ROLE_RESPONDER.write(&mut buf);
        self.done.write(&mut buf);
        buf.to_vec()
    }
}

/// Rebuilds either side of the protocol from a checkpointed snapshot.
pub fn restore<P, D, V, T, L>(
    services: &Services<P, D, V, T, L>,
    snapshot: &[u8],
) -> Result<Box<dyn Flow<P>>, Error>
where
    P: PublicKey,
    D: Directory<P>,
    L: Ledger<P>,
{
    let mut buf = snapshot;
    match u8::read(&mut buf).map_err(Error::InvalidSnapshot)? {
        ROLE_INITIATOR => {
            let phase = Phase::from_tag(u8::read(&mut buf).map_err(Error::InvalidSnapshot)?)
                .map_err(Error::InvalidSnapshot)?;
            let signed =
                SignedTransaction::<P>::read(&mut buf).map_err(Error::InvalidSnapshot)?;
            let notarized = match u8::read(&mut buf).map_err(Error::InvalidSnapshot)? {
                0 => None,
                1 => Some(
                    NotarizedTransaction::<P>::read(&mut buf).map_err(Error::InvalidSnapshot)?,
                ),
                _ => {
                    return Err(Error::InvalidSnapshot(CodecError::Invalid(
                        "txflow::finality",
                        "Invalid notarized",
                    )))
                }
            };
            let len: u64 = UInt::read(&mut buf)
                .map_err(Error::InvalidSnapshot)?
                .into();
            if len as usize > MAX_SESSIONS {
                return Err(Error::InvalidSnapshot(CodecError::Invalid(
                    "txflow::finality",
                    "Too many sessions",
                )));
            }
            let mut pending = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let session = SessionId::read(&mut buf).map_err(Error::InvalidSnapshot)?;
                let peer = P::read(&mut buf).map_err(Error::InvalidSnapshot)?;
                pending.push((session, peer));
            }
            let next_session: u64 = UInt::read(&mut buf)
                .map_err(Error::InvalidSnapshot)?
                .into();
            Ok(Box::new(Initiator {
                namespace: services.namespace.clone(),
                me: services.me.clone(),
                directory: services.directory.clone(),
                ledger: services.ledger.clone(),
                signed,
                phase,
                notarized,
                pending,
                next_session,
            }))
        }
        ROLE_RESPONDER => {
            let done = bool::read(&mut buf).map_err(Error::InvalidSnapshot)?;
            let mut responder = Responder::new(services);
            responder.done = done;
            Ok(Box::new(responder))
        }
        _ => Err(Error::InvalidSnapshot(CodecError::Invalid(
            "txflow::finality",
            "Invalid role",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{super::Status, *};
    use crate::{
        mocks,
        types::{Approval, Certificate},
    };
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        PrivateKeyExt as _, Signer as _,
    };

    const NAMESPACE: &[u8] = b"test";

    fn services(
        me: u64,
        parties: &[PublicKey],
    ) -> Services<PublicKey, mocks::Directory, mocks::Verifier, mocks::Vault, mocks::Ledger> {
        Services {
            namespace: NAMESPACE.to_vec(),
            me: PrivateKey::from_seed(me).public_key(),
            directory: mocks::Directory::new(parties.to_vec()),
            verifier: mocks::Verifier::accepting(),
            vault: mocks::Vault::new(Vec::new()),
            ledger: mocks::Ledger::new(),
        }
    }

    fn signed_tx(keys: &[PrivateKey], notary: &PrivateKey) -> SignedTransaction<PublicKey> {
        let publics: Vec<_> = keys.iter().map(|key| key.public_key()).collect();
        let tx = mocks::transaction(&publics, notary.public_key());
        let mut signed = SignedTransaction::new(tx.clone());
        for key in keys {
            signed.add(Approval::sign(NAMESPACE, key, &tx));
        }
        signed
    }

    #[test]
    fn test_incomplete_signatures() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9);
        let mut signed = signed_tx(&[me.clone(), alice.clone()], &notary);
        signed.approvals.pop();

        let services = services(0, &[me.public_key(), alice.public_key()]);
        let mut initiator = Initiator::new(&services, signed, 100);
        assert!(matches!(
            initiator.step(Input::Start),
            Err(Error::IncompleteSignatures)
        ));
    }

    #[test]
    fn test_notarize_and_distribute() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9);
        let signed = signed_tx(&[me.clone(), alice.clone()], &notary);
        let id = signed.tx.id();

        let services = services(0, &[me.public_key(), alice.public_key()]);
        let mut initiator = Initiator::new(&services, signed, 100);

        let step = initiator.step(Input::Start).unwrap();
        assert!(matches!(step.effects[0], Effect::Notarize(_)));
        assert!(matches!(step.status, Status::Await(Waiting::Notary)));

        let certificate = Certificate::sign(NAMESPACE, &notary, id);
        let step = initiator
            .step(Input::Notary(NotaryResponse::Certificate(certificate)))
            .unwrap();

        // Committed locally before distribution.
        assert!(services.ledger.get(&id).is_some());
        assert_eq!(step.effects.len(), 1);
        let Effect::Open {
            session, payload, ..
        } = &step.effects[0]
        else {
            panic!("expected open");
        };
        assert!(matches!(payload, Payload::Notarized(_)));

        let step = initiator
            .step(Input::Message {
                session: *session,
                payload: Payload::Ack(id),
            })
            .unwrap();
        let Status::Done(Outcome::Notarized(notarized)) = step.status else {
            panic!("expected notarized outcome");
        };
        assert_eq!(notarized.signed.tx.id(), id);
    }

    #[test]
    fn test_idempotent_finalize() {
        let me = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9);
        let signed = signed_tx(&[me.clone()], &notary);
        let id = signed.tx.id();

        let services = services(0, &[me.public_key()]);
        let prior = NotarizedTransaction {
            signed: signed.clone(),
            certificate: Certificate::sign(NAMESPACE, &notary, id),
        };
        services.ledger.commit(prior.clone());

        // The notary is never contacted and no session is opened.
        let mut initiator = Initiator::new(&services, signed, 100);
        let step = initiator.step(Input::Start).unwrap();
        assert!(step.effects.is_empty());
        let Status::Done(Outcome::Notarized(notarized)) = step.status else {
            panic!("expected notarized outcome");
        };
        assert_eq!(notarized, prior);
    }

    #[test]
    fn test_conflict_no_commit() {
        let me = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9);
        let signed = signed_tx(&[me.clone()], &notary);
        let id = signed.tx.id();
        let input = signed.tx.inputs[0];

        let services = services(0, &[me.public_key()]);
        let mut initiator = Initiator::new(&services, signed, 100);
        initiator.step(Input::Start).unwrap();

        let competing = commonware_cryptography::sha256::hash(b"competing");
        let result = initiator.step(Input::Notary(NotaryResponse::Rejection {
            tx: id,
            error: NotaryError::Conflict { input, competing },
        }));
        assert!(matches!(
            result,
            Err(Error::NotaryConflict { competing: c, .. }) if c == competing
        ));
        assert!(services.ledger.get(&id).is_none());
    }

    #[test]
    fn test_unknown_participant() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9);
        let signed = signed_tx(&[me.clone(), alice.clone()], &notary);
        let id = signed.tx.id();

        // Alice signs but is not in the directory.
        let services = services(0, &[me.public_key()]);
        let mut initiator = Initiator::new(&services, signed, 100);
        initiator.step(Input::Start).unwrap();

        let certificate = Certificate::sign(NAMESPACE, &notary, id);
        let result = initiator.step(Input::Notary(NotaryResponse::Certificate(certificate)));
        assert!(matches!(result, Err(Error::UnknownParty(_))));
    }

    #[test]
    fn test_resume_reissues_notarize() {
        let me = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9);
        let signed = signed_tx(&[me.clone()], &notary);

        let services = services(0, &[me.public_key()]);
        let mut initiator = Initiator::new(&services, signed, 100);
        initiator.step(Input::Start).unwrap();

        // Restore mid-request: the request is re-issued.
        let snapshot = initiator.snapshot();
        let mut restored = restore(&services, &snapshot).unwrap();
        let step = restored.step(Input::Resume).unwrap();
        assert!(matches!(step.effects[0], Effect::Notarize(_)));
        assert!(matches!(step.status, Status::Await(Waiting::Notary)));
    }

    #[test]
    fn test_responder_commits_and_acks() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9);
        let signed = signed_tx(&[me.clone(), alice.clone()], &notary);
        let id = signed.tx.id();
        let notarized = NotarizedTransaction {
            signed,
            certificate: Certificate::sign(NAMESPACE, &notary, id),
        };

        let services = services(1, &[me.public_key(), alice.public_key()]);
        let mut responder = Responder::new(&services);
        let step = responder
            .step(Input::Message {
                session: SessionId::new(5),
                payload: Payload::Notarized(notarized),
            })
            .unwrap();
        assert!(services.ledger.get(&id).is_some());
        let Effect::Send { payload, .. } = &step.effects[0] else {
            panic!("expected send");
        };
        assert!(matches!(payload, Payload::Ack(tx) if *tx == id));
        assert!(matches!(step.status, Status::Done(Outcome::Acked(_))));
    }

    #[test]
    fn test_responder_rejects_forged_certificate() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9);
        let signed = signed_tx(&[me.clone(), alice.clone()], &notary);
        let id = signed.tx.id();

        // Certificate signed by a key that is not the designated notary.
        let notarized = NotarizedTransaction {
            signed,
            certificate: Certificate::sign(NAMESPACE, &alice, id),
        };

        let services = services(1, &[me.public_key(), alice.public_key()]);
        let mut responder = Responder::new(&services);
        let result = responder.step(Input::Message {
            session: SessionId::new(5),
            payload: Payload::Notarized(notarized),
        });
        assert!(matches!(result, Err(Error::InvalidSignature(_))));
        assert!(services.ledger.get(&id).is_none());
    }
}
