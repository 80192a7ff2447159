//! Signature collection.
//!
//! The initiator must already carry its own approval. Counterparties are the
//! well-known identities of the remaining required signers, contacted one at
//! a time: open a session, send the proposal, await approvals. A rejection
//! from any counterparty fails the whole flow immediately and no further
//! sessions are opened.
//!
//! The responder resolves the proposal's inputs against the local ledger,
//! runs the application predicate, and either replies with approvals from
//! every controlled required key or sends back the rejection reason.

use super::{Effect, Flow, Input, Services, Step, COLLECT};
use crate::{
    types::{
        Approval, Outcome, Payload, PayloadKind, SessionId, SignedTransaction, Waiting,
        MAX_APPROVALS,
    },
    Directory, Error, Ledger, Vault, Verifier,
};
use bytes::BytesMut;
use commonware_codec::{
    varint::UInt, Error as CodecError, Read, ReadExt, ReadRangeExt, Write,
};
use commonware_cryptography::PublicKey;
use std::collections::BTreeSet;

const ROLE_INITIATOR: u8 = 0;
const ROLE_RESPONDER: u8 = 1;

/// Initiating side of signature collection.
pub struct Initiator<P: PublicKey, D: Directory<P>> {
    namespace: Vec<u8>,
    me: P,
    directory: D,

    signed: SignedTransaction<P>,
    started: bool,
    remaining: Vec<P>,
    current: Option<(SessionId, P)>,
    next_session: u64,
}

impl<P: PublicKey, D: Directory<P>> Initiator<P, D> {
    /// Creates an initiator for `signed`, allocating session ids from `seed`.
    pub fn new<V, T, L>(
        services: &Services<P, D, V, T, L>,
        signed: SignedTransaction<P>,
        seed: u64,
    ) -> Self {
        Self {
            namespace: services.namespace.clone(),
            me: services.me.clone(),
            directory: services.directory.clone(),
            signed,
            started: false,
            remaining: Vec::new(),
            current: None,
            next_session: seed,
        }
    }

    fn allocate(&mut self) -> SessionId {
        let session = SessionId::new(self.next_session);
        self.next_session = self.next_session.wrapping_add(1);
        session
    }

    /// Resolves counterparties and validates the initiator's own approval.
    fn begin(&mut self) -> Result<Step<P>, Error> {
        let required = self.signed.tx.required_signers();
        let mut counterparties = BTreeSet::new();
        let mut mine = BTreeSet::new();
        for signer in &required {
            let party = self
                .directory
                .resolve(signer)
                .ok_or_else(|| Error::UnknownParty(signer.to_string()))?;
            if party == self.me {
                mine.insert(signer.clone());
            } else {
                counterparties.insert(party);
            }
        }

        let signed = self.signed.signers();
        if mine.iter().any(|signer| !signed.contains(signer)) {
            return Err(Error::InitiatorSignatureMissing);
        }

        self.started = true;
        self.remaining = counterparties.into_iter().collect();
        self.advance()
    }

    /// Opens a session to the next counterparty, or finishes.
    fn advance(&mut self) -> Result<Step<P>, Error> {
        if self.remaining.is_empty() {
            if !self.signed.fully_signed() {
                return Err(Error::IncompleteSignatures);
            }
            return Ok(Step::done(Outcome::Signed(self.signed.clone())));
        }
        let peer = self.remaining.remove(0);
        let session = self.allocate();
        self.current = Some((session, peer.clone()));
        Ok(Step::apply(
            vec![Effect::Open {
                session,
                peer,
                kind: COLLECT,
                payload: Payload::Proposal(self.signed.clone()),
            }],
            Waiting::Sessions,
        ))
    }

    /// Folds a counterparty's approvals into the proposal.
    fn fold(&mut self, peer: &P, approvals: Vec<Approval<P>>) -> Result<(), Error> {
        let required = self.signed.tx.required_signers();
        for approval in approvals {
            if !required.contains(&approval.signer) {
                return Err(Error::InvalidSignature(approval.signer.to_string()));
            }
            if !approval.verify(&self.namespace, &self.signed.tx) {
                return Err(Error::InvalidSignature(approval.signer.to_string()));
            }
            let signer = approval.signer.clone();
            if !self.signed.add(approval) {
                return Err(Error::SignerCollision(signer.to_string()));
            }
        }

        // The counterparty must cover every required key it is known for.
        let signed = self.signed.signers();
        for signer in &required {
            if self.directory.resolve(signer).as_ref() == Some(peer) && !signed.contains(signer) {
                return Err(Error::IncompleteSignatures);
            }
        }
        Ok(())
    }
}

impl<P: PublicKey, D: Directory<P>> Flow<P> for Initiator<P, D> {
    fn step(&mut self, input: Input<P>) -> Result<Step<P>, Error> {
        match input {
            Input::Start => self.begin(),
            Input::Resume => {
                if self.started {
                    Ok(Step::wait(Waiting::Sessions))
                } else {
                    self.begin()
                }
            }
            Input::Message { session, payload } => {
                let Some((current, peer)) = self.current.clone() else {
                    return Err(Error::UnexpectedInput);
                };
                if session != current {
                    return Err(Error::UnexpectedInput);
                }
                match payload {
                    Payload::Approvals(approvals) => {
                        self.fold(&peer, approvals)?;
                        self.current = None;
                        self.advance()
                    }
                    Payload::Reject(reason) => Err(Error::SignatureRejected { reason }),
                    other => Err(Error::UnexpectedPayload {
                        expected: PayloadKind::Approvals,
                        got: other.kind(),
                    }),
                }
            }
            Input::SessionFailed { session } => Err(Error::SessionClosed(session)),
            Input::Notary(_) | Input::SubFlow(_) => Err(Error::UnexpectedInput),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ROLE_INITIATOR.write(&mut buf);
        self.started.write(&mut buf);
        self.signed.write(&mut buf);
        self.remaining.write(&mut buf);
        match &self.current {
            Some((session, peer)) => {
                1u8.write(&mut buf);
                session.write(&mut buf);
                peer.write(&mut buf);
            }
            None => 0u8.write(&mut buf),
        }
        UInt(self.next_session).write(&mut buf);
        buf.to_vec()
    }
}

/// Responding side of signature collection.
pub struct Responder<P: PublicKey, V: Verifier<P>, T: Vault<P>, L: Ledger<P>> {
    namespace: Vec<u8>,
    verifier: V,
    vault: T,
    ledger: L,
    done: bool,

    _marker: std::marker::PhantomData<P>,
}

impl<P: PublicKey, V: Verifier<P>, T: Vault<P>, L: Ledger<P>> Responder<P, V, T, L> {
    /// Creates a responder.
    pub fn new<D>(services: &Services<P, D, V, T, L>) -> Self {
        Self {
            namespace: services.namespace.clone(),
            verifier: services.verifier.clone(),
            vault: services.vault.clone(),
            ledger: services.ledger.clone(),
            done: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Checks a proposal, returning the rejection reason if it fails.
    fn check(&self, signed: &SignedTransaction<P>) -> Result<(), Vec<u8>> {
        if !signed.tx.distinct_inputs() {
            return Err(b"duplicate inputs".to_vec());
        }
        if !signed.verify(&self.namespace) {
            return Err(b"invalid approvals".to_vec());
        }
        let mut resolved = Vec::with_capacity(signed.tx.inputs.len());
        for input in &signed.tx.inputs {
            match self.ledger.resolve(input) {
                Some(output) => resolved.push(output),
                None => return Err(format!("unknown input {input}").into_bytes()),
            }
        }
        self.verifier.verify(&signed.tx, &resolved)
    }
}

impl<P: PublicKey, V: Verifier<P>, T: Vault<P>, L: Ledger<P>> Flow<P> for Responder<P, V, T, L> {
    fn step(&mut self, input: Input<P>) -> Result<Step<P>, Error> {
        match input {
            Input::Message { session, payload } => {
                if self.done {
                    return Err(Error::UnexpectedInput);
                }
                let Payload::Proposal(mut signed) = payload else {
                    return Err(Error::UnexpectedPayload {
                        expected: PayloadKind::Proposal,
                        got: payload.kind(),
                    });
                };
                let tx = signed.tx.id();
                if let Err(reason) = self.check(&signed) {
                    self.done = true;
                    return Ok(Step::finish(
                        vec![Effect::Send {
                            session,
                            payload: Payload::Reject(reason.clone()),
                        }],
                        Outcome::Rejected { tx, reason },
                    ));
                }

                let required = signed.tx.required_signers();
                let approvals = self.vault.approve(&self.namespace, &signed.tx, &required);
                for approval in &approvals {
                    signed.add(approval.clone());
                }
                self.done = true;
                Ok(Step::finish(
                    vec![Effect::Send {
                        session,
                        payload: Payload::Approvals(approvals),
                    }],
                    Outcome::Signed(signed),
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
    V: Verifier<P>,
    T: Vault<P>,
    L: Ledger<P>,
{
    let mut buf = snapshot;
    match u8::read(&mut buf).map_err(Error::InvalidSnapshot)? {
        ROLE_INITIATOR => {
            let started = bool::read(&mut buf).map_err(Error::InvalidSnapshot)?;
            let signed =
                SignedTransaction::<P>::read(&mut buf).map_err(Error::InvalidSnapshot)?;
            // Counterparties are bounded by the required signer set, not by
            // the parties of a single command.
            let remaining = Vec::<P>::read_range(&mut buf, ..=MAX_APPROVALS)
                .map_err(Error::InvalidSnapshot)?;
            let current = match u8::read(&mut buf).map_err(Error::InvalidSnapshot)? {
                0 => None,
                1 => {
                    let session = SessionId::read(&mut buf).map_err(Error::InvalidSnapshot)?;
                    let peer = P::read(&mut buf).map_err(Error::InvalidSnapshot)?;
                    Some((session, peer))
                }
                _ => {
                    return Err(Error::InvalidSnapshot(CodecError::Invalid(
                        "txflow::collect",
                        "Invalid current",
                    )))
                }
            };
            let next_session: u64 = UInt::read(&mut buf)
                .map_err(Error::InvalidSnapshot)?
                .into();
            Ok(Box::new(Initiator {
                namespace: services.namespace.clone(),
                me: services.me.clone(),
                directory: services.directory.clone(),
                signed,
                started,
                remaining,
                current,
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
            "txflow::collect",
            "Invalid role",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{super::Status, *};
    use crate::{mocks, types::Command};
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        PrivateKeyExt as _, Signer as _,
    };

    const NAMESPACE: &[u8] = b"test";

    fn services(
        me: u64,
        parties: &[PublicKey],
        keys: &[PrivateKey],
    ) -> Services<PublicKey, mocks::Directory, mocks::Verifier, mocks::Vault, mocks::Ledger> {
        Services {
            namespace: NAMESPACE.to_vec(),
            me: PrivateKey::from_seed(me).public_key(),
            directory: mocks::Directory::new(parties.to_vec()),
            verifier: mocks::Verifier::accepting(),
            vault: mocks::Vault::new(keys.to_vec()),
            ledger: mocks::Ledger::new(),
        }
    }

    #[test]
    fn test_initiator_zero_counterparties() {
        let key = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9).public_key();
        let tx = mocks::transaction(&[key.public_key()], notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &key, &tx));

        let services = services(0, &[key.public_key()], &[]);
        let mut initiator = Initiator::new(&services, signed, 100);
        let step = initiator.step(Input::Start).unwrap();
        assert!(step.effects.is_empty());
        assert!(matches!(
            step.status,
            Status::Done(Outcome::Signed(_))
        ));
    }

    #[test]
    fn test_initiator_missing_own_approval() {
        let key = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9).public_key();
        let tx = mocks::transaction(&[key.public_key()], notary);

        let services = services(0, &[key.public_key()], &[]);
        let mut initiator = Initiator::new(&services, SignedTransaction::new(tx), 100);
        assert!(matches!(
            initiator.step(Input::Start),
            Err(Error::InitiatorSignatureMissing)
        ));
    }

    #[test]
    fn test_initiator_unknown_party() {
        let key = PrivateKey::from_seed(0);
        let stranger = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9).public_key();
        let tx = mocks::transaction(&[key.public_key(), stranger.public_key()], notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &key, &tx));

        // The stranger is not in the directory.
        let services = services(0, &[key.public_key()], &[]);
        let mut initiator = Initiator::new(&services, signed, 100);
        assert!(matches!(
            initiator.step(Input::Start),
            Err(Error::UnknownParty(_))
        ));
    }

    #[test]
    fn test_initiator_sequential_collection() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let bob = PrivateKey::from_seed(2);
        let notary = PrivateKey::from_seed(9).public_key();
        let parties = [me.public_key(), alice.public_key(), bob.public_key()];
        let tx = mocks::transaction(&parties, notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        let services = services(0, &parties, &[]);
        let mut initiator = Initiator::new(&services, signed, 100);

        // One session at a time.
        let step = initiator.step(Input::Start).unwrap();
        assert_eq!(step.effects.len(), 1);
        let Effect::Open { session, peer, .. } = &step.effects[0] else {
            panic!("expected open");
        };
        let first = *session;
        let first_key = if *peer == alice.public_key() {
            &alice
        } else {
            &bob
        };

        let step = initiator
            .step(Input::Message {
                session: first,
                payload: Payload::Approvals(vec![Approval::sign(NAMESPACE, first_key, &tx)]),
            })
            .unwrap();
        assert_eq!(step.effects.len(), 1);
        let Effect::Open { session, peer, .. } = &step.effects[0] else {
            panic!("expected open");
        };
        let second = *session;
        assert_ne!(first, second);
        let second_key = if *peer == alice.public_key() {
            &alice
        } else {
            &bob
        };

        let step = initiator
            .step(Input::Message {
                session: second,
                payload: Payload::Approvals(vec![Approval::sign(NAMESPACE, second_key, &tx)]),
            })
            .unwrap();
        assert!(step.effects.is_empty());
        let Status::Done(Outcome::Signed(signed)) = step.status else {
            panic!("expected signed outcome");
        };
        assert!(signed.fully_signed());
        assert_eq!(signed.approvals.len(), 3);
    }

    #[test]
    fn test_initiator_rejection_fails_fast() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let bob = PrivateKey::from_seed(2);
        let notary = PrivateKey::from_seed(9).public_key();
        let parties = [me.public_key(), alice.public_key(), bob.public_key()];
        let tx = mocks::transaction(&parties, notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        let services = services(0, &parties, &[]);
        let mut initiator = Initiator::new(&services, signed, 100);
        let step = initiator.step(Input::Start).unwrap();
        let Effect::Open { session, .. } = &step.effects[0] else {
            panic!("expected open");
        };

        let result = initiator.step(Input::Message {
            session: *session,
            payload: Payload::Reject(b"no".to_vec()),
        });
        assert!(matches!(result, Err(Error::SignatureRejected { .. })));
    }

    #[test]
    fn test_initiator_signer_collision() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9).public_key();
        let parties = [me.public_key(), alice.public_key()];
        let tx = mocks::transaction(&parties, notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        let services = services(0, &parties, &[]);
        let mut initiator = Initiator::new(&services, signed, 100);
        let step = initiator.step(Input::Start).unwrap();
        let Effect::Open { session, .. } = &step.effects[0] else {
            panic!("expected open");
        };

        // An approval from a key already covered is a collision.
        let result = initiator.step(Input::Message {
            session: *session,
            payload: Payload::Approvals(vec![Approval::sign(NAMESPACE, &me, &tx)]),
        });
        assert!(matches!(result, Err(Error::SignerCollision(_))));
    }

    #[test]
    fn test_initiator_snapshot_restore() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9).public_key();
        let parties = [me.public_key(), alice.public_key()];
        let tx = mocks::transaction(&parties, notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        let services = services(0, &parties, &[]);
        let mut initiator = Initiator::new(&services, signed, 100);
        let step = initiator.step(Input::Start).unwrap();
        let Effect::Open { session, .. } = &step.effects[0] else {
            panic!("expected open");
        };
        let session = *session;

        // Restore from the snapshot and finish the protocol there.
        let snapshot = initiator.snapshot();
        let mut restored = restore(&services, &snapshot).unwrap();
        let step = restored
            .step(Input::Message {
                session,
                payload: Payload::Approvals(vec![Approval::sign(NAMESPACE, &alice, &tx)]),
            })
            .unwrap();
        let Status::Done(Outcome::Signed(signed)) = step.status else {
            panic!("expected signed outcome");
        };
        assert!(signed.fully_signed());
    }

    #[test]
    fn test_initiator_restore_many_counterparties() {
        let keys: Vec<PrivateKey> = (0..70).map(PrivateKey::from_seed).collect();
        let publics: Vec<PublicKey> = keys.iter().map(|key| key.public_key()).collect();
        let me = &keys[0];
        let notary = PrivateKey::from_seed(99).public_key();

        // Spread the required signers across two commands so they exceed the
        // per-command party bound.
        let mut tx = mocks::transaction(&publics[..35], notary);
        tx.commands.push(Command {
            action: b"extra".to_vec(),
            signers: publics[35..].to_vec(),
        });
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, me, &tx));

        let services = services(0, &publics, &[]);
        let mut initiator = Initiator::new(&services, signed, 100);
        initiator.step(Input::Start).unwrap();

        let snapshot = initiator.snapshot();
        let mut restored = restore(&services, &snapshot).unwrap();
        let step = restored.step(Input::Resume).unwrap();
        assert!(matches!(step.status, Status::Await(Waiting::Sessions)));
    }

    #[test]
    fn test_responder_approves() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9).public_key();
        let parties = [me.public_key(), alice.public_key()];
        let tx = mocks::transaction(&parties, notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        // Alice's responder holds her key and can resolve the input.
        let services = services(1, &parties, &[alice.clone()]);
        services
            .ledger
            .seed(tx.inputs[0], mocks::output(&parties));
        let mut responder = Responder::new(&services);
        let step = responder
            .step(Input::Message {
                session: SessionId::new(5),
                payload: Payload::Proposal(signed),
            })
            .unwrap();
        let Effect::Send { payload, .. } = &step.effects[0] else {
            panic!("expected send");
        };
        let Payload::Approvals(approvals) = payload else {
            panic!("expected approvals");
        };
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].signer, alice.public_key());
        assert!(approvals[0].verify(NAMESPACE, &tx));
    }

    #[test]
    fn test_responder_rejects() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9).public_key();
        let parties = [me.public_key(), alice.public_key()];
        let tx = mocks::transaction(&parties, notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        let mut services = services(1, &parties, &[alice.clone()]);
        services.verifier = mocks::Verifier::rejecting(b"policy");
        services
            .ledger
            .seed(tx.inputs[0], mocks::output(&parties));
        let mut responder = Responder::new(&services);
        let step = responder
            .step(Input::Message {
                session: SessionId::new(5),
                payload: Payload::Proposal(signed),
            })
            .unwrap();
        let Effect::Send { payload, .. } = &step.effects[0] else {
            panic!("expected send");
        };
        assert!(matches!(payload, Payload::Reject(reason) if reason == b"policy"));
        assert!(matches!(
            step.status,
            Status::Done(Outcome::Rejected { .. })
        ));
    }

    #[test]
    fn test_responder_unknown_input() {
        let me = PrivateKey::from_seed(0);
        let alice = PrivateKey::from_seed(1);
        let notary = PrivateKey::from_seed(9).public_key();
        let parties = [me.public_key(), alice.public_key()];
        let tx = mocks::transaction(&parties, notary);
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        // Nothing seeded in the ledger: the input cannot be resolved.
        let services = services(1, &parties, &[alice]);
        let mut responder = Responder::new(&services);
        let step = responder
            .step(Input::Message {
                session: SessionId::new(5),
                payload: Payload::Proposal(signed),
            })
            .unwrap();
        let Effect::Send { payload, .. } = &step.effects[0] else {
            panic!("expected send");
        };
        assert!(matches!(payload, Payload::Reject(_)));
    }
}
