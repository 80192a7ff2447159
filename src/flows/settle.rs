//! Composite collect-then-finalize.
//!
//! Runs signature collection to completion, then finalization, as invoked
//! subflows. The composite owns no sessions of its own and inherits
//! cancellation from its owner: canceling the settle flow cancels whichever
//! subflow is currently running.

use super::{Effect, Flow, Input, Step, COLLECT, FINALIZE};
use crate::{
    types::{Outcome, SignedTransaction, Waiting},
    Error,
};
use bytes::BytesMut;
use commonware_codec::{Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::PublicKey;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Init,
    Collecting,
    Finalizing,
}

impl Phase {
    fn tag(self) -> u8 {
        match self {
            Phase::Init => 0,
            Phase::Collecting => 1,
            Phase::Finalizing => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Phase::Init),
            1 => Ok(Phase::Collecting),
            2 => Ok(Phase::Finalizing),
            _ => Err(CodecError::Invalid("txflow::settle", "Invalid phase")),
        }
    }
}

/// The composite protocol.
pub struct Settle<P: PublicKey> {
    signed: SignedTransaction<P>,
    phase: Phase,
}

impl<P: PublicKey> Settle<P> {
    /// Creates a settle flow for `signed`.
    pub fn new(signed: SignedTransaction<P>) -> Self {
        Self {
            signed,
            phase: Phase::Init,
        }
    }

    fn begin(&mut self) -> Step<P> {
        self.phase = Phase::Collecting;
        Step::apply(
            vec![Effect::Invoke {
                kind: COLLECT,
                signed: self.signed.clone(),
            }],
            Waiting::SubFlow,
        )
    }
}

impl<P: PublicKey> Flow<P> for Settle<P> {
    fn step(&mut self, input: Input<P>) -> Result<Step<P>, Error> {
        match input {
            Input::Start => Ok(self.begin()),
            Input::Resume => match self.phase {
                Phase::Init => Ok(self.begin()),
                // The subflow is checkpointed independently and restored
                // alongside its parent.
                Phase::Collecting | Phase::Finalizing => Ok(Step::wait(Waiting::SubFlow)),
            },
            Input::SubFlow(result) => match (self.phase, result?) {
                (Phase::Collecting, Outcome::Signed(signed)) => {
                    self.signed = signed;
                    self.phase = Phase::Finalizing;
                    Ok(Step::apply(
                        vec![Effect::Invoke {
                            kind: FINALIZE,
                            signed: self.signed.clone(),
                        }],
                        Waiting::SubFlow,
                    ))
                }
                (Phase::Finalizing, Outcome::Notarized(notarized)) => {
                    Ok(Step::done(Outcome::Notarized(notarized)))
                }
                _ => Err(Error::UnexpectedInput),
            },
            Input::Message { .. } | Input::SessionFailed { .. } | Input::Notary(_) => {
                Err(Error::UnexpectedInput)
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.phase.tag().write(&mut buf);
        self.signed.write(&mut buf);
        buf.to_vec()
    }
}

/// Rebuilds a settle flow from a checkpointed snapshot.
pub fn restore<P: PublicKey>(snapshot: &[u8]) -> Result<Box<dyn Flow<P>>, Error> {
    let mut buf = snapshot;
    let phase = Phase::from_tag(u8::read(&mut buf).map_err(Error::InvalidSnapshot)?)
        .map_err(Error::InvalidSnapshot)?;
    let signed = SignedTransaction::<P>::read(&mut buf).map_err(Error::InvalidSnapshot)?;
    Ok(Box::new(Settle { signed, phase }))
}

#[cfg(test)]
mod tests {
    use super::{super::Status, *};
    use crate::{
        mocks,
        types::{Approval, Certificate, NotarizedTransaction},
    };
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};

    const NAMESPACE: &[u8] = b"test";

    #[test]
    fn test_delegates_in_order() {
        let me = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9);
        let tx = mocks::transaction(&[me.public_key()], notary.public_key());
        let id = tx.id();
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        let mut settle = Settle::new(signed.clone());
        let step = settle.step(Input::Start).unwrap();
        assert!(matches!(
            step.effects[0],
            Effect::Invoke { kind: COLLECT, .. }
        ));

        let step = settle
            .step(Input::SubFlow(Ok(Outcome::Signed(signed.clone()))))
            .unwrap();
        assert!(matches!(
            step.effects[0],
            Effect::Invoke { kind: FINALIZE, .. }
        ));

        let notarized = NotarizedTransaction {
            signed,
            certificate: Certificate::sign(NAMESPACE, &notary, id),
        };
        let step = settle
            .step(Input::SubFlow(Ok(Outcome::Notarized(notarized))))
            .unwrap();
        assert!(matches!(
            step.status,
            Status::Done(Outcome::Notarized(_))
        ));
    }

    #[test]
    fn test_subflow_failure_propagates() {
        let me = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9);
        let tx = mocks::transaction(&[me.public_key()], notary.public_key());
        let signed = SignedTransaction::new(tx);

        let mut settle = Settle::new(signed);
        settle.step(Input::Start).unwrap();
        let result = settle.step(Input::SubFlow(Err(Error::SignatureRejected {
            reason: b"no".to_vec(),
        })));
        assert!(matches!(result, Err(Error::SignatureRejected { .. })));
    }

    #[test]
    fn test_snapshot_restore() {
        let me = PrivateKey::from_seed(0);
        let notary = PrivateKey::from_seed(9);
        let tx = mocks::transaction(&[me.public_key()], notary.public_key());
        let mut signed = SignedTransaction::new(tx.clone());
        signed.add(Approval::sign(NAMESPACE, &me, &tx));

        let mut settle = Settle::new(signed.clone());
        settle.step(Input::Start).unwrap();

        let mut restored = restore::<commonware_cryptography::ed25519::PublicKey>(
            &settle.snapshot(),
        )
        .unwrap();
        let step = restored
            .step(Input::SubFlow(Ok(Outcome::Signed(signed))))
            .unwrap();
        assert!(matches!(
            step.effects[0],
            Effect::Invoke { kind: FINALIZE, .. }
        ));
    }
}
