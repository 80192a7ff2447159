//! In-memory application services for tests.

use crate::{
    types::{
        Approval, Checkpoint, FlowId, FlowKind, InputRef, NotarizedTransaction, Output,
        Outcome, Transaction, TxId,
    },
    Error,
};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey},
    sha256, Signer as _,
};
use futures::channel::mpsc;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex},
};

/// A sample transaction consuming a fixed genesis input.
pub fn transaction(signers: &[PublicKey], notary: PublicKey) -> Transaction<PublicKey> {
    transaction_with(
        vec![InputRef {
            tx: sha256::hash(b"genesis"),
            index: 0,
        }],
        b"state",
        signers,
        notary,
    )
}

/// A sample transaction with explicit inputs and output data.
pub fn transaction_with(
    inputs: Vec<InputRef>,
    data: &[u8],
    signers: &[PublicKey],
    notary: PublicKey,
) -> Transaction<PublicKey> {
    Transaction {
        inputs,
        outputs: vec![output_with(data, signers)],
        commands: vec![crate::types::Command {
            action: b"transfer".to_vec(),
            signers: signers.to_vec(),
        }],
        notary,
    }
}

/// A sample output held by `participants`.
pub fn output(participants: &[PublicKey]) -> Output<PublicKey> {
    output_with(b"prior", participants)
}

/// A sample output with explicit data.
pub fn output_with(data: &[u8], participants: &[PublicKey]) -> Output<PublicKey> {
    Output {
        data: data.to_vec(),
        participants: participants.to_vec(),
    }
}

/// A mock [crate::Directory] where every known party is its own well-known
/// identity.
#[derive(Clone)]
pub struct Directory {
    parties: Arc<HashSet<PublicKey>>,
}

impl Directory {
    /// Creates a directory containing `parties`.
    pub fn new(parties: impl IntoIterator<Item = PublicKey>) -> Self {
        Self {
            parties: Arc::new(parties.into_iter().collect()),
        }
    }
}

impl crate::Directory<PublicKey> for Directory {
    fn resolve(&self, party: &PublicKey) -> Option<PublicKey> {
        self.parties.get(party).cloned()
    }
}

/// A mock [crate::Verifier] with a fixed answer.
#[derive(Clone)]
pub struct Verifier {
    reject: Option<Vec<u8>>,
}

impl Verifier {
    /// A verifier that accepts every proposal.
    pub fn accepting() -> Self {
        Self { reject: None }
    }

    /// A verifier that rejects every proposal with `reason`.
    pub fn rejecting(reason: &[u8]) -> Self {
        Self {
            reject: Some(reason.to_vec()),
        }
    }
}

impl crate::Verifier<PublicKey> for Verifier {
    fn verify(&self, _: &Transaction<PublicKey>, _: &[Output<PublicKey>]) -> Result<(), Vec<u8>> {
        match &self.reject {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

/// A mock [crate::Vault] holding ed25519 private keys.
#[derive(Clone)]
pub struct Vault {
    keys: Arc<Vec<PrivateKey>>,
}

impl Vault {
    /// Creates a vault controlling `keys`.
    pub fn new(keys: impl IntoIterator<Item = PrivateKey>) -> Self {
        Self {
            keys: Arc::new(keys.into_iter().collect()),
        }
    }
}

impl crate::Vault<PublicKey> for Vault {
    fn approve(
        &self,
        namespace: &[u8],
        tx: &Transaction<PublicKey>,
        required: &BTreeSet<PublicKey>,
    ) -> Vec<Approval<PublicKey>> {
        self.keys
            .iter()
            .filter(|key| required.contains(&key.public_key()))
            .map(|key| Approval::sign(namespace, key, tx))
            .collect()
    }
}

/// A mock in-memory [crate::Ledger].
#[derive(Clone, Default)]
pub struct Ledger {
    inner: Arc<Mutex<LedgerInner>>,
}

#[derive(Default)]
struct LedgerInner {
    committed: HashMap<TxId, NotarizedTransaction<PublicKey>>,
    outputs: HashMap<InputRef, Output<PublicKey>>,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `input` resolvable to `output` without a commit.
    pub fn seed(&self, input: InputRef, output: Output<PublicKey>) {
        self.inner.lock().unwrap().outputs.insert(input, output);
    }

    /// Returns the number of committed transactions.
    pub fn committed(&self) -> usize {
        self.inner.lock().unwrap().committed.len()
    }
}

impl crate::Ledger<PublicKey> for Ledger {
    fn get(&self, tx: &TxId) -> Option<NotarizedTransaction<PublicKey>> {
        self.inner.lock().unwrap().committed.get(tx).cloned()
    }

    fn resolve(&self, input: &InputRef) -> Option<Output<PublicKey>> {
        self.inner.lock().unwrap().outputs.get(input).cloned()
    }

    fn commit(&self, notarized: NotarizedTransaction<PublicKey>) {
        let mut inner = self.inner.lock().unwrap();
        let id = notarized.signed.tx.id();
        for (index, output) in notarized.signed.tx.outputs.iter().enumerate() {
            inner.outputs.insert(
                InputRef {
                    tx: id,
                    index: index as u32,
                },
                output.clone(),
            );
        }
        inner.committed.entry(id).or_insert(notarized);
    }
}

/// A mock in-memory [crate::CheckpointStore].
#[derive(Clone, Default)]
pub struct CheckpointStore {
    inner: Arc<Mutex<BTreeMap<FlowId, Checkpoint<PublicKey>>>>,
}

impl CheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of persisted checkpoints.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Returns true if no checkpoint is persisted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl crate::CheckpointStore<PublicKey> for CheckpointStore {
    fn put(&self, checkpoint: Checkpoint<PublicKey>) {
        self.inner
            .lock()
            .unwrap()
            .insert(checkpoint.flow, checkpoint);
    }

    fn delete(&self, flow: FlowId) {
        self.inner.lock().unwrap().remove(&flow);
    }

    fn load(&self) -> Vec<Checkpoint<PublicKey>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }
}

/// A flow termination observed by [Monitor].
#[derive(Debug)]
pub struct Finished {
    pub flow: FlowId,
    pub kind: FlowKind,
    pub ok: bool,
}

/// A mock [crate::Monitor] that forwards terminations to a channel.
#[derive(Clone)]
pub struct Monitor {
    sender: mpsc::UnboundedSender<Finished>,
}

impl Monitor {
    /// Creates a new [Monitor].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Finished>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }

    /// Creates a dummy [Monitor] that doesn't track events.
    pub fn dummy() -> Self {
        let (sender, _) = mpsc::unbounded();
        Self { sender }
    }
}

impl crate::Monitor<PublicKey> for Monitor {
    fn finished(
        &self,
        flow: FlowId,
        kind: FlowKind,
        result: &Result<Outcome<PublicKey>, Error>,
    ) {
        let _ = self.sender.unbounded_send(Finished {
            flow,
            kind,
            ok: result.is_ok(),
        });
    }
}
