use crate::{
    flows::{COLLECT, FINALIZE, SETTLE},
    types::{FlowKind, Outcome, SignedTransaction},
    Error,
};
use commonware_cryptography::PublicKey;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Message types that can be sent to the `Mailbox`
pub enum Message<P: PublicKey> {
    /// Start a flow of the given kind.
    ///
    /// The responder resolves with the flow's terminal result. Dropping it
    /// cancels the flow at its next suspension point.
    Start {
        kind: FlowKind,
        signed: SignedTransaction<P>,
        responder: oneshot::Sender<Result<Outcome<P>, Error>>,
    },
}

/// Ingress mailbox for [`Engine`](super::Engine).
#[derive(Clone)]
pub struct Mailbox<P: PublicKey> {
    sender: mpsc::Sender<Message<P>>,
}

impl<P: PublicKey> Mailbox<P> {
    pub(super) fn new(sender: mpsc::Sender<Message<P>>) -> Self {
        Self { sender }
    }

    /// Starts a flow of `kind` operating on `signed`.
    ///
    /// The returned receiver is the flow's handle: it resolves with the
    /// terminal result, and dropping it cancels the flow at its next
    /// suspension point.
    pub async fn start(
        &mut self,
        kind: FlowKind,
        signed: SignedTransaction<P>,
    ) -> oneshot::Receiver<Result<Outcome<P>, Error>> {
        let (sender, receiver) = oneshot::channel();
        // A closed engine leaves the handle canceled.
        let _ = self
            .sender
            .send(Message::Start {
                kind,
                signed,
                responder: sender,
            })
            .await;
        receiver
    }

    /// Starts signature collection.
    pub async fn collect(
        &mut self,
        signed: SignedTransaction<P>,
    ) -> oneshot::Receiver<Result<Outcome<P>, Error>> {
        self.start(COLLECT, signed).await
    }

    /// Starts finalization.
    pub async fn finalize(
        &mut self,
        signed: SignedTransaction<P>,
    ) -> oneshot::Receiver<Result<Outcome<P>, Error>> {
        self.start(FINALIZE, signed).await
    }

    /// Starts the composite collect-then-finalize.
    pub async fn settle(
        &mut self,
        signed: SignedTransaction<P>,
    ) -> oneshot::Receiver<Result<Outcome<P>, Error>> {
        self.start(SETTLE, signed).await
    }
}
