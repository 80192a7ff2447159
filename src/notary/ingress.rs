use crate::{
    types::{NotaryResponse, SignedTransaction},
    Error, Notarizer,
};
use commonware_cryptography::PublicKey;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};

/// Message types that can be sent to the `Mailbox`
pub enum Message<P: PublicKey> {
    /// Request certification of a fully signed transaction.
    ///
    /// The request can be canceled by dropping the responder.
    Notarize {
        signed: SignedTransaction<P>,
        responder: oneshot::Sender<NotaryResponse<P>>,
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
}

impl<P: PublicKey> Notarizer<P> for Mailbox<P> {
    async fn notarize(
        &mut self,
        signed: SignedTransaction<P>,
    ) -> Result<NotaryResponse<P>, Error> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(Message::Notarize {
                signed,
                responder: sender,
            })
            .await
            .map_err(|_| Error::UnableToSendMessage)?;
        receiver.await.map_err(|_| Error::UnableToSendMessage)
    }
}
