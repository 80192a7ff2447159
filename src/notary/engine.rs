use super::{metrics, Config, Mailbox, Message};
use crate::types::{Certificate, InputRef, NotaryError, NotaryResponse, SignedTransaction, TxId};
use commonware_cryptography::Signer;
use commonware_macros::select;
use commonware_runtime::{
    telemetry::metrics::status::{CounterExt, Status},
    Handle, Metrics, Spawner,
};
use futures::{channel::mpsc, StreamExt};
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// Instance of the uniqueness service.
///
/// It is responsible for:
/// - Certifying the first transaction to consume each input
/// - Rejecting every later transaction contesting a consumed input
/// - Answering repeated requests for a certified transaction idempotently
pub struct Engine<E: Spawner + Metrics, C: Signer> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    context: E,

    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    /// The certifying key
    signer: C,

    /// Namespace scoping every signature
    namespace: Vec<u8>,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    /// The mailbox for receiving requests.
    mailbox_receiver: mpsc::Receiver<Message<C::PublicKey>>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    /// The transaction that consumed each input.
    consumed: HashMap<InputRef, TxId>,

    /// Certificates already issued, by transaction id.
    issued: HashMap<TxId, Certificate<C::PublicKey>>,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    /// Metrics
    metrics: metrics::Metrics,
}

impl<E: Spawner + Metrics, C: Signer> Engine<E, C> {
    /// Creates a new engine with the given context and configuration.
    /// Returns the engine and a mailbox for sending requests to the engine.
    pub fn new(context: E, cfg: Config<C>) -> (Self, Mailbox<C::PublicKey>) {
        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let mailbox = Mailbox::new(mailbox_sender);
        let metrics = metrics::Metrics::init(context.clone());

        let result = Self {
            context,
            signer: cfg.signer,
            namespace: cfg.namespace,
            mailbox_receiver,
            consumed: HashMap::new(),
            issued: HashMap::new(),
            metrics,
        };

        (result, mailbox)
    }

    /// Starts the engine.
    pub fn start(mut self) -> Handle<()> {
        self.context.spawn_ref()(self.run())
    }

    /// Inner run loop called by `start`.
    async fn run(mut self) {
        let mut shutdown = self.context.stopped();

        loop {
            select! {
                // Handle shutdown signal
                _ = &mut shutdown => {
                    debug!("shutdown");
                    return;
                },

                // Handle mailbox messages
                mail = self.mailbox_receiver.next() => {
                    let Some(msg) = mail else {
                        error!("mailbox receiver failed");
                        return;
                    };
                    match msg {
                        Message::Notarize { signed, responder } => {
                            let response = self.handle_notarize(signed);
                            let status = match &response {
                                NotaryResponse::Certificate(_) => Status::Success,
                                NotaryResponse::Rejection {
                                    error: NotaryError::Malformed,
                                    ..
                                } => Status::Invalid,
                                NotaryResponse::Rejection { .. } => Status::Failure,
                            };
                            match responder.send(response) {
                                Ok(()) => self.metrics.notarize.inc(status),
                                Err(_) => self.metrics.notarize.inc(Status::Dropped),
                            }
                            self.metrics.consumed.set(self.consumed.len() as i64);
                        }
                    }
                },
            }
        }
    }

    /// Handles a `notarize` request.
    fn handle_notarize(
        &mut self,
        signed: SignedTransaction<C::PublicKey>,
    ) -> NotaryResponse<C::PublicKey> {
        let id = signed.tx.id();

        // A transaction already certified is answered with the same
        // certificate, whatever its inputs look like now.
        if let Some(certificate) = self.issued.get(&id) {
            debug!(tx = %id, "already certified");
            return NotaryResponse::Certificate(certificate.clone());
        }

        // Reject anything not addressed to us or not fully signed.
        if signed.tx.notary != self.signer.public_key()
            || !signed.tx.distinct_inputs()
            || !signed.fully_signed()
            || !signed.verify(&self.namespace)
        {
            warn!(tx = %id, "malformed request");
            return NotaryResponse::Rejection {
                tx: id,
                error: NotaryError::Malformed,
            };
        }

        // First committer wins: any input consumed by another transaction
        // fails the whole request without consuming anything.
        for input in &signed.tx.inputs {
            if let Some(competing) = self.consumed.get(input) {
                warn!(tx = %id, %input, %competing, "conflict");
                return NotaryResponse::Rejection {
                    tx: id,
                    error: NotaryError::Conflict {
                        input: *input,
                        competing: *competing,
                    },
                };
            }
        }

        // Consume every input and issue the certificate.
        for input in &signed.tx.inputs {
            self.consumed.insert(*input, id);
        }
        let certificate = Certificate::sign(&self.namespace, &self.signer, id);
        self.issued.insert(id, certificate.clone());
        debug!(tx = %id, "certified");
        NotaryResponse::Certificate(certificate)
    }
}
