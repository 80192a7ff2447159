use super::{metrics, Config, Mailbox, Message};
use crate::{
    flows::{Effect, Flow, Input, Registry, Status as FlowStatus},
    types::{
        AbortReason, Checkpoint, FlowId, FlowKind, NotaryResponse, Outcome, SessionId,
        SessionState, SignedTransaction, Waiting, Wire,
    },
    CheckpointStore, Error, Monitor, Notarizer,
};
use commonware_cryptography::PublicKey;
use commonware_macros::select;
use commonware_p2p::{
    utils::codec::{wrap, WrappedSender},
    Receiver, Recipients, Sender,
};
use commonware_runtime::{
    telemetry::metrics::status::{CounterExt, Status},
    Clock, Handle, Metrics, Spawner,
};
use commonware_utils::futures::Pool;
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use rand::Rng;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};
use tracing::{debug, error, warn};

/// A live flow owned by the engine.
struct Instance<P: PublicKey> {
    /// The state machine itself.
    flow: Box<dyn Flow<P>>,

    /// The flow's registered type.
    kind: FlowKind,

    /// The flow that invoked this one, if any.
    parent: Option<FlowId>,

    /// The subflow this flow is waiting on, if any.
    child: Option<FlowId>,

    /// The owner's handle. Absent for responders, subflows, and flows
    /// restored after a restart.
    handle: Option<oneshot::Sender<Result<Outcome<P>, Error>>>,

    /// What the flow is waiting for.
    waiting: Waiting,

    /// Live sessions owned by the flow.
    sessions: BTreeMap<SessionId, SessionState<P>>,
}

/// What to do to a flow next.
enum Action<P: PublicKey> {
    /// Drive the flow with an input.
    Input(Input<P>),
    /// Terminate the flow with an error.
    Fail(Error),
}

/// A queued flow step. `cleanup` names a finished subflow whose checkpoint
/// is deleted only after this step's own checkpoint is written, so a crash
/// in between never loses the subflow's result.
struct Pending<P: PublicKey> {
    flow: FlowId,
    action: Action<P>,
    cleanup: Option<FlowId>,
}

/// Instance of the flow scheduler.
///
/// It is responsible for:
/// - Running flows and applying the effects they request
/// - Routing session traffic between peers
/// - Checkpointing flows at every suspension point and restoring them
///   after a restart
/// - Relaying notarization requests to the uniqueness service
pub struct Engine<
    E: Rng + Spawner + Clock + Metrics,
    P: PublicKey,
    K: CheckpointStore<P>,
    M: Monitor<P>,
    N: Notarizer<P>,
> {
    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    context: E,
    registry: Registry<P>,
    checkpoints: K,
    monitor: M,
    notarizer: N,

    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    /// Retries for notary requests after transport failures
    notarize_retries: usize,

    /// Base delay between notary retries, scaled per attempt
    notarize_backoff: Duration,

    /// Whether messages are sent as priority
    priority: bool,

    ////////////////////////////////////////
    // Messaging
    ////////////////////////////////////////
    /// The mailbox for receiving requests.
    mailbox_receiver: mpsc::Receiver<Message<P>>,

    /// In-flight notary requests.
    notarizations: Pool<(FlowId, Result<NotaryResponse<P>, Error>)>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    /// Live flows by id.
    instances: BTreeMap<FlowId, Instance<P>>,

    /// Session routing: (peer, session) to the owning flow.
    routes: HashMap<(P, SessionId), FlowId>,

    /// Next flow id to allocate.
    next_flow: u64,

    ////////////////////////////////////////
    // Metrics
    ////////////////////////////////////////
    /// Metrics
    metrics: metrics::Metrics,
}

impl<
        E: Rng + Spawner + Clock + Metrics,
        P: PublicKey,
        K: CheckpointStore<P>,
        M: Monitor<P>,
        N: Notarizer<P>,
    > Engine<E, P, K, M, N>
{
    /// Creates a new engine with the given context and configuration.
    /// Returns the engine and a mailbox for sending requests to the engine.
    pub fn new(context: E, cfg: Config<P, K, M, N>) -> (Self, Mailbox<P>) {
        let (mailbox_sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let mailbox = Mailbox::new(mailbox_sender);
        let metrics = metrics::Metrics::init(context.clone());

        let result = Self {
            context,
            registry: cfg.registry,
            checkpoints: cfg.checkpoints,
            monitor: cfg.monitor,
            notarizer: cfg.notarizer,
            notarize_retries: cfg.notarize_retries,
            notarize_backoff: cfg.notarize_backoff,
            priority: cfg.priority,
            mailbox_receiver,
            notarizations: Pool::default(),
            instances: BTreeMap::new(),
            routes: HashMap::new(),
            next_flow: 0,
            metrics,
        };

        (result, mailbox)
    }

    /// Starts the engine with the given network.
    pub fn start(
        mut self,
        network: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>),
    ) -> Handle<()> {
        self.context.spawn_ref()(self.run(network))
    }

    /// Inner run loop called by `start`.
    async fn run(mut self, network: (impl Sender<PublicKey = P>, impl Receiver<PublicKey = P>)) {
        let (mut sender, mut receiver) = wrap((), network.0, network.1);

        // Restore checkpointed flows before serving any traffic.
        self.rebuild(&mut sender).await;

        let mut shutdown = self.context.stopped();
        loop {
            // Tear down flows whose handles were dropped
            self.sweep(&mut sender).await;
            self.metrics.running.set(self.instances.len() as i64);
            self.metrics.sessions.set(self.routes.len() as i64);

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
                        Message::Start { kind, signed, responder } => {
                            self.handle_start(&mut sender, kind, signed, responder).await;
                        }
                    }
                },

                // Handle completed notary requests
                ready = self.notarizations.next_completed() => {
                    let (flow, result) = ready;
                    match result {
                        Ok(response) => {
                            self.metrics.notarize.inc(Status::Success);
                            self.drive(&mut sender, flow, Input::Notary(response)).await;
                        }
                        Err(err) => {
                            self.metrics.notarize.inc(Status::Failure);
                            self.fail(&mut sender, flow, err).await;
                        }
                    }
                },

                // Handle incoming frames
                msg = receiver.recv() => {
                    let (peer, msg) = match msg {
                        Ok(r) => r,
                        Err(err) => {
                            error!(?err, "receiver failed");
                            return;
                        }
                    };
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(?err, ?peer, "failed to decode frame");
                            self.metrics.receive.inc(Status::Invalid);
                            continue;
                        }
                    };
                    self.handle_network(&mut sender, peer, msg).await;
                },
            }
        }
    }

    fn allocate(&mut self) -> FlowId {
        let flow = FlowId::new(self.next_flow);
        self.next_flow += 1;
        flow
    }

    ////////////////////////////////////////
    // Handling
    ////////////////////////////////////////

    /// Handles a `start` request from the application.
    async fn handle_start<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        kind: FlowKind,
        signed: SignedTransaction<P>,
        responder: oneshot::Sender<Result<Outcome<P>, Error>>,
    ) {
        let seed = self.context.gen();
        let machine = match self.registry.initiate(kind, seed, signed) {
            Ok(machine) => machine,
            Err(err) => {
                warn!(%kind, ?err, "cannot start flow");
                self.metrics.start.inc(Status::Invalid);
                let _ = responder.send(Err(err));
                return;
            }
        };
        let flow = self.allocate();
        self.instances.insert(
            flow,
            Instance {
                flow: machine,
                kind,
                parent: None,
                child: None,
                handle: Some(responder),
                waiting: Waiting::Ready,
                sessions: BTreeMap::new(),
            },
        );
        self.metrics.start.inc(Status::Success);
        debug!(%flow, %kind, "flow started");
        self.drive(sender, flow, Input::Start).await;
    }

    /// Handles a frame that was received from a peer.
    async fn handle_network<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        peer: P,
        msg: Wire<P>,
    ) {
        match msg {
            Wire::Open {
                session,
                kind,
                payload,
            } => {
                // At most one live session per (peer, session).
                if self.routes.contains_key(&(peer.clone(), session)) {
                    warn!(?peer, %session, "duplicate session");
                    self.metrics.receive.inc(Status::Invalid);
                    self.abort(sender, &peer, session, AbortReason::Duplicate)
                        .await;
                    return;
                }
                let seed = self.context.gen();
                let machine = match self.registry.respond(kind, seed) {
                    Ok(machine) => machine,
                    Err(err) => {
                        warn!(?peer, %session, %kind, ?err, "cannot respond");
                        self.metrics.receive.inc(Status::Invalid);
                        self.abort(sender, &peer, session, AbortReason::Failed).await;
                        return;
                    }
                };
                let flow = self.allocate();
                let mut sessions = BTreeMap::new();
                sessions.insert(
                    session,
                    SessionState {
                        id: session,
                        peer: peer.clone(),
                        inbound: true,
                        next_send: 1,
                        next_recv: 1,
                    },
                );
                self.routes.insert((peer, session), flow);
                self.instances.insert(
                    flow,
                    Instance {
                        flow: machine,
                        kind,
                        parent: None,
                        child: None,
                        handle: None,
                        waiting: Waiting::Ready,
                        sessions,
                    },
                );
                self.metrics.receive.inc(Status::Success);
                debug!(%flow, %kind, %session, "responder spawned");
                self.drive(sender, flow, Input::Message { session, payload })
                    .await;
            }
            Wire::Data {
                session,
                seq,
                payload,
            } => {
                let Some(&flow) = self.routes.get(&(peer.clone(), session)) else {
                    // Late delivery after termination.
                    debug!(?peer, %session, "data for unknown session");
                    self.metrics.receive.inc(Status::Dropped);
                    return;
                };
                let Some(instance) = self.instances.get_mut(&flow) else {
                    return;
                };
                let Some(state) = instance.sessions.get_mut(&session) else {
                    return;
                };
                if seq != state.next_recv {
                    debug!(?peer, %session, seq, expected = state.next_recv, "redelivered frame");
                    self.metrics.receive.inc(Status::Dropped);
                    return;
                }
                state.next_recv += 1;
                self.metrics.receive.inc(Status::Success);
                self.drive(sender, flow, Input::Message { session, payload })
                    .await;
            }
            Wire::Abort { session, reason } => {
                let Some(&flow) = self.routes.get(&(peer.clone(), session)) else {
                    debug!(?peer, %session, "abort for unknown session");
                    self.metrics.receive.inc(Status::Dropped);
                    return;
                };
                debug!(%flow, %session, ?reason, "session aborted by peer");
                self.routes.remove(&(peer, session));
                if let Some(instance) = self.instances.get_mut(&flow) {
                    instance.sessions.remove(&session);
                }
                self.metrics.receive.inc(Status::Success);
                // A duplicate rejection is a protocol violation, not a peer
                // failure the flow can interpret.
                if reason == AbortReason::Duplicate {
                    self.fail(sender, flow, Error::DuplicateSession(session))
                        .await;
                } else {
                    self.drive(sender, flow, Input::SessionFailed { session })
                        .await;
                }
            }
        }
    }

    ////////////////////////////////////////
    // Flow Stepping
    ////////////////////////////////////////

    /// Drives a flow with an input, then any flows its completion cascades to.
    async fn drive<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        flow: FlowId,
        input: Input<P>,
    ) {
        self.advance(
            sender,
            Pending {
                flow,
                action: Action::Input(input),
                cleanup: None,
            },
        )
        .await;
    }

    /// Terminates a flow with an error, then any flows its completion
    /// cascades to.
    async fn fail<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        flow: FlowId,
        err: Error,
    ) {
        self.advance(
            sender,
            Pending {
                flow,
                action: Action::Fail(err),
                cleanup: None,
            },
        )
        .await;
    }

    /// Works through a queue of flow steps. A terminal subflow enqueues a
    /// step of its parent, so one inbound event can ripple up a chain of
    /// invocations.
    async fn advance<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        first: Pending<P>,
    ) {
        let mut queue = VecDeque::new();
        queue.push_back(first);
        while let Some(Pending {
            flow,
            action,
            cleanup,
        }) = queue.pop_front()
        {
            match action {
                Action::Fail(err) => {
                    self.finish(sender, flow, Err(err), &mut queue).await;
                }
                Action::Input(input) => {
                    let step = {
                        let Some(instance) = self.instances.get_mut(&flow) else {
                            if let Some(child) = cleanup {
                                self.checkpoints.delete(child);
                            }
                            continue;
                        };
                        if matches!(input, Input::SubFlow(_)) {
                            instance.child = None;
                        }
                        instance.flow.step(input)
                    };
                    match step {
                        Err(err) => {
                            self.finish(sender, flow, Err(err), &mut queue).await;
                        }
                        Ok(step) => {
                            match self.apply(sender, flow, step.effects, &mut queue).await {
                                Err(err) => {
                                    self.finish(sender, flow, Err(err), &mut queue).await;
                                }
                                Ok(()) => match step.status {
                                    FlowStatus::Await(waiting) => {
                                        if let Some(instance) = self.instances.get_mut(&flow) {
                                            instance.waiting = waiting;
                                        }
                                        self.checkpoint(flow);
                                    }
                                    FlowStatus::Done(outcome) => {
                                        self.finish(sender, flow, Ok(outcome), &mut queue).await;
                                    }
                                },
                            }
                        }
                    }
                }
            }
            // The step above has been made durable; the finished subflow's
            // checkpoint can go.
            if let Some(child) = cleanup {
                self.checkpoints.delete(child);
            }
        }
    }

    /// Applies the effects of one step, in order.
    async fn apply<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        flow: FlowId,
        effects: Vec<Effect<P>>,
        queue: &mut VecDeque<Pending<P>>,
    ) -> Result<(), Error> {
        let priority = self.priority;
        for effect in effects {
            match effect {
                Effect::Open {
                    session,
                    peer,
                    kind,
                    payload,
                } => {
                    // At most one live session per (peer, session), locally
                    // as well as on the far end.
                    if self.routes.contains_key(&(peer.clone(), session)) {
                        return Err(Error::DuplicateSession(session));
                    }
                    self.routes.insert((peer.clone(), session), flow);
                    if let Some(instance) = self.instances.get_mut(&flow) {
                        instance.sessions.insert(
                            session,
                            SessionState {
                                id: session,
                                peer: peer.clone(),
                                inbound: false,
                                next_send: 1,
                                next_recv: 1,
                            },
                        );
                    }
                    let sent = sender
                        .send(
                            Recipients::One(peer),
                            Wire::Open {
                                session,
                                kind,
                                payload,
                            },
                            priority,
                        )
                        .await
                        .map_err(|_| Error::UnableToSendMessage)?;
                    if sent.is_empty() {
                        return Err(Error::UnableToSendMessage);
                    }
                }
                Effect::Send { session, payload } => {
                    let Some(instance) = self.instances.get_mut(&flow) else {
                        continue;
                    };
                    let Some(state) = instance.sessions.get_mut(&session) else {
                        return Err(Error::SessionClosed(session));
                    };
                    let seq = state.next_send;
                    state.next_send += 1;
                    let peer = state.peer.clone();
                    let sent = sender
                        .send(
                            Recipients::One(peer),
                            Wire::Data {
                                session,
                                seq,
                                payload,
                            },
                            priority,
                        )
                        .await
                        .map_err(|_| Error::UnableToSendMessage)?;
                    if sent.is_empty() {
                        return Err(Error::UnableToSendMessage);
                    }
                }
                Effect::Notarize(signed) => {
                    let context = self.context.clone();
                    let mut notarizer = self.notarizer.clone();
                    let retries = self.notarize_retries;
                    let backoff = self.notarize_backoff;
                    self.notarizations.push(async move {
                        let mut attempts = 0;
                        loop {
                            match notarizer.notarize(signed.clone()).await {
                                Err(err) if err.retryable() && attempts < retries => {
                                    attempts += 1;
                                    context.sleep(backoff * attempts as u32).await;
                                }
                                result => return (flow, result),
                            }
                        }
                    });
                }
                Effect::Invoke { kind, signed } => {
                    let seed = self.context.gen();
                    let machine = self.registry.initiate(kind, seed, signed)?;
                    let child = self.allocate();
                    self.instances.insert(
                        child,
                        Instance {
                            flow: machine,
                            kind,
                            parent: Some(flow),
                            child: None,
                            handle: None,
                            waiting: Waiting::Ready,
                            sessions: BTreeMap::new(),
                        },
                    );
                    if let Some(instance) = self.instances.get_mut(&flow) {
                        instance.child = Some(child);
                    }
                    debug!(%flow, %child, %kind, "subflow invoked");
                    queue.push_back(Pending {
                        flow: child,
                        action: Action::Input(Input::Start),
                        cleanup: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// Removes a terminal flow, tearing down its sessions and children and
    /// reporting the result.
    async fn finish<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        flow: FlowId,
        result: Result<Outcome<P>, Error>,
        queue: &mut VecDeque<Pending<P>>,
    ) {
        let Some(mut instance) = self.instances.remove(&flow) else {
            return;
        };
        let failed = result.is_err();
        if let Err(err) = &result {
            debug!(%flow, ?err, "flow failed");
        } else {
            debug!(%flow, "flow finished");
        }

        // A failed flow aborts its open sessions so peers fail fast instead
        // of hanging; a finished one closes them silently.
        for (id, state) in std::mem::take(&mut instance.sessions) {
            self.routes.remove(&(state.peer.clone(), id));
            if failed {
                self.abort(sender, &state.peer, id, AbortReason::Failed).await;
            }
        }

        // A terminal parent takes its still-running subtree down with it.
        if let Some(child) = instance.child {
            self.cancel(sender, child).await;
        }

        self.monitor.finished(flow, instance.kind, &result);
        self.metrics.finished.inc(if failed {
            Status::Failure
        } else {
            Status::Success
        });

        if let Some(parent) = instance.parent {
            // The parent consumes the result; its next checkpoint supersedes
            // this flow's, which is deleted only after that write.
            queue.push_back(Pending {
                flow: parent,
                action: Action::Input(Input::SubFlow(result)),
                cleanup: Some(flow),
            });
            return;
        }
        self.checkpoints.delete(flow);
        if let Some(handle) = instance.handle.take() {
            let _ = handle.send(result);
        }
    }

    /// Cancels a flow and every descendant, aborting their sessions.
    async fn cancel<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        flow: FlowId,
    ) {
        let mut stack = vec![flow];
        while let Some(flow) = stack.pop() {
            let Some(instance) = self.instances.remove(&flow) else {
                continue;
            };
            debug!(%flow, "flow canceled");
            for (id, state) in instance.sessions {
                self.routes.remove(&(state.peer.clone(), id));
                self.abort(sender, &state.peer, id, AbortReason::Canceled)
                    .await;
            }
            if let Some(child) = instance.child {
                stack.push(child);
            }
            self.checkpoints.delete(flow);
            self.monitor.finished(flow, instance.kind, &Err(Error::Canceled));
            self.metrics.finished.inc(Status::Dropped);
            if let Some(handle) = instance.handle {
                let _ = handle.send(Err(Error::Canceled));
            }
        }
    }

    /// Cancels flows whose handles were dropped by their owners.
    async fn sweep<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
    ) {
        let dropped: Vec<FlowId> = self
            .instances
            .iter()
            .filter(|(_, instance)| {
                instance
                    .handle
                    .as_ref()
                    .is_some_and(|handle| handle.is_canceled())
            })
            .map(|(flow, _)| *flow)
            .collect();
        for flow in dropped {
            self.cancel(sender, flow).await;
        }
    }

    /// Sends an abort frame, ignoring transport failures.
    async fn abort<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
        peer: &P,
        session: SessionId,
        reason: AbortReason,
    ) {
        let result = sender
            .send(
                Recipients::One(peer.clone()),
                Wire::Abort { session, reason },
                self.priority,
            )
            .await;
        if let Err(err) = result {
            warn!(?err, ?peer, %session, "failed to send abort");
        }
    }

    ////////////////////////////////////////
    // Checkpointing
    ////////////////////////////////////////

    /// Writes a flow's checkpoint, replacing any prior one.
    fn checkpoint(&mut self, flow: FlowId) {
        let Some(instance) = self.instances.get(&flow) else {
            return;
        };
        self.checkpoints.put(Checkpoint {
            flow,
            kind: instance.kind,
            parent: instance.parent,
            waiting: instance.waiting,
            state: instance.flow.snapshot(),
            sessions: instance.sessions.values().cloned().collect(),
        });
    }

    /// Restores every checkpointed flow and re-drives it.
    async fn rebuild<S: Sender<PublicKey = P>>(
        &mut self,
        sender: &mut WrappedSender<S, Wire<P>>,
    ) {
        let mut checkpoints = self.checkpoints.load();
        checkpoints.sort_by_key(|checkpoint| checkpoint.flow);

        let mut links = Vec::new();
        for checkpoint in checkpoints {
            let machine = match self.registry.restore(checkpoint.kind, &checkpoint.state) {
                Ok(machine) => machine,
                Err(err) => {
                    warn!(flow = %checkpoint.flow, ?err, "cannot restore flow");
                    self.checkpoints.delete(checkpoint.flow);
                    continue;
                }
            };
            let mut sessions = BTreeMap::new();
            for state in checkpoint.sessions {
                self.routes.insert((state.peer.clone(), state.id), checkpoint.flow);
                sessions.insert(state.id, state);
            }
            self.next_flow = self.next_flow.max(checkpoint.flow.get() + 1);
            if let Some(parent) = checkpoint.parent {
                links.push((parent, checkpoint.flow));
            }
            debug!(flow = %checkpoint.flow, kind = %checkpoint.kind, "flow restored");
            self.instances.insert(
                checkpoint.flow,
                Instance {
                    flow: machine,
                    kind: checkpoint.kind,
                    parent: checkpoint.parent,
                    child: None,
                    handle: None,
                    waiting: checkpoint.waiting,
                    sessions,
                },
            );
        }
        for (parent, child) in links {
            if let Some(instance) = self.instances.get_mut(&parent) {
                instance.child = Some(child);
            }
        }

        // Re-drive every restored flow; in-flight notary requests are
        // re-issued (idempotent by transaction id).
        let restored: Vec<FlowId> = self.instances.keys().copied().collect();
        for flow in restored {
            self.drive(sender, flow, Input::Resume).await;
        }
    }
}
