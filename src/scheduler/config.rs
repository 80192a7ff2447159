use crate::flows::Registry;
use commonware_cryptography::PublicKey;
use std::time::Duration;

/// Configuration for the [`Engine`](super::Engine).
pub struct Config<P: PublicKey, K, M, N> {
    /// The registered flow kinds.
    pub registry: Registry<P>,

    /// Durable store of flow checkpoints.
    pub checkpoints: K,

    /// Observer of flow terminations.
    pub monitor: M,

    /// Client of the uniqueness service.
    pub notarizer: N,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// How many times a notary request is retried after a transport failure.
    pub notarize_retries: usize,

    /// Base delay between notary retries, scaled linearly per attempt.
    pub notarize_backoff: Duration,

    /// Whether messages are sent over the network as priority.
    pub priority: bool,
}
