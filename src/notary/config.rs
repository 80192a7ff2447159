use commonware_cryptography::Signer;

/// Configuration for the [`Engine`](super::Engine).
pub struct Config<C: Signer> {
    /// The key certifying transactions.
    pub signer: C,

    /// The application namespace all signatures are scoped to.
    pub namespace: Vec<u8>,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,
}
