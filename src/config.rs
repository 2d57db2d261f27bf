/// Tunables for a [`crate::Transport`], matching the spec's configuration surface.
///
/// The `Default` values mirror the demo defaults in the original msquic-based
/// implementation this crate generalizes: a short idle timeout and insecure
/// (no certificate validation) credentials, since the demo is the common
/// local-development path, not a hardened production default.
#[derive(Debug, Clone)]
pub struct Config {
    /// QUIC idle timeout, after which the transport considers the connection
    /// dead and (if a resumption ticket is cached) reconnects.
    pub idle_timeout_ms: u64,

    /// Disable server certificate validation. This is an explicit opt-in
    /// mode, not the default once deployed against a real server.
    pub insecure: bool,

    /// Maximum number of pending inbound ops the receive queue will hold
    /// before `recv()` fails with `ResourceExhausted`.
    pub recv_lmq_max: usize,

    /// Maximum number of pending outbound ops the send queue will hold
    /// before `send()` fails with `ResourceExhausted`.
    pub send_lmq_max: usize,

    /// Upper bound on cached resumption ticket material. Retained as a
    /// tunable for API compatibility with the original transport; this
    /// crate delegates ticket storage to rustls's session cache (see
    /// `conn::TicketCache`), which does not expose raw ticket byte counts,
    /// so the bound is not independently enforced here.
    pub resumption_ticket_max_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5_000,
            insecure: true,
            recv_lmq_max: 64,
            send_lmq_max: 64,
            resumption_ticket_max_bytes: 2048,
        }
    }
}
