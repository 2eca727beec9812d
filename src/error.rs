//! Single point of error conversion for the core.
//!
//! Every fallible operation in `device`, `nic`, `rx`, `tx`, and
//! `orchestrator` returns a [`DevmemError`]. The taxonomy matches
//! spec.md §7 exactly; callers outside `rx`/`tx` must not invent new
//! recovery policy for a kind this enum already classifies.

use std::io;

/// Error kinds surfaced by the core, one per spec.md §7 classification.
///
/// Only [`DevmemError::TransientIO`] is locally recoverable (the RX loop
/// retries the current iteration). Every other variant is fatal: the
/// caller tears down scoped resources via `Drop` and returns to `main`.
#[derive(Debug, thiserror::Error)]
pub enum DevmemError {
    /// Bad arguments, missing interface, inconsistent queue range.
    /// Fatal before any I/O is attempted.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The NIC or kernel does not support a feature the core requires
    /// (no response id on bind, header-split read-back disagrees).
    #[error("kernel/NIC does not support required feature: {0}")]
    KernelUnsupported(String),

    /// A fragment's `dmabuf_id` did not match the active binding, or a
    /// message arrived with no devmem descriptors while dmTCP delivery
    /// was requested. Indicates the data-integrity contract is broken.
    #[error("flow steering leak: {0}")]
    FlowSteeringLeak(String),

    /// `EAGAIN`/`EWOULDBLOCK` or a soft `recvmsg` error. The only kind a
    /// caller may recover from by retrying the current iteration.
    #[error("transient I/O: {0}")]
    TransientIO(#[source] io::Error),

    /// TX did not observe a zero-copy completion within the configured
    /// deadline. Page-recycle safety cannot be assumed past this point.
    #[error("completion wait timed out after {0}ms")]
    CompletionTimeout(u64),

    /// Byte-sequence validation mismatches exceeded the configured
    /// threshold.
    #[error("validation failed: {mismatches} mismatches (threshold {threshold})")]
    ValidationFailure { mismatches: u32, threshold: u32 },

    /// Surfaced by the `--use-ethtool-binary` escape hatch
    /// (`nic::flow::install_flow_rule_via_binary`,
    /// `delete_all_flow_rules_via_binary`) when the `ethtool(8)`
    /// subprocess exits non-zero. The default ioctl path never
    /// constructs this variant.
    #[error("ethtool(8) exited with status {0}")]
    ShellOutFailure(i32),

    /// Wraps an I/O error that does not fit a more specific kind above
    /// (e.g. socket setup failures before any dmTCP-specific logic
    /// runs).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Wraps a generic-netlink transport failure from `nic::netlink`.
    #[error("netlink error: {0}")]
    Netlink(String),
}

pub type DevmemResult<T> = Result<T, DevmemError>;

impl DevmemError {
    /// True for [`DevmemError::TransientIO`], the only kind the RX loop
    /// retries in place instead of propagating (spec.md §7).
    pub fn is_transient(&self) -> bool {
        matches!(self, DevmemError::TransientIO(_))
    }
}
