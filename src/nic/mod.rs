//! NIC control plane (spec.md §4.2): a stateless façade over a generic
//! netlink transport addressing an ethtool-family and a netdev-family.
//!
//! Expressed as the [`NicControlPlane`] trait (SPEC_FULL §11.2) so the
//! RX engine, TX engine, and orchestrator depend on an interface, not a
//! concrete netlink transport — the same way the teacher's apps depend
//! on `crate::syscall::net` rather than issuing raw syscalls themselves.

pub mod ethtool;
pub mod flow;
pub mod netdev;
pub mod netlink;

#[cfg(any(test, feature = "mock-nic"))]
pub mod mock;

use crate::error::{DevmemError, DevmemResult};
use crate::types::{DmabufBindingRxId, DmabufBindingTxId, QueueId};

/// Owns the lifetime of a kernel-side dma-buf binding. Dropping the
/// handle closes the control-channel session that produced the
/// binding, which implicitly unbinds it (spec.md §3, §4.2, §9 — "no
/// explicit unbind verb").
pub trait BindingHandle: std::fmt::Debug {}

/// Façade over the ethtool-family and netdev-family generic netlink
/// transports (spec.md §4.2).
pub trait NicControlPlane {
    /// Sum of dedicated-RX and combined channels.
    fn rx_queue_count(&self, ifindex: u32) -> DevmemResult<u32>;

    /// Sets TCP header/data split to `on` (value 2) or off (value 0).
    /// Returns once confirmed by a follow-up read; the returned value
    /// is the observed value, which the caller must compare against
    /// the requested one (a NIC disagreeing is `KernelUnsupported`).
    fn set_header_split(&self, ifindex: u32, on: bool) -> DevmemResult<bool>;

    /// Toggles ntuple off then on, then deletes every installed filter.
    /// Individual failures are logged, not propagated (spec.md §4.2:
    /// "NICs vary; missing filters to delete is not an error").
    fn reset_flow_steering(&self, ifindex: u32);

    /// Reprograms the RX hash indirection table to the first `n`
    /// queues, leaving `[n, total)` free for flow-steered delivery.
    fn configure_rss(&self, ifindex: u32, n: u32) -> DevmemResult<()>;

    /// Sets channel counts. Must fail if this would deactivate a queue
    /// index at or above `rx`/`tx` that currently has an active
    /// binding (spec.md §4.2, §8 invariant 5).
    fn configure_channels(&self, ifindex: u32, rx: u32, tx: u32) -> DevmemResult<()>;

    /// Installs a 5-tuple rule if `client_addr` is present, else
    /// retries with a 3-tuple rule. Succeeds iff one of the two took
    /// effect.
    fn install_flow_rule(
        &self,
        ifindex: u32,
        server_addr: std::net::IpAddr,
        client_addr: Option<std::net::IpAddr>,
        port: u16,
        queue: u32,
    ) -> DevmemResult<()>;

    /// Opens a fresh control-channel session, binds `fd` to `queues`,
    /// and returns the kernel-assigned id plus the handle governing the
    /// binding's lifetime. Fails if `queues` is empty, if header split
    /// is off, or if the response carries no id (spec.md §4.2, §8
    /// invariants 3-4).
    fn bind_rx(
        &self,
        ifindex: u32,
        fd: std::os::fd::RawFd,
        queues: &[QueueId],
    ) -> DevmemResult<(DmabufBindingRxId, Box<dyn BindingHandle>)>;

    /// Analogous to `bind_rx` for the TX path.
    fn bind_tx(
        &self,
        ifindex: u32,
        fd: std::os::fd::RawFd,
    ) -> DevmemResult<(DmabufBindingTxId, Box<dyn BindingHandle>)>;
}

/// Real implementation: routes rings/channels/RSS through the ethtool
/// genl family, ntuple through the classic ioctl ABI, and binding
/// through the netdev genl family. Stateless in the sense spec.md §4.2
/// requires (no binding state is cached here — the kernel alone tracks
/// it), but the interface name is resolved once so `nic::flow`'s
/// ioctl path, which needs a name rather than an index, does not
/// re-resolve it on every call.
pub struct LinuxNicControl {
    ifname: String,
    /// SPEC_FULL §11.3's `--use-ethtool-binary` escape hatch: routes
    /// ntuple install/delete through `ethtool(8)` subprocess calls
    /// instead of the `SIOCETHTOOL` ioctl, for NICs/drivers whose ioctl
    /// path misbehaves but whose userspace tool works.
    use_ethtool_binary: bool,
}

impl LinuxNicControl {
    pub fn new(ifname: impl Into<String>) -> Self {
        Self { ifname: ifname.into(), use_ethtool_binary: false }
    }

    pub fn with_ethtool_binary(ifname: impl Into<String>, use_ethtool_binary: bool) -> Self {
        Self { ifname: ifname.into(), use_ethtool_binary }
    }
}

impl NicControlPlane for LinuxNicControl {
    fn rx_queue_count(&self, ifindex: u32) -> DevmemResult<u32> {
        ethtool::rx_queue_count(ifindex)
    }

    fn set_header_split(&self, ifindex: u32, on: bool) -> DevmemResult<bool> {
        ethtool::set_header_split(ifindex, on)
    }

    fn reset_flow_steering(&self, ifindex: u32) {
        if let Err(e) = ethtool::set_ntuple_feature(ifindex, false) {
            tracing::warn!(error = %e, "ntuple disable failed, continuing");
        }
        if let Err(e) = ethtool::set_ntuple_feature(ifindex, true) {
            tracing::warn!(error = %e, "ntuple enable failed, continuing");
        }
        if self.use_ethtool_binary {
            flow::delete_all_flow_rules_via_binary(&self.ifname);
        } else {
            flow::delete_all_flow_rules(&self.ifname);
        }
    }

    fn configure_rss(&self, ifindex: u32, n: u32) -> DevmemResult<()> {
        ethtool::configure_rss(ifindex, n)
    }

    fn configure_channels(&self, ifindex: u32, rx: u32, tx: u32) -> DevmemResult<()> {
        ethtool::configure_channels(ifindex, rx, tx)
    }

    fn install_flow_rule(
        &self,
        _ifindex: u32,
        server_addr: std::net::IpAddr,
        client_addr: Option<std::net::IpAddr>,
        port: u16,
        queue: u32,
    ) -> DevmemResult<()> {
        if self.use_ethtool_binary {
            flow::install_flow_rule_via_binary(&self.ifname, server_addr, client_addr, port, queue)
        } else {
            flow::install_flow_rule(&self.ifname, server_addr, client_addr, port, queue)
        }
    }

    fn bind_rx(
        &self,
        ifindex: u32,
        fd: std::os::fd::RawFd,
        queues: &[QueueId],
    ) -> DevmemResult<(DmabufBindingRxId, Box<dyn BindingHandle>)> {
        netdev::bind_rx(ifindex, fd, queues)
    }

    fn bind_tx(
        &self,
        ifindex: u32,
        fd: std::os::fd::RawFd,
    ) -> DevmemResult<(DmabufBindingTxId, Box<dyn BindingHandle>)> {
        netdev::bind_tx(ifindex, fd)
    }
}

/// Resolves an interface name to its kernel ifindex (spec.md §6: "`-f
/// NAME` — interface name; resolved to ifindex").
pub fn resolve_ifindex(ifname: &str) -> DevmemResult<u32> {
    let cname = std::ffi::CString::new(ifname)
        .map_err(|_| DevmemError::ConfigurationError("interface name has interior NUL".into()))?;
    // SAFETY: `cname` is a valid NUL-terminated C string.
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(DevmemError::ConfigurationError(format!(
            "no such interface: {ifname}"
        )));
    }
    Ok(idx)
}
