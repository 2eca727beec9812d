//! Generic netlink transport shared by the ethtool-family and
//! netdev-family operations.
//!
//! No pack repo implements generic netlink (the ecosystem's own
//! domain-closest examples — xdpilone's AF_XDP sockets, the DPDK/RDMA
//! NIC drivers — all talk to the NIC directly, not through netlink), so
//! this module is ecosystem enrichment: `neli` is the standard
//! synchronous generic-netlink crate, and synchronous is required here
//! because spec.md §5 rules out an async runtime for the core.

use neli::consts::nl::{NlmF, NlmFFlags};
use neli::consts::socket::NlFamily;
use neli::genl::{Genlmsghdr, Nlattr};
use neli::nl::{NlPayload, Nlmsghdr};
use neli::socket::NlSocketHandle;
use neli::types::GenlBuffer;

use crate::error::{DevmemError, DevmemResult};

/// A connected generic-netlink session, resolved against one family by
/// name. Each `bind_rx`/`bind_tx` call opens a fresh session (spec.md
/// §4.2: "opens a fresh control-channel session"); `reset_flow_steering`
/// and the rings/channels/RSS calls reuse a short-lived session per
/// call since they carry no binding lifetime of their own.
pub struct GenlSession {
    socket: NlSocketHandle,
    family_id: u16,
}

impl GenlSession {
    /// Connects to the generic netlink bus and resolves `family_name`
    /// (e.g. `"ethtool"` or `"netdev"`) to its numeric family id.
    pub fn connect(family_name: &str) -> DevmemResult<Self> {
        let mut socket = NlSocketHandle::connect(NlFamily::Generic, None, &[])
            .map_err(|e| DevmemError::Netlink(format!("connect: {e}")))?;
        let family_id = socket
            .resolve_genl_family(family_name)
            .map_err(|e| DevmemError::Netlink(format!("resolve family {family_name}: {e}")))?;
        Ok(Self { socket, family_id })
    }

    /// Sends a generic-netlink request of `cmd` carrying `attrs`, and
    /// returns the attribute buffer of the (single) response message.
    ///
    /// Requests that expect no reply body (pure commands) still use
    /// this path; callers ignore the returned buffer.
    pub fn request(
        &mut self,
        cmd: u8,
        version: u8,
        attrs: GenlBuffer<u16, neli::types::Buffer>,
        ack: bool,
    ) -> DevmemResult<GenlBuffer<u16, neli::types::Buffer>> {
        let genl_hdr = Genlmsghdr::new(cmd, version, attrs);

        let mut flags = NlmFFlags::new(&[NlmF::Request]);
        if ack {
            flags = NlmFFlags::new(&[NlmF::Request, NlmF::Ack]);
        }

        let nl_hdr = Nlmsghdr::new(
            None,
            self.family_id,
            flags,
            None,
            None,
            NlPayload::Payload(genl_hdr),
        );

        self.socket
            .send(nl_hdr)
            .map_err(|e| DevmemError::Netlink(format!("send: {e}")))?;

        let recv: neli::types::NlBuffer<u16, Genlmsghdr<u8, u16>> = self
            .socket
            .recv_all()
            .map_err(|e| DevmemError::Netlink(format!("recv: {e}")))?;

        for msg in recv {
            if let NlPayload::Payload(genl) = msg.nl_payload {
                let mut owned = GenlBuffer::new();
                for a in genl.get_attr_handle().get_attrs() {
                    owned.push(Nlattr {
                        nla_len: a.nla_len,
                        nla_type: a.nla_type.clone(),
                        nla_payload: neli::types::Buffer::from(a.nla_payload.as_ref().to_vec()),
                    });
                }
                return Ok(owned);
            }
        }
        Ok(GenlBuffer::new())
    }

    pub fn family_id(&self) -> u16 {
        self.family_id
    }
}

/// Builds a single nested attribute, mirroring the
/// header-attribute-wraps-an-ifindex shape every ethtool/netdev genl
/// message uses (`ETHTOOL_A_*_HEADER` / `NETDEV_A_DEV_IFINDEX`).
pub fn attr_u32(attr_type: u16, value: u32) -> DevmemResult<Nlattr<u16, neli::types::Buffer>> {
    Nlattr::new(false, false, attr_type, value)
        .map_err(|e| DevmemError::Netlink(format!("build attr {attr_type}: {e}")))
}

pub fn attr_u8(attr_type: u16, value: u8) -> DevmemResult<Nlattr<u16, neli::types::Buffer>> {
    Nlattr::new(false, false, attr_type, value)
        .map_err(|e| DevmemError::Netlink(format!("build attr {attr_type}: {e}")))
}
