//! Command-line surface (spec.md §6, "informative, as consumed by the
//! orchestrator") and the explicit `Config` record it resolves into.
//!
//! Grounded on `oxidecomputer-hubris/build/xtask/src/main.rs`'s
//! `#[derive(Parser)]` style; the single-record-not-globals shape is
//! grounded on the teacher's own `NcConfig` in `userland/src/apps/nc.rs`
//! (SPEC_FULL §9: "global mutable state ... must become an explicit
//! configuration record").

use std::net::IpAddr;

use clap::Parser;

use crate::error::{DevmemError, DevmemResult};
use crate::nic;

/// Device buffer size. Not an exposed flag (spec.md §6 lists no
/// buffer-size option); chosen large enough to exercise multi-fragment
/// transfers in the end-to-end scenarios (spec.md §8) without making
/// every invocation allocate gigabytes by default.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Default payload size per transmit-engine producer iteration when no
/// chunking-relevant sizing is otherwise specified.
pub const DEFAULT_LINE_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "devmem-nc", about = "device-memory TCP diagnostic endpoint")]
pub struct Cli {
    /// Run as listener (RX).
    #[arg(short = 'l')]
    pub listen: bool,

    /// Peer address (required on sender) or local bind address (on listener).
    #[arg(short = 's')]
    pub addr: Option<String>,

    /// Optional client-side address used for the 5-tuple flow rule and
    /// local bind on sender.
    #[arg(short = 'c')]
    pub client_addr: Option<String>,

    /// TCP port.
    #[arg(short = 'p')]
    pub port: Option<u16>,

    /// Interface name; resolved to ifindex.
    #[arg(short = 'f')]
    pub ifname: String,

    /// Number of RX queues to bind.
    #[arg(short = 'q')]
    pub queue_count: Option<u32>,

    /// First RX queue index in the bound range.
    #[arg(short = 't')]
    pub start_queue: Option<u32>,

    /// Enable validation with modulus M (byte sequence 0..M-1 repeating).
    #[arg(short = 'v')]
    pub validate_modulus: Option<u8>,

    /// TX max chunk size in bytes (0 = unchunked).
    #[arg(short = 'z', default_value_t = 0)]
    pub max_chunk: usize,

    /// Escape hatch for NICs/drivers whose SIOCETHTOOL ioctl path for
    /// ntuple rules is broken: route flow-rule install/delete through
    /// `ethtool(8)` subprocess calls instead.
    #[arg(long = "use-ethtool-binary", default_value_t = false)]
    pub use_ethtool_binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listen,
    Send,
    SelfTest,
}

/// Parsed, validated, and defaulted configuration threaded through the
/// orchestrator and engines (spec.md §9). Built once from [`Cli`], never
/// mutated afterward.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub ifname: String,
    pub ifindex: u32,
    pub bind_addr: Option<std::net::SocketAddr>,
    pub peer_addr: Option<std::net::SocketAddr>,
    pub client_addr: Option<IpAddr>,
    pub port: u16,
    pub start_queue: u32,
    pub queue_count: u32,
    pub validate_modulus: Option<u8>,
    pub max_chunk: usize,
    pub use_ethtool_binary: bool,
}

fn parse_addr(raw: &str, port: u16) -> DevmemResult<std::net::SocketAddr> {
    raw.parse::<IpAddr>()
        .map(|ip| std::net::SocketAddr::new(ip, port))
        .map_err(|_| DevmemError::ConfigurationError(format!("invalid address: {raw}")))
}

/// Determines role and the `(start_queue, queue_count)` pair from the
/// raw flags and the NIC's total queue count (spec.md §6: "Default
/// queue selection when both -q and -t are omitted: RX uses the top 1
/// queue ... self-test mode uses the upper half of the queues"). Pure
/// and independent of any kernel/network access so it is directly
/// unit-testable.
fn derive_role_and_queues(
    listen: bool,
    has_addr: bool,
    start_queue: Option<u32>,
    queue_count: Option<u32>,
    total_queues: u32,
) -> DevmemResult<(Role, u32, u32)> {
    let role = if listen {
        Role::Listen
    } else if has_addr {
        Role::Send
    } else {
        Role::SelfTest
    };

    let (start, count) = match (start_queue, queue_count) {
        (Some(t), Some(q)) => (t, q),
        (Some(t), None) => (t, 1),
        (None, Some(q)) => (total_queues.saturating_sub(q), q),
        (None, None) => match role {
            Role::SelfTest => {
                if total_queues < 2 {
                    return Err(DevmemError::ConfigurationError(
                        "self-test requires at least 2 RX queues".into(),
                    ));
                }
                (total_queues / 2, total_queues / 2)
            }
            _ => (total_queues.saturating_sub(1), 1),
        },
    };

    Ok((role, start, count))
}

impl Config {
    /// Resolves a [`Cli`] into a [`Config`], including the ifindex
    /// lookup and the default queue-selection rules from spec.md §6.
    pub fn resolve(cli: Cli, total_queues: u32) -> DevmemResult<Self> {
        let ifindex = nic::resolve_ifindex(&cli.ifname)?;
        let port = cli.port.unwrap_or(0);

        let (role, start_queue, queue_count) = derive_role_and_queues(
            cli.listen,
            cli.addr.is_some(),
            cli.start_queue,
            cli.queue_count,
            total_queues,
        )?;

        let client_addr = cli
            .client_addr
            .as_deref()
            .map(|raw| {
                raw.parse::<IpAddr>()
                    .map_err(|_| DevmemError::ConfigurationError(format!("invalid client address: {raw}")))
            })
            .transpose()?;

        let (bind_addr, peer_addr) = match (role, &cli.addr) {
            (Role::Listen, Some(raw)) => (Some(parse_addr(raw, port)?), None),
            (Role::Listen, None) => (None, None),
            (Role::Send, Some(raw)) => (None, Some(parse_addr(raw, port)?)),
            (Role::Send, None) => {
                return Err(DevmemError::ConfigurationError(
                    "sender role requires -s ADDR".into(),
                ))
            }
            (Role::SelfTest, _) => (None, None),
        };

        Ok(Config {
            role,
            ifname: cli.ifname,
            ifindex,
            bind_addr,
            peer_addr,
            client_addr,
            port,
            start_queue,
            queue_count,
            validate_modulus: cli.validate_modulus,
            max_chunk: cli.max_chunk,
            use_ethtool_binary: cli.use_ethtool_binary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_listen_and_no_addr_is_self_test_with_upper_half_queues() {
        let (role, start, count) = derive_role_and_queues(false, false, None, None, 8).unwrap();
        assert_eq!(role, Role::SelfTest);
        assert_eq!((start, count), (4, 4));
    }

    #[test]
    fn self_test_requires_at_least_two_queues() {
        let err = derive_role_and_queues(false, false, None, None, 1).unwrap_err();
        assert!(matches!(err, DevmemError::ConfigurationError(_)));
    }

    #[test]
    fn listener_defaults_to_top_queue() {
        let (role, start, count) = derive_role_and_queues(true, false, None, None, 8).unwrap();
        assert_eq!(role, Role::Listen);
        assert_eq!((start, count), (7, 1));
    }

    #[test]
    fn explicit_start_and_count_are_honored_verbatim() {
        let (_, start, count) = derive_role_and_queues(true, false, Some(2), Some(3), 8).unwrap();
        assert_eq!((start, count), (2, 3));
    }

    #[test]
    fn addr_without_listen_flag_selects_send_role() {
        let (role, _, _) = derive_role_and_queues(false, true, Some(0), Some(1), 8).unwrap();
        assert_eq!(role, Role::Send);
    }
}
