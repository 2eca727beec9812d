//! Transmit engine (spec.md §4.4): zero-copy send with a per-message
//! control header naming the TX dma-buf id, chunking with the
//! 1024-segment cap, and `wait_completion`'s poll-then-drain-error-queue
//! algorithm.
//!
//! Grounded on `other_examples/…HeroicKatora-xdpilone__src-xsk-user.rs.rs`'s
//! reserve/fill/commit ring-slot pattern, applied here to constructing
//! one segmented send instead of an XDP ring descriptor.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::device::{DeviceBuffer, DeviceBufferProvider};
use crate::error::{DevmemError, DevmemResult};
use crate::nic::NicControlPlane;
use crate::types::TxCompletion;
use crate::validator::Validator;

/// Segment count cap (spec.md §4.4 step 3): exceeding it is fatal.
const MAX_SEGMENTS: usize = 1024;

const SO_ZEROCOPY: libc::c_int = 60;
const SCM_DEVMEM_TX: libc::c_int = 100; // vendored linux/socket.h ancillary type for tx_dmabuf_id
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

#[repr(C)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// Supplies one payload of `line_size` bytes per iteration: either a
/// validator-generated sequence or a line read from standard input
/// (spec.md §4.4 step 2).
pub enum PayloadSource<'a> {
    Validator { validator: Validator, line_size: usize, remaining: usize },
    Stdin { line_size: usize, reader: &'a mut dyn std::io::BufRead },
}

impl<'a> PayloadSource<'a> {
    /// Returns the next payload, or `None` once the source is exhausted
    /// (spec.md §4.4 step 6: "exits when ... the source is exhausted").
    fn next(&mut self, cumulative: u64) -> DevmemResult<Option<Vec<u8>>> {
        match self {
            PayloadSource::Validator { validator, line_size, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                if *line_size == 0 {
                    return Err(DevmemError::ConfigurationError(
                        "PayloadSource::Validator requires a positive line_size".into(),
                    ));
                }
                let n = (*line_size).min(*remaining);
                let mut buf = vec![0u8; n];
                validator.fill(&mut buf, cumulative);
                *remaining -= n;
                Ok(Some(buf))
            }
            PayloadSource::Stdin { line_size, reader } => {
                let mut line = String::new();
                let n = reader.read_line(&mut line).map_err(DevmemError::Io)?;
                if n == 0 {
                    return Ok(None);
                }
                let mut bytes = line.into_bytes();
                bytes.truncate(*line_size);
                Ok(Some(bytes))
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TxReport {
    pub total_sent: u64,
    pub completions_observed: u64,
}

/// Opens a TCP socket, binds it to `ifname` so egress leaves through
/// the configured device, optionally binds an explicit local address,
/// and connects to `peer_addr` (spec.md §4.4 step 1).
fn connect_for_tx(ifname: &str, peer_addr: SocketAddr, local_addr: Option<IpAddr>) -> DevmemResult<OwnedFd> {
    use nix::sys::socket::{bind, connect, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6};

    let family = if peer_addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)
        .map_err(|e| DevmemError::Io(std::io::Error::from(e)))?;

    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(|e| DevmemError::Io(std::io::Error::from(e)))?;
    setsockopt(&fd, sockopt::BindToDevice, &std::ffi::OsString::from(ifname))
        .map_err(|e| DevmemError::Io(std::io::Error::from(e)))?;

    if let Some(addr) = local_addr {
        match SocketAddr::new(addr, 0) {
            SocketAddr::V4(v4) => bind(fd.as_raw_fd(), &SockaddrIn::from(v4)),
            SocketAddr::V6(v6) => bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)),
        }
        .map_err(|e| DevmemError::Io(std::io::Error::from(e)))?;
    }

    match peer_addr {
        SocketAddr::V4(v4) => connect(fd.as_raw_fd(), &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => connect(fd.as_raw_fd(), &SockaddrIn6::from(v6)),
    }
    .map_err(|e| DevmemError::Io(std::io::Error::from(e)))?;

    Ok(fd)
}

fn chunk_lengths(line_size: usize, max_chunk: usize) -> DevmemResult<Vec<usize>> {
    if max_chunk == 0 {
        return Ok(vec![line_size]);
    }
    let segments = line_size.div_ceil(max_chunk).max(1);
    if segments > MAX_SEGMENTS {
        return Err(DevmemError::ConfigurationError(format!(
            "payload of {line_size} bytes needs {segments} segments at max_chunk={max_chunk}, exceeding the {MAX_SEGMENTS} cap"
        )));
    }
    let mut lens = Vec::with_capacity(segments);
    let mut remaining = line_size;
    for _ in 0..segments {
        let this = remaining.min(max_chunk);
        lens.push(this);
        remaining -= this;
    }
    Ok(lens)
}

fn send_segment(fd: RawFd, dma_offset: u64, len: usize, tx_dmabuf_id: u32) -> DevmemResult<usize> {
    if len == 0 {
        return Ok(0);
    }
    let iov_base = dma_offset as *mut libc::c_void;
    let mut iov = libc::iovec { iov_base, iov_len: len };

    let mut cbuf = [0u8; 32];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(std::mem::size_of::<u32>() as u32) } as usize;

    // SAFETY: `msg.msg_control` points at `cbuf`, which is at least as
    // large as `msg.msg_controllen` and outlives the call.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&mut msg) };
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = SCM_DEVMEM_TX;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<u32>() as u32) as usize;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut u32, tx_dmabuf_id);
    }

    // SAFETY: `msg` is fully populated; the iovec points at an offset
    // within the bound dma-buf, which the kernel interprets relative to
    // the TX binding rather than as a host address.
    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_ZEROCOPY) };
    if n < 0 {
        return Err(DevmemError::Io(std::io::Error::last_os_error()));
    }
    Ok(n as usize)
}

/// Polls the error queue and parses one zero-copy completion, per
/// spec.md §4.4's `wait_completion` algorithm.
fn wait_completion(fd: RawFd, deadline: Duration) -> DevmemResult<TxCompletion> {
    let start = Instant::now();
    loop {
        let remaining = deadline.checked_sub(start.elapsed()).ok_or(DevmemError::CompletionTimeout(
            deadline.as_millis() as u64,
        ))?;

        let mut pfd = libc::pollfd { fd, events: libc::POLLERR, revents: 0 };
        // SAFETY: `pfd` is a single, valid `pollfd`.
        let rc = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
        if rc == 0 {
            return Err(DevmemError::CompletionTimeout(deadline.as_millis() as u64));
        }
        if rc < 0 {
            return Err(DevmemError::Io(std::io::Error::last_os_error()));
        }

        let mut cbuf = [0u8; 256];
        let mut iov_buf = [0u8; 0];
        let mut iov = libc::iovec { iov_base: iov_buf.as_mut_ptr() as *mut libc::c_void, iov_len: 0 };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cbuf.len();

        // SAFETY: `msg` is fully populated; `cbuf` is large enough for
        // one extended-error ancillary message.
        let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                continue;
            }
            return Err(DevmemError::Io(err));
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(DevmemError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "completion message truncated (MSG_CTRUNC)",
            )));
        }

        // SAFETY: `cmsg` is produced by CMSG_FIRSTHDR/CMSG_NXTHDR
        // against `msg`, whose control buffer is still live.
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&mut msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            let is_ip_recverr = (hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR)
                || (hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_RECVERR);
            if is_ip_recverr {
                // SAFETY: the kernel sizes this ancillary message to at
                // least `sizeof(SockExtendedErr)` for IP(V6)_RECVERR.
                let data_ptr = unsafe { libc::CMSG_DATA(cmsg) };
                let ee = unsafe { std::ptr::read_unaligned(data_ptr as *const SockExtendedErr) };
                if ee.ee_origin != SO_EE_ORIGIN_ZEROCOPY || ee.ee_errno != 0 {
                    return Err(DevmemError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("non-zerocopy or errored completion: origin={} errno={}", ee.ee_origin, ee.ee_errno),
                    )));
                }
                return Ok(TxCompletion { lo: ee.ee_info, hi: ee.ee_data });
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&mut msg, cmsg) };
        }
        // No recverr cmsg in this message: loop and poll again within
        // whatever deadline remains.
    }
}

/// Runs the transmit engine to completion (spec.md §4.4).
#[allow(clippy::too_many_arguments)]
pub fn send(
    nic: &dyn NicControlPlane,
    provider: &dyn DeviceBufferProvider,
    ifname: &str,
    peer_addr: SocketAddr,
    local_addr: Option<IpAddr>,
    device_buffer: &mut DeviceBuffer,
    ifindex: u32,
    max_chunk: usize,
    mut source: PayloadSource<'_>,
    waittime: Duration,
) -> DevmemResult<TxReport> {
    let (tx_id, _binding) = nic.bind_tx(ifindex, device_buffer.fd())?;

    let socket = connect_for_tx(ifname, peer_addr, local_addr)?;
    let fd = socket.as_raw_fd();
    let enable: libc::c_int = 1;
    // SAFETY: `enable` outlives the call; `fd` is a valid, connected
    // socket.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_ZEROCOPY,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(DevmemError::Io(std::io::Error::last_os_error()));
    }

    let mut total_sent: u64 = 0;
    let mut completions_observed: u64 = 0;
    let device_size = device_buffer.size() as u64;

    loop {
        if total_sent >= device_size {
            break;
        }
        let payload = match source.next(total_sent)? {
            Some(p) => p,
            None => break,
        };
        // An empty payload (spec.md §4.4 boundary behavior: line_size ==
        // 0) falls through to the ordinary path below: `chunk_lengths`
        // already returns a single zero-length segment for it, and
        // `send_segment` issues a real zero-length `sendmsg` that
        // returns 0 with no completion to wait for.
        let dst_off = (total_sent % device_size) as usize;
        provider.copy_host_to_device(device_buffer, dst_off, &payload)?;

        let lengths = chunk_lengths(payload.len(), max_chunk)?;
        let mut offset_in_payload = 0usize;
        for len in lengths {
            let dma_offset = device_buffer.offset() + dst_off as u64 + offset_in_payload as u64;
            let sent = send_segment(fd, dma_offset, len, tx_id.0)?;
            total_sent += sent as u64;
            offset_in_payload += len;

            if sent > 0 {
                let completion = wait_completion(fd, waittime)?;
                if !completion.is_well_formed() {
                    return Err(DevmemError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "completion range hi < lo",
                    )));
                }
                completions_observed += 1;
            }
        }
    }

    Ok(TxReport { total_sent, completions_observed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_splits_and_trims_the_remainder() {
        let lens = chunk_lengths(10, 4).unwrap();
        assert_eq!(lens, vec![4, 4, 2]);
    }

    #[test]
    fn unchunked_payload_is_a_single_segment() {
        let lens = chunk_lengths(4096, 0).unwrap();
        assert_eq!(lens, vec![4096]);
    }

    #[test]
    fn excessive_segment_count_is_configuration_error() {
        let err = chunk_lengths(2_000_000, 1).unwrap_err();
        assert!(matches!(err, DevmemError::ConfigurationError(_)));
    }

    #[test]
    fn zero_length_payload_needs_one_empty_segment() {
        let lens = chunk_lengths(0, 64).unwrap();
        assert_eq!(lens, vec![0]);
    }

    #[test]
    fn validator_source_with_zero_line_size_errors_instead_of_spinning() {
        let mut source =
            PayloadSource::Validator { validator: Validator::new(7), line_size: 0, remaining: 1024 };
        let err = source.next(0).unwrap_err();
        assert!(matches!(err, DevmemError::ConfigurationError(_)));
    }

    #[test]
    fn validator_source_reports_exhaustion_before_line_size_is_checked() {
        let mut source =
            PayloadSource::Validator { validator: Validator::new(7), line_size: 0, remaining: 0 };
        assert!(source.next(0).unwrap().is_none());
    }
}
