//! Receive engine (spec.md §4.3): NIC sequencing, accept-one-connection
//! listener, the dmTCP control-message read loop, fragment-offset
//! contiguity accounting, token return, and validation.
//!
//! Raw `libc::recvmsg`/cmsg walking is used rather than `nix`'s
//! `ControlMessageOwned`, which does not decode `SCM_DEVMEM_DMABUF`/
//! `SCM_DEVMEM_LINEAR` — grounded on
//! `other_examples/…DataDog-libdatadog…unix_socket_communication.rs.rs`
//! for the ancillary-message discipline, translated to raw cmsg walking
//! where the higher-level crate has no decoder for a newer message type.

use std::net::{IpAddr, SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::thread::sleep;
use std::time::Duration;

use crate::device::{DeviceBuffer, DeviceBufferProvider};
use crate::error::{DevmemError, DevmemResult};
use crate::nic::NicControlPlane;
use crate::types::{ContiguityTracker, FragmentToken, QueueId};
use crate::validator::Validator;

/// NIC settling time after an RSS reprogram (spec.md §4.3 step 1).
const RSS_SETTLE: Duration = Duration::from_millis(50);

/// Number of fragment-descriptor-shaped cmsg entries the control-data
/// buffer is sized to hold per `recvmsg` call (DESIGN.md Open Question
/// 3: a documented constant rather than the source's empirical ~800 KiB).
const CMSG_BUF_FRAGMENTS: usize = 256;

// linux/socket.h / linux/uio.h constants (vendored; see nic/ethtool.rs
// for the same vendoring discipline applied to ethtool_netlink.h).
const MSG_SOCK_DEVMEM: libc::c_int = 0x2000000;
const SCM_DEVMEM_DMABUF: libc::c_int = 98;
const SCM_DEVMEM_LINEAR: libc::c_int = 99;
const SO_DEVMEM_DONTNEED: libc::c_int = 97;

#[repr(C)]
struct DmabufCmsg {
    frag_offset: u64,
    frag_size: u32,
    frag_token: u32,
    dmabuf_id: u32,
    flags: u32,
}

#[repr(C)]
struct DmabufToken {
    token_start: u32,
    token_count: u32,
}

/// Diagnostic counters reported at shutdown (spec.md §4.3: "diagnostic,
/// not load-bearing").
#[derive(Debug, Default, Clone, Copy)]
pub struct RxReport {
    pub total_received: u64,
    pub page_aligned_frags: u64,
    pub non_page_aligned_frags: u64,
    pub linear_frags: u64,
    pub validation_mismatches: u32,
}

fn release_token(fd: RawFd, token: FragmentToken) -> DevmemResult<()> {
    let payload = DmabufToken { token_start: token.start, token_count: token.count };
    // SAFETY: `payload` outlives the call; `fd` is a valid, open socket.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_DEVMEM_DONTNEED,
            &payload as *const DmabufToken as *const libc::c_void,
            std::mem::size_of::<DmabufToken>() as libc::socklen_t,
        )
    };
    // Per DESIGN.md Open Question 1: success is `Ok(())`, not a literal
    // return-value-equals-one check.
    if rc != 0 {
        return Err(DevmemError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

struct CmsgWalk<'a> {
    hdr: *mut libc::msghdr,
    cur: *mut libc::cmsghdr,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> CmsgWalk<'a> {
    fn new(hdr: *mut libc::msghdr) -> Self {
        // SAFETY: `hdr` points at a `msghdr` populated by a prior
        // `recvmsg` call whose `msg_control` buffer is still live.
        let cur = unsafe { libc::CMSG_FIRSTHDR(hdr) };
        Self { hdr, cur, _marker: std::marker::PhantomData }
    }
}

impl<'a> Iterator for CmsgWalk<'a> {
    type Item = *mut libc::cmsghdr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        let item = self.cur;
        // SAFETY: `item` is non-null and was produced by a previous
        // CMSG_FIRSTHDR/CMSG_NXTHDR call against the same `hdr`.
        self.cur = unsafe { libc::CMSG_NXTHDR(self.hdr, item) };
        Some(item)
    }
}

struct RxState {
    staging: DeviceBuffer,
    cumulative: u64,
    contiguity: ContiguityTracker,
    validator: Option<Validator>,
    validation_mismatches: u32,
    linear_frags: u64,
    binding_id: u32,
}

impl RxState {
    /// Copies one DMABUF-variant fragment from the shared device buffer
    /// into the contiguous staging region (spec.md §4.3 step 3), then
    /// releases its token. The staging region is a ring sized to
    /// `device_buffer.size()`; a fragment straddling the wrap point is
    /// split into two device-to-device copies (and, under validation,
    /// two checks against the corresponding cumulative offsets) rather
    /// than dropped — every fragment is copied and validated
    /// unconditionally, matching spec.md §4.3.
    #[allow(clippy::too_many_arguments)]
    fn process_dmabuf(
        &mut self,
        provider: &dyn DeviceBufferProvider,
        device_buffer: &DeviceBuffer,
        fd: RawFd,
        frag_offset: u64,
        frag_size: u32,
        frag_token: u32,
        dmabuf_id: u32,
    ) -> DevmemResult<()> {
        if dmabuf_id != self.binding_id {
            return Err(DevmemError::FlowSteeringLeak(format!(
                "fragment dmabuf_id {dmabuf_id} != active RX binding {}",
                self.binding_id
            )));
        }

        self.contiguity.record(frag_offset, frag_size);

        let len = frag_size as usize;
        let staging_size = self.staging.size();
        let dst_off = (self.cumulative % staging_size as u64) as usize;
        let first_len = len.min(staging_size - dst_off);

        provider.copy_device_to_device(
            &mut self.staging,
            dst_off,
            device_buffer,
            frag_offset as usize,
            first_len,
        )?;
        if let Some(v) = self.validator {
            let region = self.staging.read_at(dst_off, first_len)?;
            self.validation_mismatches += v.check(&region, self.cumulative);
        }

        if first_len < len {
            let second_len = len - first_len;
            provider.copy_device_to_device(
                &mut self.staging,
                0,
                device_buffer,
                frag_offset as usize + first_len,
                second_len,
            )?;
            if let Some(v) = self.validator {
                let region = self.staging.read_at(0, second_len)?;
                self.validation_mismatches +=
                    v.check(&region, self.cumulative + first_len as u64);
            }
        }

        self.cumulative += frag_size as u64;
        release_token(fd, FragmentToken::single(frag_token))?;
        Ok(())
    }
}

/// Runs the receive engine to completion: NIC sequencing, one accepted
/// connection, the dmTCP read loop, and clean shutdown (spec.md §4.3).
#[allow(clippy::too_many_arguments)]
pub fn serve(
    nic: &dyn NicControlPlane,
    provider: &dyn DeviceBufferProvider,
    listen_addr: SocketAddr,
    client_addr: Option<IpAddr>,
    device_buffer: &DeviceBuffer,
    ifindex: u32,
    start_queue: u32,
    queue_count: u32,
    validator: Option<Validator>,
) -> DevmemResult<RxReport> {
    if queue_count == 0 {
        return Err(DevmemError::ConfigurationError(
            "queue_count must be > 0".into(),
        ));
    }
    let queues: Vec<QueueId> = (start_queue..start_queue + queue_count).map(QueueId::rx).collect();

    nic.reset_flow_steering(ifindex);
    nic.set_header_split(ifindex, true)?;
    nic.configure_rss(ifindex, start_queue)?;
    nic.install_flow_rule(ifindex, listen_addr.ip(), client_addr, listen_addr.port(), start_queue)?;
    sleep(RSS_SETTLE);
    let (binding_id, _binding) = nic.bind_rx(ifindex, device_buffer.fd(), &queues)?;

    let listener = TcpListener::bind(listen_addr).map_err(DevmemError::Io)?;
    // `listen(2)` backlog is fixed at 1: spec.md §4.3 accepts exactly
    // one connection per invocation.
    let (stream, _peer) = listener.accept().map_err(DevmemError::Io)?;
    let fd = stream.as_raw_fd();

    let staging = provider.allocate(device_buffer.size())?;
    let mut state = RxState {
        staging,
        cumulative: 0,
        contiguity: ContiguityTracker::new(),
        validator,
        validation_mismatches: 0,
        linear_frags: 0,
        binding_id: binding_id.0,
    };

    let mut control_buf = vec![0u8; CMSG_BUF_FRAGMENTS * std::mem::size_of::<DmabufCmsg>() + 256];
    let mut data_buf = [0u8; 4096];

    loop {
        let mut iov = libc::iovec {
            iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: data_buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control_buf.len();

        // SAFETY: `msg` is a freshly zeroed, correctly populated
        // `msghdr` whose buffers outlive the call.
        let n = unsafe { libc::recvmsg(fd, &mut msg, MSG_SOCK_DEVMEM) };

        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                continue;
            }
            tracing::warn!(error = %err, "recvmsg soft error, continuing");
            continue;
        }
        if n == 0 {
            break; // peer closed cleanly
        }

        let mut saw_devmem_descriptor = false;
        for cmsg in CmsgWalk::new(&mut msg) {
            // SAFETY: `cmsg` was produced by CMSG_FIRSTHDR/CMSG_NXTHDR
            // against `msg`, whose control buffer is still live.
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level != libc::SOL_SOCKET {
                continue;
            }
            let data_ptr = unsafe { libc::CMSG_DATA(cmsg) };

            if hdr.cmsg_type == SCM_DEVMEM_DMABUF {
                saw_devmem_descriptor = true;
                // SAFETY: the kernel sizes this ancillary message to
                // exactly `sizeof(DmabufCmsg)` for this cmsg type.
                let desc = unsafe { std::ptr::read_unaligned(data_ptr as *const DmabufCmsg) };
                state.process_dmabuf(
                    provider,
                    device_buffer,
                    fd,
                    desc.frag_offset,
                    desc.frag_size,
                    desc.frag_token,
                    desc.dmabuf_id,
                )?;
            } else if hdr.cmsg_type == SCM_DEVMEM_LINEAR {
                saw_devmem_descriptor = true;
                state.linear_frags += 1;
            }
        }

        if !saw_devmem_descriptor {
            return Err(DevmemError::FlowSteeringLeak(
                "received message carried no devmem descriptors while dmTCP was expected".into(),
            ));
        }

        if let Some(v) = state.validator {
            if state.validation_mismatches > v.mismatch_threshold {
                return Err(DevmemError::ValidationFailure {
                    mismatches: state.validation_mismatches,
                    threshold: v.mismatch_threshold,
                });
            }
        }
    }

    Ok(RxReport {
        total_received: state.cumulative,
        page_aligned_frags: state.contiguity.page_aligned_frags,
        non_page_aligned_frags: state.contiguity.non_page_aligned_frags,
        linear_frags: state.linear_frags,
        validation_mismatches: state.validation_mismatches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemfdDeviceBufferProvider;

    fn fresh_state(provider: &MemfdDeviceBufferProvider, size: usize, binding_id: u32) -> RxState {
        RxState {
            staging: provider.allocate(size).unwrap(),
            cumulative: 0,
            contiguity: ContiguityTracker::new(),
            validator: None,
            validation_mismatches: 0,
            linear_frags: 0,
            binding_id,
        }
    }

    #[test]
    fn mismatched_dmabuf_id_is_a_flow_steering_leak() {
        let provider = MemfdDeviceBufferProvider::new();
        let page = 4096;
        let src = provider.allocate(page).unwrap();
        let mut state = fresh_state(&provider, page, 42);

        let err = state
            .process_dmabuf(&provider, &src, -1, 0, 64, 1, 99)
            .unwrap_err();
        assert!(matches!(err, DevmemError::FlowSteeringLeak(_)));
    }

    #[test]
    fn fragment_straddling_the_wrap_point_is_split_into_two_copies() {
        let provider = MemfdDeviceBufferProvider::new();
        let page = 4096;
        let mut src = provider.allocate(page).unwrap();
        let payload: Vec<u8> = (0..20u8).collect();
        provider.copy_host_to_device(&mut src, 0, &payload).unwrap();

        let mut state = fresh_state(&provider, page, 7);
        state.cumulative = (page - 10) as u64;

        state.process_dmabuf(&provider, &src, -1, 0, 20, 1, 7).unwrap();

        let tail = state.staging.read_at(page - 10, 10).unwrap();
        let head = state.staging.read_at(0, 10).unwrap();
        assert_eq!(tail, payload[0..10]);
        assert_eq!(head, payload[10..20]);
        assert_eq!(state.cumulative, (page - 10) as u64 + 20);
    }
}
