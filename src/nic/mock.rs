//! In-memory stand-in for [`NicControlPlane`], used by unit tests and
//! the integration suite to exercise spec.md §8's invariants without a
//! real NIC, root, or a 6.12+ kernel.
//!
//! Mirrors real kernel policy closely enough to make those invariants
//! testable: header split gates RX binding, channel counts gate queue
//! indices, and a shrink below a bound queue's index is rejected.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{DevmemError, DevmemResult};
use crate::nic::{BindingHandle, NicControlPlane};
use crate::types::{DmabufBindingRxId, DmabufBindingTxId, QueueId, QueueKind};

#[derive(Debug)]
struct MockBindingHandle {
    id: u32,
    bound: std::sync::Arc<Mutex<HashSet<u32>>>,
}

impl BindingHandle for MockBindingHandle {}

impl Drop for MockBindingHandle {
    fn drop(&mut self) {
        self.bound.lock().unwrap().remove(&self.id);
    }
}

/// Tracks split state, channel counts, and bound queue indices entirely
/// in memory. `RefCell`/`Mutex` stand in for what the real kernel holds
/// behind a syscall boundary — interior mutability through a `&self`
/// trait method, the same shape `NicControlPlane` requires of the real
/// implementation.
pub struct MockNicControl {
    split_on: RefCell<bool>,
    rx_channels: RefCell<u32>,
    tx_channels: RefCell<u32>,
    bound_rx_queues: std::sync::Arc<Mutex<HashSet<u32>>>,
    bound_tx_ids: std::sync::Arc<Mutex<HashSet<u32>>>,
    next_binding_id: RefCell<u32>,
    pub flow_rules_installed: RefCell<u32>,
    pub reset_calls: RefCell<u32>,
}

impl Default for MockNicControl {
    fn default() -> Self {
        Self {
            split_on: RefCell::new(false),
            rx_channels: RefCell::new(4),
            tx_channels: RefCell::new(4),
            bound_rx_queues: std::sync::Arc::new(Mutex::new(HashSet::new())),
            bound_tx_ids: std::sync::Arc::new(Mutex::new(HashSet::new())),
            next_binding_id: RefCell::new(1),
            flow_rules_installed: RefCell::new(0),
            reset_calls: RefCell::new(0),
        }
    }
}

impl MockNicControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u32 {
        let mut n = self.next_binding_id.borrow_mut();
        let id = *n;
        *n += 1;
        id
    }
}

impl NicControlPlane for MockNicControl {
    fn rx_queue_count(&self, _ifindex: u32) -> DevmemResult<u32> {
        Ok(*self.rx_channels.borrow())
    }

    fn set_header_split(&self, _ifindex: u32, on: bool) -> DevmemResult<bool> {
        *self.split_on.borrow_mut() = on;
        Ok(on)
    }

    fn reset_flow_steering(&self, _ifindex: u32) {
        *self.reset_calls.borrow_mut() += 1;
        *self.flow_rules_installed.borrow_mut() = 0;
    }

    fn configure_rss(&self, _ifindex: u32, n: u32) -> DevmemResult<()> {
        if n == 0 {
            return Err(DevmemError::ConfigurationError(
                "configure_rss requires n > 0".into(),
            ));
        }
        Ok(())
    }

    fn configure_channels(&self, _ifindex: u32, rx: u32, tx: u32) -> DevmemResult<()> {
        let bound = self.bound_rx_queues.lock().unwrap();
        if let Some(&max_bound) = bound.iter().max() {
            if max_bound >= rx {
                return Err(DevmemError::ConfigurationError(format!(
                    "cannot shrink RX channels to {rx}: queue {max_bound} is bound"
                )));
            }
        }
        drop(bound);
        *self.rx_channels.borrow_mut() = rx;
        *self.tx_channels.borrow_mut() = tx;
        Ok(())
    }

    fn install_flow_rule(
        &self,
        _ifindex: u32,
        _server_addr: std::net::IpAddr,
        _client_addr: Option<std::net::IpAddr>,
        _port: u16,
        _queue: u32,
    ) -> DevmemResult<()> {
        *self.flow_rules_installed.borrow_mut() += 1;
        Ok(())
    }

    fn bind_rx(
        &self,
        _ifindex: u32,
        _fd: std::os::fd::RawFd,
        queues: &[QueueId],
    ) -> DevmemResult<(DmabufBindingRxId, Box<dyn BindingHandle>)> {
        if queues.is_empty() {
            return Err(DevmemError::ConfigurationError(
                "bind_rx requires a non-empty queue list".into(),
            ));
        }
        if !*self.split_on.borrow() {
            return Err(DevmemError::KernelUnsupported(
                "bind_rx requires header/data split to already be on".into(),
            ));
        }
        let rx_channels = *self.rx_channels.borrow();
        for q in queues {
            if q.kind != QueueKind::Rx || q.index >= rx_channels {
                return Err(DevmemError::ConfigurationError(format!(
                    "queue {q:?} is not a valid RX queue for {rx_channels} channels"
                )));
            }
        }

        let mut bound = self.bound_rx_queues.lock().unwrap();
        for q in queues {
            bound.insert(q.index);
        }
        drop(bound);

        let id = self.next_id();
        Ok((
            DmabufBindingRxId(id),
            Box::new(MockBindingHandle { id, bound: self.bound_rx_queues.clone() }),
        ))
    }

    fn bind_tx(
        &self,
        _ifindex: u32,
        _fd: std::os::fd::RawFd,
    ) -> DevmemResult<(DmabufBindingTxId, Box<dyn BindingHandle>)> {
        let id = self.next_id();
        self.bound_tx_ids.lock().unwrap().insert(id);
        Ok((
            DmabufBindingTxId(id),
            Box::new(MockBindingHandle { id, bound: self.bound_tx_ids.clone() }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_rx_fails_without_header_split() {
        let nic = MockNicControl::new();
        let err = nic.bind_rx(1, 3, &[QueueId::rx(0)]).unwrap_err();
        assert!(matches!(err, DevmemError::KernelUnsupported(_)));
    }

    #[test]
    fn bind_rx_fails_on_empty_queue_list() {
        let nic = MockNicControl::new();
        nic.set_header_split(1, true).unwrap();
        let err = nic.bind_rx(1, 3, &[]).unwrap_err();
        assert!(matches!(err, DevmemError::ConfigurationError(_)));
    }

    #[test]
    fn bind_rx_succeeds_once_split_is_on() {
        let nic = MockNicControl::new();
        nic.set_header_split(1, true).unwrap();
        let (id, _handle) = nic.bind_rx(1, 3, &[QueueId::rx(0)]).unwrap();
        assert_eq!(id.0, 1);
    }

    #[test]
    fn shrinking_channels_below_a_bound_queue_fails() {
        let nic = MockNicControl::new();
        nic.set_header_split(1, true).unwrap();
        let (_id, _handle) = nic.bind_rx(1, 3, &[QueueId::rx(2)]).unwrap();
        let err = nic.configure_channels(1, 2, 2).unwrap_err();
        assert!(matches!(err, DevmemError::ConfigurationError(_)));
    }

    #[test]
    fn dropping_the_handle_releases_the_binding_so_rebind_succeeds() {
        let nic = MockNicControl::new();
        nic.set_header_split(1, true).unwrap();
        let (_id, handle) = nic.bind_rx(1, 3, &[QueueId::rx(0)]).unwrap();
        drop(handle);
        assert!(nic.configure_channels(1, 0, 0).is_ok());
        nic.configure_channels(1, 4, 4).unwrap();
        assert!(nic.bind_rx(1, 3, &[QueueId::rx(0)]).is_ok());
    }
}
