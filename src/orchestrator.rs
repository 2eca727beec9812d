//! Role dispatch and the self-test sequence (spec.md §4.5).
//!
//! Grounded on the teacher's `*_main` entry functions in
//! `apps/ifconfig.rs`/`apps/nc.rs`: "read/validate one thing, then the
//! next, bail on first failure" — generalized here to sequence
//! provider → NIC control plane → socket per spec.md §2's dependency
//! edges.

use std::io::BufRead;
use std::time::Duration;

use crate::cli::{Config, Role, DEFAULT_LINE_SIZE};
use crate::device::{DeviceBufferProvider, MemfdDeviceBufferProvider};
use crate::error::{DevmemError, DevmemResult};
use crate::nic::{LinuxNicControl, NicControlPlane};
use crate::rx::{self, RxReport};
use crate::tx::{self, PayloadSource, TxReport};
use crate::types::QueueId;
use crate::validator::Validator;

/// Default TX completion deadline (spec.md §5: "waittime_ms, default
/// 500-1000 ms").
const DEFAULT_WAITTIME: Duration = Duration::from_millis(750);

pub enum Outcome {
    Received(RxReport),
    Sent(TxReport),
    SelfTestPassed,
}

/// Runs the role `config` selects, against the real Linux NIC control
/// plane and the default (memfd-backed) device buffer provider.
pub fn run(config: &Config) -> DevmemResult<Outcome> {
    let nic = LinuxNicControl::with_ethtool_binary(config.ifname.clone(), config.use_ethtool_binary);
    let provider = MemfdDeviceBufferProvider::new();
    run_with(config, &nic, &provider)
}

/// Same as [`run`], parameterized over the NIC control plane and device
/// buffer provider — the seam the self-test and the integration suite
/// both use to substitute [`crate::nic::mock::MockNicControl`] and
/// exercise every failure mode without real hardware.
pub fn run_with(
    config: &Config,
    nic: &dyn NicControlPlane,
    provider: &dyn DeviceBufferProvider,
) -> DevmemResult<Outcome> {
    match config.role {
        Role::Listen => run_listen(config, nic, provider).map(Outcome::Received),
        Role::Send => run_send(config, nic, provider).map(Outcome::Sent),
        Role::SelfTest => self_test(config, nic, provider).map(|()| Outcome::SelfTestPassed),
    }
}

fn run_listen(
    config: &Config,
    nic: &dyn NicControlPlane,
    provider: &dyn DeviceBufferProvider,
) -> DevmemResult<RxReport> {
    let bind_addr = config.bind_addr.ok_or_else(|| {
        DevmemError::ConfigurationError("listener role requires a bind address".into())
    })?;
    let device_buffer = provider.allocate(crate::cli::DEFAULT_BUFFER_SIZE)?;
    let validator = config.validate_modulus.map(Validator::new);

    rx::serve(
        nic,
        provider,
        bind_addr,
        config.client_addr,
        &device_buffer,
        config.ifindex,
        config.start_queue,
        config.queue_count,
        validator,
    )
}

fn run_send(
    config: &Config,
    nic: &dyn NicControlPlane,
    provider: &dyn DeviceBufferProvider,
) -> DevmemResult<TxReport> {
    let peer_addr = config.peer_addr.ok_or_else(|| {
        DevmemError::ConfigurationError("sender role requires a peer address".into())
    })?;
    let mut device_buffer = provider.allocate(crate::cli::DEFAULT_BUFFER_SIZE)?;

    let local_addr = config.client_addr;

    let report = if let Some(modulus) = config.validate_modulus {
        let source = PayloadSource::Validator {
            validator: Validator::new(modulus),
            line_size: DEFAULT_LINE_SIZE,
            remaining: device_buffer.size(),
        };
        tx::send(
            nic,
            provider,
            &config.ifname,
            peer_addr,
            local_addr,
            &mut device_buffer,
            config.ifindex,
            config.max_chunk,
            source,
            DEFAULT_WAITTIME,
        )?
    } else {
        let stdin = std::io::stdin();
        let mut locked = stdin.lock();
        let source = PayloadSource::Stdin {
            line_size: DEFAULT_LINE_SIZE,
            reader: &mut locked as &mut dyn BufRead,
        };
        tx::send(
            nic,
            provider,
            &config.ifname,
            peer_addr,
            local_addr,
            &mut device_buffer,
            config.ifindex,
            config.max_chunk,
            source,
            DEFAULT_WAITTIME,
        )?
    };

    Ok(report)
}

/// Exercises the NIC control plane's failure modes as positive
/// properties (spec.md §4.5). Any deviation from the expected
/// success/failure pattern at each step is fatal.
fn self_test(
    config: &Config,
    nic: &dyn NicControlPlane,
    provider: &dyn DeviceBufferProvider,
) -> DevmemResult<()> {
    let device_buffer = provider.allocate(crate::cli::DEFAULT_BUFFER_SIZE)?;
    let ifindex = config.ifindex;
    let queues: Vec<QueueId> = (config.start_queue..config.start_queue + config.queue_count)
        .map(QueueId::rx)
        .collect();

    // 1. configure_rss and set_header_split(on) must succeed.
    nic.configure_rss(ifindex, config.start_queue.max(1))?;
    nic.set_header_split(ifindex, true)?;

    // 2. Binding a zero-queue empty list must fail.
    if nic.bind_rx(ifindex, device_buffer.fd(), &[]).is_ok() {
        return Err(DevmemError::ConfigurationError(
            "self-test: bind_rx with an empty queue list unexpectedly succeeded".into(),
        ));
    }

    // 3. Binding any queue while header split is off must fail.
    nic.set_header_split(ifindex, false)?;
    if nic.bind_rx(ifindex, device_buffer.fd(), &queues).is_ok() {
        return Err(DevmemError::KernelUnsupported(
            "self-test: bind_rx succeeded with header split off".into(),
        ));
    }

    // 4. After re-enabling split, binding succeeds and yields a handle.
    nic.set_header_split(ifindex, true)?;
    let (_id, handle) = nic.bind_rx(ifindex, device_buffer.fd(), &queues)?;

    // 5. While the handle is alive, shrinking channels to deactivate a
    // bound queue must fail.
    let shrink_to = config.start_queue;
    if nic.configure_channels(ifindex, shrink_to, shrink_to).is_ok() {
        return Err(DevmemError::ConfigurationError(
            "self-test: configure_channels shrank below a bound queue without error".into(),
        ));
    }

    // 6. Destroying the handle must succeed and release the binding.
    drop(handle);
    nic.configure_channels(ifindex, config.start_queue + config.queue_count, config.start_queue + config.queue_count)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Role;
    use crate::nic::mock::MockNicControl;
    use std::net::IpAddr;

    fn self_test_config() -> Config {
        Config {
            role: Role::SelfTest,
            ifname: "mock0".into(),
            ifindex: 1,
            bind_addr: None,
            peer_addr: None,
            client_addr: None::<IpAddr>,
            port: 0,
            start_queue: 4,
            queue_count: 4,
            validate_modulus: None,
            max_chunk: 0,
            use_ethtool_binary: false,
        }
    }

    #[test]
    fn self_test_passes_against_the_mock_nic() {
        let nic = MockNicControl::new();
        nic.configure_channels(1, 8, 8).unwrap();
        let provider = MemfdDeviceBufferProvider::new();
        let cfg = self_test_config();
        let result = self_test(&cfg, &nic, &provider);
        assert!(result.is_ok(), "{result:?}");
    }
}
