//! Integration coverage for the self-test role (spec.md §4.5, §8
//! scenario 3) against [`MockNicControl`], run through the public
//! `orchestrator::run_with` entry point rather than the private
//! `self_test` function the in-crate unit tests exercise directly.

use devmem_nc::cli::{Config, Role};
use devmem_nc::device::MemfdDeviceBufferProvider;
use devmem_nc::nic::mock::MockNicControl;
use devmem_nc::nic::NicControlPlane;
use devmem_nc::orchestrator::{self, Outcome};

fn self_test_config() -> Config {
    Config {
        role: Role::SelfTest,
        ifname: "mock0".into(),
        ifindex: 7,
        bind_addr: None,
        peer_addr: None,
        client_addr: None,
        port: 0,
        start_queue: 4,
        queue_count: 4,
        validate_modulus: None,
        max_chunk: 0,
        use_ethtool_binary: false,
    }
}

#[test]
fn self_test_role_succeeds_end_to_end_through_the_public_entry_point() {
    let nic = MockNicControl::new();
    nic.configure_channels(7, 8, 8).unwrap();
    let provider = MemfdDeviceBufferProvider::new();

    let outcome = orchestrator::run_with(&self_test_config(), &nic, &provider).unwrap();
    assert!(matches!(outcome, Outcome::SelfTestPassed));
}

#[test]
fn self_test_fails_loudly_when_the_nic_has_too_few_channels() {
    let nic = MockNicControl::new();
    // Leave the default 4 channels in place; the config's queue range
    // (4..8) exceeds that, so bind_rx must reject queue 4 as invalid.
    let provider = MemfdDeviceBufferProvider::new();

    let result = orchestrator::run_with(&self_test_config(), &nic, &provider);
    assert!(result.is_err());
}
