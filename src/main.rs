//! Thin entry point: parse args, build the NIC control plane enough to
//! learn the total queue count, resolve the full [`Config`], dispatch,
//! and map the result to an exit code.

use clap::Parser;
use devmem_nc::cli::{Cli, Config};
use devmem_nc::nic::LinuxNicControl;
use devmem_nc::{nic, orchestrator};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ifindex = nic::resolve_ifindex(&cli.ifname)?;
    let control = LinuxNicControl::with_ethtool_binary(cli.ifname.clone(), cli.use_ethtool_binary);
    let total_queues = control.rx_queue_count(ifindex)?;

    let config = Config::resolve(cli, total_queues)?;

    match orchestrator::run(&config)? {
        orchestrator::Outcome::Received(report) => {
            tracing::info!(?report, "receive engine finished");
        }
        orchestrator::Outcome::Sent(report) => {
            tracing::info!(?report, "transmit engine finished");
        }
        orchestrator::Outcome::SelfTestPassed => {
            tracing::info!("self-test passed");
        }
    }

    Ok(())
}
