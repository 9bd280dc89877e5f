use std::{path::Path, sync::Arc};

use anyhow::{ensure, Result};
use nix::unistd::geteuid;
use proc_common::{log_error, procfs::Procfs};
use shunt_core::{
    firewall::{FirewallBackend, IptablesBackend},
    routing::RouteController,
    shell::{CommandExecutor, ShellExecutor},
    split_tunnel::start_split_tunnel,
};
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::ShuntdOpts;

mod config;

pub use config::DaemonConfig;

pub async fn run(options: &ShuntdOpts) -> Result<()> {
    log::trace!("shuntd options: {:?}", options);

    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    let config_file = Path::new(&options.config_file);
    let config = DaemonConfig::load(config_file)?;

    let executor: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor);
    let firewall: Arc<dyn FirewallBackend> = Arc::new(IptablesBackend::new(executor.clone()));
    let routing = RouteController::new(executor, firewall);

    let split_tunnel = start_split_tunnel(Procfs::new(), config.cgroups.clone(), routing);

    // A failed subscription is not fatal for the daemon: it keeps running
    // without split tunneling and a SIGHUP can retry.
    let mut connected = match split_tunnel
        .connect(config.firewall_params(), config.tunnel_params())
        .await
    {
        Ok(()) => true,
        Err(err) => {
            log_error("split tunneling could not start", err);
            false
        }
    };

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sig_int.recv() => {
                log::trace!("SIGINT received");
                break;
            }
            _ = sig_term.recv() => {
                log::trace!("SIGTERM received");
                break;
            }
            _ = sig_hup.recv() => {
                log::info!("SIGHUP received, reloading {}", config_file.display());
                match DaemonConfig::load(config_file) {
                    Ok(config) if connected => {
                        split_tunnel
                            .update(config.firewall_params(), config.tunnel_params())
                            .await;
                    }
                    Ok(config) => {
                        connected = split_tunnel
                            .connect(config.firewall_params(), config.tunnel_params())
                            .await
                            .map_err(|err| log_error("split tunneling could not start", err))
                            .is_ok();
                    }
                    Err(err) => log::warn!("keeping the previous configuration: {err:#}"),
                }
            }
        }
    }

    log::info!("Terminating shuntd...");
    split_tunnel.disconnect().await;

    Ok(())
}
