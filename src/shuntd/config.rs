use std::path::Path;

use anyhow::{Context, Result};
use proc_common::cgroup::CgroupPaths;
use shunt_core::params::{FirewallParams, NetworkScan, TunnelParams};

const DEFAULT_EXCLUSIONS_PROCS: &str = "/sys/fs/cgroup/net_cls/shunt.bypass/cgroup.procs";
const DEFAULT_VPN_ONLY_PROCS: &str = "/sys/fs/cgroup/net_cls/shunt.vpnonly/cgroup.procs";
const DEFAULT_PARENT_PROCS: &str = "/sys/fs/cgroup/net_cls/cgroup.procs";

/// Daemon configuration, backed by an `INI` file.
///
/// The `[network]` and `[tunnel]` sections may be absent or partial while
/// the uplink or the tunnel are not up yet; the engine treats the missing
/// pieces the same way it treats a lost uplink at runtime. App lists are
/// `:`-separated absolute paths.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub cgroups: CgroupPaths,
    pub net_scan: NetworkScan,
    pub tunnel: TunnelParams,
    pub exclude_apps: Vec<String>,
    pub vpn_only_apps: Vec<String>,
}

impl DaemonConfig {
    pub fn load(config_file: &Path) -> Result<Self> {
        let conf = ini::Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

        let get = |section: &str, key: &str| -> String {
            conf.section(Some(section))
                .and_then(|properties| properties.get(key))
                .unwrap_or_default()
                .to_string()
        };
        let get_or = |section: &str, key: &str, default: &str| -> String {
            let value = get(section, key);
            if value.is_empty() {
                default.to_string()
            } else {
                value
            }
        };

        Ok(Self {
            cgroups: CgroupPaths {
                exclusions: get_or("cgroup", "exclusions_procs", DEFAULT_EXCLUSIONS_PROCS).into(),
                vpn_only: get_or("cgroup", "vpn_only_procs", DEFAULT_VPN_ONLY_PROCS).into(),
                parent: get_or("cgroup", "parent_procs", DEFAULT_PARENT_PROCS).into(),
            },
            net_scan: NetworkScan {
                interface_name: get("network", "interface"),
                ip_address: get("network", "ip_address"),
                gateway_ip: get("network", "gateway_ip"),
            },
            tunnel: TunnelParams {
                device_name: get("tunnel", "device"),
                local_address: get("tunnel", "local_address"),
                remote_address: get("tunnel", "remote_address"),
            },
            exclude_apps: split_paths(&get("apps", "exclude")),
            vpn_only_apps: split_paths(&get("apps", "vpn_only")),
        })
    }

    pub fn firewall_params(&self) -> FirewallParams {
        FirewallParams {
            net_scan: self.net_scan.clone(),
            exclude_apps: self.exclude_apps.clone(),
            vpn_only_apps: self.vpn_only_apps.clone(),
        }
    }

    pub fn tunnel_params(&self) -> TunnelParams {
        self.tunnel.clone()
    }
}

fn split_paths(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_owned)
        .collect()
}
