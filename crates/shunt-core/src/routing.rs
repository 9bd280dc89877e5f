//! Non-process kernel state: masquerade anchor content, policy routing
//! tables, source-ip rules and the reverse-path filter.

use std::sync::Arc;

use crate::{
    firewall::{AnchorFamily, AnchorTable, FirewallBackend, NAT_ANCHOR, TAG_ANCHOR},
    shell::CommandExecutor,
};

/// Routing table consulted by traffic that bypasses the tunnel.
pub const BYPASS_TABLE: &str = "vpnbypass";
/// Routing table consulted by traffic that must stay inside the tunnel.
pub const VPN_ONLY_TABLE: &str = "vpnonly";

/// Priority of the source-ip rules; below the main table, above default.
const SOURCE_RULE_PRIORITY: u32 = 101;

const RP_FILTER_KEY: &str = "net.ipv4.conf.all.rp_filter";

pub struct RouteController {
    exec: Arc<dyn CommandExecutor>,
    firewall: Arc<dyn FirewallBackend>,
}

impl RouteController {
    pub fn new(exec: Arc<dyn CommandExecutor>, firewall: Arc<dyn FirewallBackend>) -> Self {
        Self { exec, firewall }
    }

    pub fn enable_anchors(&self) {
        // The tagging rules read cgroup membership and are unaffected by
        // network changes; the masquerade anchor starts out empty and is
        // filled by update_masquerade.
        self.firewall
            .set_anchor_enabled(AnchorFamily::Both, TAG_ANCHOR, true, AnchorTable::Mangle);
        self.firewall
            .set_anchor_enabled(AnchorFamily::Both, NAT_ANCHOR, true, AnchorTable::Nat);
    }

    pub fn disable_anchors(&self) {
        self.firewall
            .set_anchor_enabled(AnchorFamily::Both, NAT_ANCHOR, false, AnchorTable::Nat);
        self.firewall
            .set_anchor_enabled(AnchorFamily::Both, TAG_ANCHOR, false, AnchorTable::Mangle);
    }

    /// Point the masquerade rules at the current physical interface, or
    /// empty the anchor when there is none.
    pub fn update_masquerade(&self, interface_name: &str) {
        if interface_name.is_empty() {
            log::info!("removing masquerade rules, no physical interface");
            self.firewall
                .replace_anchor(AnchorFamily::Both, NAT_ANCHOR, &[], AnchorTable::Nat);
        } else {
            log::info!("updating masquerade rules for interface {interface_name}");
            self.firewall.replace_anchor(
                AnchorFamily::Both,
                NAT_ANCHOR,
                &[
                    format!("-o {interface_name} -j MASQUERADE"),
                    "-o tun+ -j MASQUERADE".to_string(),
                ],
                AnchorTable::Nat,
            );
        }
    }

    /// Install the default routes of the two tables with replace semantics
    /// and flush the route cache.
    pub fn update_routes(
        &self,
        gateway_ip: &str,
        interface_name: &str,
        tunnel_device: &str,
        tunnel_remote: &str,
    ) {
        // The bypass route can be left as-is while the uplink is unknown:
        // nothing is assigned to the bypass cgroup in that state anyway.
        if gateway_ip.is_empty() || interface_name.is_empty() {
            log::info!(
                "not updating the bypass route, uplink not known (gateway {gateway_ip:?}, interface {interface_name:?})"
            );
        } else {
            self.run(&format!(
                "ip route replace default via {gateway_ip} dev {interface_name} table {BYPASS_TABLE}"
            ));
        }

        // Vpn-only processes are expected to lose connectivity while the
        // tunnel is down; their route simply stays absent.
        if tunnel_remote.is_empty() || tunnel_device.is_empty() {
            log::warn!(
                "tunnel not configured yet, skipping the vpn-only route (remote {tunnel_remote:?}, device {tunnel_device:?})"
            );
        } else {
            self.run(&format!(
                "ip route replace default via {tunnel_remote} dev {tunnel_device} table {VPN_ONLY_TABLE}"
            ));
        }

        self.run("ip route flush cache");
    }

    /// Bind a source address to a routing table. Empty address is a no-op.
    pub fn add_source_ip_rule(&self, ip_address: &str, table: &str) {
        if !ip_address.is_empty() {
            self.run(&format!(
                "ip rule add from {ip_address} lookup {table} pri {SOURCE_RULE_PRIORITY}"
            ));
        }
    }

    pub fn remove_source_ip_rule(&self, ip_address: &str, table: &str) {
        if !ip_address.is_empty() {
            self.run(&format!(
                "ip rule del from {ip_address} lookup {table} pri {SOURCE_RULE_PRIORITY}"
            ));
        }
    }

    /// Switch the reverse-path filter to loose mode.
    ///
    /// Bypass traffic leaves through the physical interface with a source
    /// address that doesn't match the default route; strict RPF would drop
    /// the replies. Returns the previous value when we actually changed
    /// something, so the session can restore it on teardown.
    pub fn enable_loose_rp_filter(&self) -> Option<String> {
        let output = match self.exec.execute(&format!("sysctl -n '{RP_FILTER_KEY}'")) {
            Ok(output) if output.success() => output,
            _ => {
                log::warn!("unable to read {RP_FILTER_KEY}, leaving it untouched");
                return None;
            }
        };

        let current = output.stdout.trim().to_string();
        if current == "2" {
            log::info!("{RP_FILTER_KEY} already loose, nothing to do");
            return None;
        }

        log::info!("setting {RP_FILTER_KEY} to loose, saving old value {current:?}");
        self.run(&format!("sysctl -w '{RP_FILTER_KEY}=2'"));
        Some(current)
    }

    /// Write the saved value back verbatim, even if the system value
    /// changed behind our back during the session.
    pub fn restore_rp_filter(&self, saved: &str) {
        log::info!("restoring {RP_FILTER_KEY} to {saved:?}");
        self.run(&format!("sysctl -w '{RP_FILTER_KEY}={saved}'"));
    }

    fn run(&self, command: &str) {
        log::info!("executing: {command}");
        match self.exec.execute(command) {
            Ok(output) if !output.success() => {
                log::warn!("`{command}` exited with {}: {}", output.status, output.stderr);
            }
            Ok(_) => {}
            Err(err) => log::warn!("{err}"),
        }
    }
}
