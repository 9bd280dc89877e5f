//! Configuration inputs delivered by the daemon.

/// Best current information about the physical uplink, supplied by the
/// external network monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkScan {
    pub interface_name: String,
    pub ip_address: String,
    pub gateway_ip: String,
}

impl NetworkScan {
    /// A scan is usable only when all three pieces are known. Without a
    /// full picture we cannot route traffic around the tunnel.
    pub fn is_valid(&self) -> bool {
        !self.interface_name.is_empty() && !self.ip_address.is_empty() && !self.gateway_ip.is_empty()
    }
}

/// Tunnel parameters from the tunnel manager. Fields may be empty while a
/// connection is still coming up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelParams {
    pub device_name: String,
    pub local_address: String,
    pub remote_address: String,
}

/// The firewall-relevant part of the daemon configuration.
///
/// The app lists are ordered sequences of absolute executable paths;
/// duplicates are tolerated, the effective semantics is set membership.
#[derive(Debug, Clone, Default)]
pub struct FirewallParams {
    pub net_scan: NetworkScan,
    pub exclude_apps: Vec<String>,
    pub vpn_only_apps: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_is_valid_only_when_complete() {
        let mut scan = NetworkScan {
            interface_name: "eth0".into(),
            ip_address: "192.0.2.2".into(),
            gateway_ip: "192.0.2.1".into(),
        };
        assert!(scan.is_valid());

        scan.gateway_ip.clear();
        assert!(!scan.is_valid());
        assert!(!NetworkScan::default().is_valid());
    }
}
