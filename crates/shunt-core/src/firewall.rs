//! Netfilter anchors.
//!
//! An anchor is a named, replaceable slot in the daemon's ruleset. The
//! engine owns two: the packet-tagging anchor in the mangle table, whose
//! rules read cgroup membership and set an fwmark, and the
//! source-translation anchor in the NAT table, whose content follows the
//! physical interface.

use std::sync::Arc;

use crate::shell::CommandExecutor;

/// Mangle anchor that marks packets by cgroup; stable for a session.
pub const TAG_ANCHOR: &str = "100.tagPkts";
/// NAT anchor holding the masquerade rules; replaced on interface change.
pub const NAT_ANCHOR: &str = "100.transIp";

const CHAIN_PREFIX: &str = "SHUNT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorTable {
    Mangle,
    Nat,
}

impl AnchorTable {
    pub fn name(self) -> &'static str {
        match self {
            AnchorTable::Mangle => "mangle",
            AnchorTable::Nat => "nat",
        }
    }

    // Where the jump into the anchor chain lives.
    fn hook(self) -> &'static str {
        match self {
            AnchorTable::Mangle => "OUTPUT",
            AnchorTable::Nat => "POSTROUTING",
        }
    }
}

/// Which address family an anchor operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorFamily {
    Ipv4,
    Ipv6,
    Both,
}

impl AnchorFamily {
    fn tools(self) -> &'static [&'static str] {
        match self {
            AnchorFamily::Ipv4 => &["iptables"],
            AnchorFamily::Ipv6 => &["ip6tables"],
            AnchorFamily::Both => &["iptables", "ip6tables"],
        }
    }
}

/// The anchor facility contract the engine consumes.
pub trait FirewallBackend: Send + Sync {
    /// Install or remove the anchor and the jump into it.
    fn set_anchor_enabled(
        &self,
        family: AnchorFamily,
        name: &str,
        enabled: bool,
        table: AnchorTable,
    );

    /// Swap the anchor's content for `rules`. An empty slice empties the
    /// anchor without removing it.
    fn replace_anchor(&self, family: AnchorFamily, name: &str, rules: &[String], table: AnchorTable);
}

/// Anchors realized as dedicated iptables chains.
pub struct IptablesBackend {
    exec: Arc<dyn CommandExecutor>,
}

impl IptablesBackend {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    fn run(&self, command: &str) {
        match self.exec.execute(command) {
            Ok(output) if !output.success() => {
                log::warn!("`{command}` exited with {}: {}", output.status, output.stderr);
            }
            Ok(_) => {}
            Err(err) => log::warn!("{err}"),
        }
    }

    // Chain creation races with leftovers from a previous run; -N failing
    // on an existing chain is fine, the flush below makes it ours.
    fn ensure_chain(&self, tool: &str, table: AnchorTable, chain: &str) {
        match self.exec.execute(&format!("{tool} -w -t {} -N {chain}", table.name())) {
            Ok(_) => {}
            Err(err) => log::warn!("{err}"),
        }
        self.run(&format!("{tool} -w -t {} -F {chain}", table.name()));
    }
}

impl FirewallBackend for IptablesBackend {
    fn set_anchor_enabled(
        &self,
        family: AnchorFamily,
        name: &str,
        enabled: bool,
        table: AnchorTable,
    ) {
        let chain = format!("{CHAIN_PREFIX}.{name}");
        for tool in family.tools() {
            if enabled {
                self.ensure_chain(tool, table, &chain);
                self.run(&format!(
                    "{tool} -w -t {} -I {} -j {chain}",
                    table.name(),
                    table.hook()
                ));
            } else {
                self.run(&format!(
                    "{tool} -w -t {} -D {} -j {chain}",
                    table.name(),
                    table.hook()
                ));
                self.run(&format!("{tool} -w -t {} -F {chain}", table.name()));
                self.run(&format!("{tool} -w -t {} -X {chain}", table.name()));
            }
        }
    }

    fn replace_anchor(
        &self,
        family: AnchorFamily,
        name: &str,
        rules: &[String],
        table: AnchorTable,
    ) {
        let chain = format!("{CHAIN_PREFIX}.{name}");
        for tool in family.tools() {
            self.run(&format!("{tool} -w -t {} -F {chain}", table.name()));
            for rule in rules {
                self.run(&format!("{tool} -w -t {} -A {chain} {rule}", table.name()));
            }
        }
    }
}
