//! Shunt is a per-application split tunneling daemon for Linux VPN setups.
//!
//! The daemon classifies running processes into three traffic classes by
//! executable path: bypass (egress through the physical uplink, around the
//! tunnel), vpn-only (egress through the tunnel or nothing) and default.
//! The classification is enforced at the packet level by combining three
//! kernel facilities:
//!
//! - two pre-created cgroups whose membership is read by netfilter rules
//!   that mark packets
//! - policy routing tables selected by source address
//! - masquerading of bypass traffic onto the physical interface
//!
//! Process lifecycle is observed through the kernel's proc connector, so
//! the pid sets follow execs and exits in real time; every configuration
//! delivery additionally re-derives them from procfs, which absorbs any
//! events the kernel dropped.
//!
//! The work happens in [`shunt_core::split_tunnel`]; this crate wires it
//! to a configuration file and the process lifecycle of a daemon.

use std::sync::OnceLock;

pub mod cli;
pub mod shuntd;

/// Crate version, tagged `+dev` on debug builds so stray test binaries
/// are recognizable in the field.
pub(crate) fn version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| {
        if cfg!(debug_assertions) {
            format!("{}+dev", env!("CARGO_PKG_VERSION"))
        } else {
            env!("CARGO_PKG_VERSION").to_string()
        }
    })
}

/// Set up the global logger.
///
/// The daemon logs at info and above by default; the `-v` flags only ever
/// raise that. A `RUST_LOG` in the environment means someone is chasing a
/// specific problem, so in that case env_logger's own filter parsing takes
/// over unchanged.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level = override_log_level.max(log::Level::Info);
        env_logger::builder()
            .filter_level(level.to_level_filter())
            .init();
    }
}
