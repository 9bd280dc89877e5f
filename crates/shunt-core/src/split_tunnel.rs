//! The split-tunnel reconciler.
//!
//! A single task owns the app-to-pids maps, the netlink subscription and
//! the previously observed network state, and serializes everything that
//! touches them: configuration deliveries from the daemon and process
//! events from the kernel. Entry point is [`start_split_tunnel`]; the
//! returned handle is the only way in.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use nix::unistd::Pid;
use proc_common::{
    cgroup::{self, CgroupPaths},
    connector::{ConnectorError, ProcEvent, ProcEventSocket},
    log_error,
    procfs::Procfs,
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    params::{FirewallParams, NetworkScan, TunnelParams},
    routing::{RouteController, BYPASS_TABLE, VPN_ONLY_TABLE},
};

pub fn start_split_tunnel(
    procfs: Procfs,
    cgroups: CgroupPaths,
    routing: RouteController,
) -> SplitTunnelHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let tracker = SplitTunnel::new(rx, procfs, cgroups, routing);
    tokio::spawn(tracker.run());
    SplitTunnelHandle { tx }
}

#[derive(Clone)]
pub struct SplitTunnelHandle {
    tx: mpsc::UnboundedSender<Request>,
}

enum Request {
    Connect {
        params: FirewallParams,
        tunnel: TunnelParams,
        tx_reply: oneshot::Sender<Result<(), ConnectorError>>,
    },
    Update {
        params: FirewallParams,
        tunnel: TunnelParams,
        tx_reply: oneshot::Sender<()>,
    },
    Disconnect {
        tx_reply: oneshot::Sender<()>,
    },
}

impl SplitTunnelHandle {
    /// Start a session. An already active session is torn down first.
    ///
    /// Failure means the process event subscription could not be set up;
    /// in that case no other state has been touched and the daemon keeps
    /// running without split tunneling.
    pub async fn connect(
        &self,
        params: FirewallParams,
        tunnel: TunnelParams,
    ) -> Result<(), ConnectorError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        // The tracker only stops when every handle is dropped, so the
        // send cannot fail and the reply always arrives.
        let r = self.tx.send(Request::Connect {
            params,
            tunnel,
            tx_reply,
        });
        assert!(r.is_ok());
        rx_reply.await.unwrap()
    }

    /// Deliver a new configuration to the running session.
    pub async fn update(&self, params: FirewallParams, tunnel: TunnelParams) {
        let (tx_reply, rx_reply) = oneshot::channel();
        let r = self.tx.send(Request::Update {
            params,
            tunnel,
            tx_reply,
        });
        assert!(r.is_ok());
        rx_reply.await.unwrap()
    }

    /// Tear the session down, restoring all kernel state.
    pub async fn disconnect(&self) {
        let (tx_reply, rx_reply) = oneshot::channel();
        let r = self.tx.send(Request::Disconnect { tx_reply });
        assert!(r.is_ok());
        rx_reply.await.unwrap()
    }
}

/// One group of tracked applications: the paths the user configured and
/// the live pids we have seen for each, bound to the cgroup task file the
/// pids get written to. The bypass and the vpn-only group are two
/// instances of this same type.
struct TrackedApps {
    cgroup_file: PathBuf,
    apps: HashMap<String, HashSet<Pid>>,
}

impl TrackedApps {
    fn new(cgroup_file: PathBuf) -> Self {
        Self {
            cgroup_file,
            apps: HashMap::new(),
        }
    }

    fn contains(&self, path: &str) -> bool {
        self.apps.contains_key(path)
    }

    fn track(&mut self, path: &str, pid: Pid) {
        if let Some(pids) = self.apps.get_mut(path) {
            pids.insert(pid);
        }
    }

    /// A dead pid may be recorded under any path; scrub them all. The
    /// kernel already reaped the process, so no cgroup write is needed.
    fn forget_pid(&mut self, pid: Pid) {
        for pids in self.apps.values_mut() {
            pids.remove(&pid);
        }
    }

    /// Drop every entry not in `keep`, moving its known pids back to the
    /// parent cgroup.
    fn remove_apps(&mut self, keep: &[String], procfs: &Procfs, parent_cgroup: &Path) {
        let stale: Vec<String> = self
            .apps
            .keys()
            .filter(|path| !keep.contains(path))
            .cloned()
            .collect();
        for path in stale {
            log::info!("untracking {path}");
            if let Some(pids) = self.apps.remove(&path) {
                for pid in pids {
                    cgroup::assign_with_descendants(procfs, parent_cgroup, pid);
                }
            }
        }
    }

    /// (Re)derive the pid set of every desired path from procfs and
    /// assign the found pids to our cgroup. Rescanning paths we already
    /// track is deliberate: it is the reconciliation pass that absorbs
    /// process events the kernel dropped.
    fn add_apps(&mut self, desired: &[String], procfs: &Procfs) {
        for path in desired {
            let mut pids = HashSet::new();
            for pid in procfs.pids_for_path(path) {
                cgroup::assign_with_descendants(procfs, &self.cgroup_file, pid);
                pids.insert(pid);
            }
            self.apps.insert(path.clone(), pids);
        }
    }
}

struct SplitTunnel {
    rx: mpsc::UnboundedReceiver<Request>,
    procfs: Procfs,
    cgroups: CgroupPaths,
    routing: RouteController,
    exclusions: TrackedApps,
    vpn_only: TrackedApps,
    socket: Option<ProcEventSocket>,
    previous_scan: NetworkScan,
    previous_tunnel_local: String,
    saved_rp_filter: Option<String>,
}

impl SplitTunnel {
    fn new(
        rx: mpsc::UnboundedReceiver<Request>,
        procfs: Procfs,
        cgroups: CgroupPaths,
        routing: RouteController,
    ) -> Self {
        let exclusions = TrackedApps::new(cgroups.exclusions.clone());
        let vpn_only = TrackedApps::new(cgroups.vpn_only.clone());
        Self {
            rx,
            procfs,
            cgroups,
            routing,
            exclusions,
            vpn_only,
            socket: None,
            previous_scan: NetworkScan::default(),
            previous_tunnel_local: String::new(),
            saved_rp_filter: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.handle_request(request),
                    // Every handle is gone; leave the kernel clean.
                    None => {
                        self.shutdown_connection();
                        break;
                    }
                },
                event = Self::next_event(&self.socket) => self.handle_proc_event(event),
            }
        }
    }

    async fn next_event(socket: &Option<ProcEventSocket>) -> Result<ProcEvent, ConnectorError> {
        match socket {
            Some(socket) => socket.next_event().await,
            None => std::future::pending().await,
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect {
                params,
                tunnel,
                tx_reply,
            } => {
                let _ = tx_reply.send(self.initiate_connection(params, tunnel));
            }
            Request::Update {
                params,
                tunnel,
                tx_reply,
            } => {
                self.update_split_tunnel(&params, &tunnel);
                let _ = tx_reply.send(());
            }
            Request::Disconnect { tx_reply } => {
                self.shutdown_connection();
                let _ = tx_reply.send(());
            }
        }
    }

    fn handle_proc_event(&mut self, event: Result<ProcEvent, ConnectorError>) {
        match event {
            Ok(ProcEvent::Ack) => log::info!("listening for process events"),
            Ok(ProcEvent::Exec { pid }) => self.add_launched_app(pid),
            Ok(ProcEvent::Exit { pid }) => self.remove_terminated_app(pid),
            Ok(ProcEvent::Other) => {}
            Err(err) => log_error("error receiving a process event", err),
        }
    }

    fn initiate_connection(
        &mut self,
        params: FirewallParams,
        tunnel: TunnelParams,
    ) -> Result<(), ConnectorError> {
        if self.socket.is_some() {
            log::info!("a session is already active, shutting it down first");
            self.shutdown_connection();
        }

        // Nothing else may be touched until the subscription holds: a
        // failure here means the daemon continues without split tunneling.
        let socket = ProcEventSocket::open()?;
        log::info!("subscribed to process events");
        self.socket = Some(socket);

        self.routing.enable_anchors();
        self.update_split_tunnel(&params, &tunnel);
        self.saved_rp_filter = self.routing.enable_loose_rp_filter();
        Ok(())
    }

    fn update_split_tunnel(&mut self, params: &FirewallParams, tunnel: &TunnelParams) {
        // Network first: the app pass below gates the bypass group on
        // whether the stored scan is valid.
        self.update_network(params, tunnel);
        self.update_apps(&params.exclude_apps, &params.vpn_only_apps);
    }

    fn update_network(&mut self, params: &FirewallParams, tunnel: &TunnelParams) {
        let scan = &params.net_scan;

        if self.previous_scan.interface_name != scan.interface_name {
            self.routing.update_masquerade(&scan.interface_name);
        }

        // Source-ip rules are removed before added so that at most one
        // exists per table outside of this block.
        if self.previous_scan.ip_address != scan.ip_address {
            self.routing
                .remove_source_ip_rule(&self.previous_scan.ip_address, BYPASS_TABLE);
            self.routing
                .add_source_ip_rule(&scan.ip_address, BYPASS_TABLE);
        }

        if self.previous_tunnel_local != tunnel.local_address {
            self.routing
                .remove_source_ip_rule(&self.previous_tunnel_local, VPN_ONLY_TABLE);
            self.routing
                .add_source_ip_rule(&tunnel.local_address, VPN_ONLY_TABLE);
        }

        // Always; replace semantics make a spurious update harmless.
        self.routing.update_routes(
            &scan.gateway_ip,
            &scan.interface_name,
            &tunnel.device_name,
            &tunnel.remote_address,
        );

        self.previous_scan = scan.clone();
        self.previous_tunnel_local = tunnel.local_address.clone();
    }

    fn update_apps(&mut self, excluded: &[String], vpn_only: &[String]) {
        // A path cannot be in both groups; the bypass list wins.
        let vpn_only: Vec<String> = vpn_only
            .iter()
            .filter(|path| !excluded.contains(path))
            .cloned()
            .collect();

        // Without a valid uplink there is nothing to bypass to; vpn-only
        // apps stay tracked and simply lose connectivity.
        let excluded: &[String] = if self.previous_scan.is_valid() {
            excluded
        } else {
            &[]
        };

        self.exclusions
            .remove_apps(excluded, &self.procfs, &self.cgroups.parent);
        self.exclusions.add_apps(excluded, &self.procfs);

        self.vpn_only
            .remove_apps(&vpn_only, &self.procfs, &self.cgroups.parent);
        self.vpn_only.add_apps(&vpn_only, &self.procfs);
    }

    fn add_launched_app(&mut self, pid: Pid) {
        // Empty when the process was so short-lived that it exited before
        // we could resolve its image; nothing to do then.
        let Some(path) = self.procfs.path_for_pid(pid) else {
            return;
        };

        if self.exclusions.contains(&path) {
            if self.previous_scan.is_valid() {
                log::info!("adding {pid} to the bypass group for {path}");
                self.exclusions.track(&path, pid);
                cgroup::assign_with_descendants(&self.procfs, &self.cgroups.exclusions, pid);
            }
        } else if self.vpn_only.contains(&path) {
            log::info!("adding {pid} to the vpn-only group for {path}");
            self.vpn_only.track(&path, pid);
            cgroup::assign_with_descendants(&self.procfs, &self.cgroups.vpn_only, pid);
        }
    }

    fn remove_terminated_app(&mut self, pid: Pid) {
        self.exclusions.forget_pid(pid);
        self.vpn_only.forget_pid(pid);
    }

    fn remove_all_apps(&mut self) {
        log::info!("moving every tracked app back to the parent cgroup");
        self.exclusions
            .remove_apps(&[], &self.procfs, &self.cgroups.parent);
        self.vpn_only
            .remove_apps(&[], &self.procfs, &self.cgroups.parent);
    }

    fn shutdown_connection(&mut self) {
        if let Some(socket) = self.socket.take() {
            log::info!("unsubscribing from process events");
            if let Err(err) = socket.unsubscribe() {
                log_error("cannot unsubscribe from process events", err);
            }
        }

        self.routing.disable_anchors();
        self.remove_all_apps();
        self.routing
            .remove_source_ip_rule(&self.previous_scan.ip_address, BYPASS_TABLE);
        self.routing
            .remove_source_ip_rule(&self.previous_tunnel_local, VPN_ONLY_TABLE);
        if let Some(saved) = self.saved_rp_filter.take() {
            self.routing.restore_rp_filter(&saved);
        }

        self.previous_scan = NetworkScan::default();
        self.previous_tunnel_local.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink, sync::Arc};

    use tempfile::TempDir;

    use super::*;
    use crate::test_support::{RecordingExecutor, RecordingFirewall};

    fn add_process(root: &Path, pid: i32, exe: Option<&str>, ppid: i32) {
        let pid_dir = root.join(pid.to_string());
        fs::create_dir(&pid_dir).unwrap();
        if let Some(exe) = exe {
            symlink(exe, pid_dir.join("exe")).unwrap();
        }
        fs::write(pid_dir.join("status"), format!("PPid:\t{ppid}\n")).unwrap();
    }

    fn cgroup_paths(dir: &Path) -> CgroupPaths {
        let paths = CgroupPaths {
            exclusions: dir.join("bypass.procs"),
            vpn_only: dir.join("vpnonly.procs"),
            parent: dir.join("parent.procs"),
        };
        for file in [&paths.exclusions, &paths.vpn_only, &paths.parent] {
            fs::write(file, "").unwrap();
        }
        paths
    }

    fn pids_written(file: &Path) -> Vec<String> {
        let mut pids: Vec<String> = fs::read_to_string(file)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect();
        pids.sort();
        pids.dedup();
        pids
    }

    fn tracker(
        proc_root: &Path,
        cgroups: CgroupPaths,
    ) -> (SplitTunnel, Arc<RecordingExecutor>, Arc<RecordingFirewall>) {
        let exec = Arc::new(RecordingExecutor::default());
        let firewall = Arc::new(RecordingFirewall::default());
        let routing = RouteController::new(exec.clone(), firewall.clone());
        let (_tx, rx) = mpsc::unbounded_channel();
        let tracker = SplitTunnel::new(rx, Procfs::at(proc_root), cgroups, routing);
        (tracker, exec, firewall)
    }

    fn params(excluded: &[&str], vpn_only: &[&str]) -> FirewallParams {
        FirewallParams {
            net_scan: NetworkScan {
                interface_name: "eth0".into(),
                ip_address: "192.0.2.2".into(),
                gateway_ip: "192.0.2.1".into(),
            },
            exclude_apps: excluded.iter().map(|s| s.to_string()).collect(),
            vpn_only_apps: vpn_only.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn invalid_params(excluded: &[&str], vpn_only: &[&str]) -> FirewallParams {
        FirewallParams {
            net_scan: NetworkScan::default(),
            ..params(excluded, vpn_only)
        }
    }

    fn tunnel() -> TunnelParams {
        TunnelParams {
            device_name: "tun0".into(),
            local_address: "10.0.0.2".into(),
            remote_address: "10.0.0.1".into(),
        }
    }

    #[test]
    fn running_pid_is_assigned_on_first_update() {
        let proc_dir = TempDir::new().unwrap();
        add_process(proc_dir.path(), 1234, Some("/usr/bin/foo"), 1);
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, exec, firewall) = tracker(proc_dir.path(), cgroups.clone());

        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &[]), &tunnel());

        assert_eq!(pids_written(&cgroups.exclusions), vec!["1234"]);
        assert_eq!(
            tracker.exclusions.apps["/usr/bin/foo"],
            HashSet::from([Pid::from_raw(1234)])
        );
        let commands = exec.commands();
        assert!(commands
            .contains(&"ip route replace default via 192.0.2.1 dev eth0 table vpnbypass".to_string()));
        assert!(commands.contains(&"ip rule add from 192.0.2.2 lookup vpnbypass pri 101".to_string()));
        assert!(firewall.calls().contains(
            &"replace nat 100.transIp [-o eth0 -j MASQUERADE, -o tun+ -j MASQUERADE]".to_string()
        ));
    }

    #[test]
    fn exec_event_tracks_new_pid() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, _exec, _firewall) = tracker(proc_dir.path(), cgroups.clone());
        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &[]), &tunnel());

        add_process(proc_dir.path(), 2000, Some("/usr/bin/foo"), 1);
        tracker.add_launched_app(Pid::from_raw(2000));

        assert_eq!(pids_written(&cgroups.exclusions), vec!["2000"]);
        assert_eq!(
            tracker.exclusions.apps["/usr/bin/foo"],
            HashSet::from([Pid::from_raw(2000)])
        );
    }

    #[test]
    fn exec_event_for_untracked_path_is_ignored() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, _exec, _firewall) = tracker(proc_dir.path(), cgroups.clone());
        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &[]), &tunnel());

        add_process(proc_dir.path(), 2100, Some("/usr/bin/elsewhere"), 1);
        tracker.add_launched_app(Pid::from_raw(2100));
        // reaped before the event reached us
        tracker.add_launched_app(Pid::from_raw(2101));

        assert!(pids_written(&cgroups.exclusions).is_empty());
    }

    #[test]
    fn exit_event_forgets_pid_without_touching_cgroups() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, _exec, _firewall) = tracker(proc_dir.path(), cgroups.clone());
        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &[]), &tunnel());
        add_process(proc_dir.path(), 2000, Some("/usr/bin/foo"), 1);
        tracker.add_launched_app(Pid::from_raw(2000));

        tracker.remove_terminated_app(Pid::from_raw(2000));

        assert!(tracker.exclusions.apps["/usr/bin/foo"].is_empty());
        assert!(pids_written(&cgroups.parent).is_empty());
    }

    #[test]
    fn losing_the_uplink_evicts_bypass_apps() {
        let proc_dir = TempDir::new().unwrap();
        add_process(proc_dir.path(), 1234, Some("/usr/bin/foo"), 1);
        add_process(proc_dir.path(), 4321, Some("/usr/bin/bar"), 1);
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, _exec, _firewall) = tracker(proc_dir.path(), cgroups.clone());
        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &["/usr/bin/bar"]), &tunnel());
        assert_eq!(pids_written(&cgroups.exclusions), vec!["1234"]);

        tracker.update_split_tunnel(&invalid_params(&["/usr/bin/foo"], &["/usr/bin/bar"]), &tunnel());

        // bypass pids return to the parent cgroup, vpn-only stays tracked
        assert!(tracker.exclusions.apps.is_empty());
        assert_eq!(pids_written(&cgroups.parent), vec!["1234"]);
        assert_eq!(
            tracker.vpn_only.apps["/usr/bin/bar"],
            HashSet::from([Pid::from_raw(4321)])
        );
    }

    #[test]
    fn exec_event_ignored_for_bypass_without_uplink() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, _exec, _firewall) = tracker(proc_dir.path(), cgroups.clone());
        tracker.update_split_tunnel(&invalid_params(&["/usr/bin/foo"], &["/usr/bin/bar"]), &tunnel());

        add_process(proc_dir.path(), 3100, Some("/usr/bin/bar"), 1);
        tracker.add_launched_app(Pid::from_raw(3100));

        // the gate empties the bypass group entirely
        assert!(tracker.exclusions.apps.is_empty());
        assert!(pids_written(&cgroups.exclusions).is_empty());
        assert_eq!(pids_written(&cgroups.vpn_only), vec!["3100"]);
    }

    #[test]
    fn interface_change_moves_masquerade_and_route() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, exec, firewall) = tracker(proc_dir.path(), cgroups);
        tracker.update_split_tunnel(&params(&[], &[]), &tunnel());

        let mut moved = params(&[], &[]);
        moved.net_scan.interface_name = "wlan0".into();
        tracker.update_split_tunnel(&moved, &tunnel());

        assert!(firewall.calls().contains(
            &"replace nat 100.transIp [-o wlan0 -j MASQUERADE, -o tun+ -j MASQUERADE]".to_string()
        ));
        assert!(exec.commands().contains(
            &"ip route replace default via 192.0.2.1 dev wlan0 table vpnbypass".to_string()
        ));
    }

    #[test]
    fn address_change_replaces_the_source_rule() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, exec, _firewall) = tracker(proc_dir.path(), cgroups);
        tracker.update_split_tunnel(&params(&[], &[]), &tunnel());

        let mut moved = params(&[], &[]);
        moved.net_scan.ip_address = "198.51.100.7".into();
        tracker.update_split_tunnel(&moved, &tunnel());

        let rules: Vec<String> = exec
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("ip rule"))
            .collect();
        assert_eq!(
            rules,
            vec![
                "ip rule add from 192.0.2.2 lookup vpnbypass pri 101",
                "ip rule add from 10.0.0.2 lookup vpnonly pri 101",
                "ip rule del from 192.0.2.2 lookup vpnbypass pri 101",
                "ip rule add from 198.51.100.7 lookup vpnbypass pri 101",
            ]
        );
    }

    #[test]
    fn descendants_are_captured_with_the_parent() {
        let proc_dir = TempDir::new().unwrap();
        add_process(proc_dir.path(), 3000, Some("/usr/bin/foo"), 1);
        add_process(proc_dir.path(), 3001, Some("/usr/bin/helper"), 3000);
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, _exec, _firewall) = tracker(proc_dir.path(), cgroups.clone());

        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &[]), &tunnel());

        assert_eq!(pids_written(&cgroups.exclusions), vec!["3000", "3001"]);
        assert_eq!(
            tracker.exclusions.apps["/usr/bin/foo"],
            HashSet::from([Pid::from_raw(3000)])
        );
    }

    #[test]
    fn repeated_update_is_idempotent() {
        let proc_dir = TempDir::new().unwrap();
        add_process(proc_dir.path(), 1234, Some("/usr/bin/foo"), 1);
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, exec, firewall) = tracker(proc_dir.path(), cgroups.clone());

        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &[]), &tunnel());
        let pids_before = tracker.exclusions.apps.clone();
        let anchor_calls_before = firewall.calls().len();

        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &[]), &tunnel());

        assert_eq!(tracker.exclusions.apps, pids_before);
        assert_eq!(pids_written(&cgroups.exclusions), vec!["1234"]);
        // nothing changed, so no anchor churn and no extra policy rules
        assert_eq!(firewall.calls().len(), anchor_calls_before);
        let rule_commands = exec
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("ip rule"))
            .count();
        assert_eq!(rule_commands, 2);
    }

    #[test]
    fn a_path_cannot_be_in_both_groups() {
        let proc_dir = TempDir::new().unwrap();
        add_process(proc_dir.path(), 1234, Some("/usr/bin/foo"), 1);
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, _exec, _firewall) = tracker(proc_dir.path(), cgroups);

        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &["/usr/bin/foo"]), &tunnel());

        assert!(tracker.exclusions.contains("/usr/bin/foo"));
        assert!(!tracker.vpn_only.contains("/usr/bin/foo"));
    }

    #[test]
    fn shutdown_restores_everything() {
        let proc_dir = TempDir::new().unwrap();
        add_process(proc_dir.path(), 1234, Some("/usr/bin/foo"), 1);
        add_process(proc_dir.path(), 4321, Some("/usr/bin/bar"), 1);
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let (mut tracker, exec, firewall) = tracker(proc_dir.path(), cgroups.clone());
        tracker.update_split_tunnel(&params(&["/usr/bin/foo"], &["/usr/bin/bar"]), &tunnel());
        tracker.saved_rp_filter = Some("1".to_string());

        tracker.shutdown_connection();

        assert!(tracker.exclusions.apps.is_empty());
        assert!(tracker.vpn_only.apps.is_empty());
        assert_eq!(pids_written(&cgroups.parent), vec!["1234", "4321"]);
        assert_eq!(tracker.previous_scan, NetworkScan::default());
        assert!(tracker.previous_tunnel_local.is_empty());
        assert!(tracker.saved_rp_filter.is_none());

        let calls = firewall.calls();
        assert!(calls.contains(&"disable nat 100.transIp".to_string()));
        assert!(calls.contains(&"disable mangle 100.tagPkts".to_string()));

        let commands = exec.commands();
        assert!(commands.contains(&"ip rule del from 192.0.2.2 lookup vpnbypass pri 101".to_string()));
        assert!(commands.contains(&"ip rule del from 10.0.0.2 lookup vpnonly pri 101".to_string()));
        assert!(commands.contains(&"sysctl -w 'net.ipv4.conf.all.rp_filter=1'".to_string()));
    }

    #[tokio::test]
    async fn requests_are_serialized_through_the_handle() {
        let proc_dir = TempDir::new().unwrap();
        let cgroup_dir = TempDir::new().unwrap();
        let cgroups = cgroup_paths(cgroup_dir.path());
        let exec = Arc::new(RecordingExecutor::default());
        let firewall = Arc::new(RecordingFirewall::default());
        let routing = RouteController::new(exec.clone(), firewall.clone());

        let handle = start_split_tunnel(Procfs::at(proc_dir.path()), cgroups, routing);
        handle.update(params(&[], &[]), tunnel()).await;
        assert!(exec
            .commands()
            .contains(&"ip route flush cache".to_string()));

        handle.disconnect().await;
        assert!(firewall
            .calls()
            .contains(&"disable mangle 100.tagPkts".to_string()));
    }
}
