//! Full plugin workflows against an in-memory host: runtime, link tables,
//! the switch's ports and flow table, and the ipvlan taps.

use pkg_exec::fake::{Invocation, ScriptedRunner};
use pkg_exec::{CommandOutput, CommandRunner};
use pkg_network::{AdvisoryLock, AttachConfig, Attacher, PodRef};
use pkg_ovs::FlowEntry;
use pkg_types::config::AttachMode;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FakePod {
    pid: u32,
    ip: &'static str,
    mac: &'static str,
    veth: String,
    veth_index: u32,
    /// Links in the pod namespace other than the default interface.
    extra_links: Vec<String>,
    has_default: bool,
}

#[derive(Default)]
struct HostState {
    pods: BTreeMap<String, FakePod>,
    /// `(index, name, parent)` of host links other than pod veths.
    links: Vec<(u32, String, Option<String>)>,
    ports: BTreeMap<String, u32>,
    next_ofport: u32,
    flows: Vec<FlowEntry>,
}

fn link_line(index: u32, name: &str, link: Option<&str>, mac: &str) -> String {
    let name = match link {
        Some(l) => format!("{}@{}", name, l),
        None => name.to_string(),
    };
    format!(
        "{}: {}: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default\\    link/ether {} brd ff:ff:ff:ff:ff:ff\n",
        index, name, mac
    )
}

fn uplink_mac(name: &str) -> String {
    let id: u32 = name.trim_start_matches(|c: char| c.is_ascii_alphabetic()).parse().unwrap_or(0);
    format!("00:50:56:00:00:{:02x}", id)
}

fn render_entry(e: &FlowEntry) -> String {
    let matches: String = e
        .matches
        .iter()
        .map(|m| match &m.value {
            Some(v) => format!(",{}={}", m.key, v),
            None => format!(",{}", m.key),
        })
        .collect();
    format!(
        " cookie=0x0, duration=5.0s, table={}, n_packets=0, n_bytes=0, priority={}{} actions={}\n",
        e.table,
        e.priority,
        matches,
        e.actions.join(",")
    )
}

impl HostState {
    fn with_uplinks(count: u16) -> Self {
        let mut host = HostState {
            next_ofport: 20,
            ..Default::default()
        };
        host.links.push((1, "lo".into(), None));
        for i in 1..count as u32 {
            host.links.push((1 + i, format!("eth{}", i), None));
        }
        host
    }

    fn add_pod(&mut self, cid: &str, pid: u32, ip: &'static str, mac: &'static str) {
        let veth_index = 100 + pid;
        self.pods.insert(
            cid.to_string(),
            FakePod {
                pid,
                ip,
                mac,
                veth: format!("veth{}", cid),
                veth_index,
                extra_links: Vec::new(),
                has_default: true,
            },
        );
    }

    fn pod_by_pid(&mut self, pid: &str) -> Option<&mut FakePod> {
        let pid: u32 = pid.parse().ok()?;
        self.pods.values_mut().find(|p| p.pid == pid)
    }

    fn host_link_list(&self) -> String {
        let mut out = String::new();
        for (index, name, parent) in &self.links {
            out.push_str(&link_line(*index, name, parent.as_deref(), &uplink_mac(name)));
        }
        for pod in self.pods.values() {
            let peer = format!("if{}", pod.veth_index - 1);
            out.push_str(&link_line(pod.veth_index, &pod.veth, Some(peer.as_str()), "ce:ad:7b:00:00:01"));
        }
        out
    }

    fn respond(&mut self, call: &Invocation) -> CommandOutput {
        let args: Vec<&str> = call.args.iter().map(String::as_str).collect();
        match call.program.as_str() {
            "docker" => match self.pods.get(args[3]) {
                Some(p) => CommandOutput::ok(format!(
                    "{},{},16,172.17.0.1,{}\n",
                    p.pid, p.ip, p.mac
                )),
                None => CommandOutput::failed(format!("Error: No such object: {}", args[3])),
            },
            "nsenter" => self.respond_netns(&args),
            "ip" => self.respond_ip(&args),
            "brctl" => CommandOutput::ok(""),
            "ovs-vsctl" => self.respond_vsctl(&args),
            "ovs-ofctl" => self.respond_ofctl(&args),
            other => CommandOutput::failed(format!("{}: command not found", other)),
        }
    }

    fn respond_netns(&mut self, args: &[&str]) -> CommandOutput {
        let pid = args[1];
        let cmd = &args[3..];
        let Some(pod) = self.pod_by_pid(pid) else {
            return CommandOutput::failed("nsenter: No such process");
        };
        match cmd {
            ["ip", "-o", "link", "show", "eth0"] if pod.has_default => CommandOutput::ok(link_line(
                pod.veth_index - 1,
                "eth0",
                Some(format!("if{}", pod.veth_index).as_str()),
                pod.mac,
            )),
            ["ip", "-o", "link", "show", "eth0"] => {
                CommandOutput::failed("Device \"eth0\" does not exist.")
            }
            ["ip", "-o", "link", "show"] => {
                let mut out = link_line(1, "lo", None, "00:00:00:00:00:00");
                if pod.has_default {
                    out.push_str(&link_line(
                        pod.veth_index - 1,
                        "eth0",
                        Some(format!("if{}", pod.veth_index).as_str()),
                        pod.mac,
                    ));
                }
                for (i, name) in pod.extra_links.iter().enumerate() {
                    out.push_str(&link_line(50 + i as u32, name, Some("if2"), "00:50:56:aa:00:01"));
                }
                CommandOutput::ok(out)
            }
            ["ip", "link", "delete", "eth0"] => {
                pod.has_default = false;
                CommandOutput::ok("")
            }
            ["ip", "link", "delete", name] => {
                pod.extra_links.retain(|l| l != name);
                CommandOutput::ok("")
            }
            ["ip", "address", ..] | ["ip", "route", ..] | ["ip", "link", "set", ..] => {
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed("unsupported netns command"),
        }
    }

    fn respond_ip(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["-o", "link", "show"] => CommandOutput::ok(self.host_link_list()),
            ["link", "set", name, "netns", pid] => {
                let Some(pos) = self.links.iter().position(|(_, n, _)| n == name) else {
                    return CommandOutput::failed(format!("Cannot find device \"{}\"", name));
                };
                self.links.remove(pos);
                let name = name.to_string();
                match self.pod_by_pid(pid) {
                    Some(pod) => {
                        pod.extra_links.push(name);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed("Invalid \"netns\" value"),
                }
            }
            ["link", "delete", name] => {
                let before = self.links.len();
                self.links.retain(|(_, n, _)| n != name);
                if self.links.len() == before {
                    CommandOutput::failed(format!("Cannot find device \"{}\"", name))
                } else {
                    CommandOutput::ok("")
                }
            }
            ["link", "add", name, "link", parent, "type", "ipvlan", "mode", "l2"] => {
                if self.links.iter().any(|(_, n, _)| n == name) {
                    return CommandOutput::failed("RTNETLINK answers: File exists");
                }
                let index = self.links.iter().map(|(i, _, _)| *i).max().unwrap_or(1) + 1;
                self.links.push((index, name.to_string(), Some(parent.to_string())));
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed("unsupported ip command"),
        }
    }

    fn respond_vsctl(&mut self, args: &[&str]) -> CommandOutput {
        if let Some(pos) = args.iter().position(|a| *a == "add-port") {
            let name = args[pos + 2].to_string();
            let requested = args
                .iter()
                .find_map(|a| a.strip_prefix("ofport_request="))
                .and_then(|p| p.parse().ok());
            if !self.ports.contains_key(&name) {
                let ofport = requested.unwrap_or_else(|| {
                    self.next_ofport += 1;
                    self.next_ofport
                });
                self.ports.insert(name, ofport);
            }
            return CommandOutput::ok("");
        }
        if let Some(pos) = args.iter().position(|a| *a == "del-port") {
            self.ports.remove(args[pos + 2]);
            return CommandOutput::ok("");
        }
        if args.contains(&"del-br") {
            self.ports.clear();
            self.flows.clear();
        }
        CommandOutput::ok("")
    }

    fn respond_ofctl(&mut self, args: &[&str]) -> CommandOutput {
        let args: Vec<&str> = args.iter().copied().filter(|a| *a != "--no-names").collect();
        match &args[2..] {
            ["show", _] => {
                let mut out = String::from("OFPT_FEATURES_REPLY (xid=0x2): dpid:0000aa55aa550001\n");
                for (name, ofport) in &self.ports {
                    out.push_str(&format!(" {}({}): addr:{}\n     config:     0\n", ofport, name, uplink_mac(name)));
                }
                CommandOutput::ok(out)
            }
            ["dump-flows", _] => {
                let mut out = String::from("OFPST_FLOW reply (OF1.3) (xid=0x2):\n");
                for e in &self.flows {
                    out.push_str(&render_entry(e));
                }
                CommandOutput::ok(out)
            }
            ["add-flow", _, spec] => {
                let Some(entry) = FlowEntry::parse(&spec.replacen(",actions=", " actions=", 1)) else {
                    return CommandOutput::failed("bad flow spec");
                };
                self.flows
                    .retain(|e| !(e.table == entry.table && e.priority == entry.priority && e.matches == entry.matches));
                self.flows.push(entry);
                CommandOutput::ok("")
            }
            ["del-flows", _, selector] => {
                let Some(sel) = FlowEntry::parse(&format!("{} actions=drop", selector)) else {
                    return CommandOutput::failed("bad selector");
                };
                self.flows
                    .retain(|e| !(e.table == sel.table && sel.matches.iter().all(|m| e.matches.contains(m))));
                CommandOutput::ok("")
            }
            ["mod-port", ..] => CommandOutput::ok(""),
            _ => CommandOutput::failed("unsupported ofctl command"),
        }
    }

    fn pod_rules(&self) -> Vec<&FlowEntry> {
        self.flows.iter().filter(|e| e.priority >= 100).collect()
    }
}

struct FakeHost {
    state: Arc<Mutex<HostState>>,
    runner: Arc<ScriptedRunner>,
    lock_path: std::path::PathBuf,
}

impl FakeHost {
    fn new(uplinks: u16) -> Self {
        let state = Arc::new(Mutex::new(HostState::with_uplinks(uplinks)));
        let responder_state = state.clone();
        let runner = Arc::new(ScriptedRunner::new(move |call| {
            responder_state.lock().unwrap().respond(call)
        }));
        let lock_path =
            std::env::temp_dir().join(format!("kovs-attach-{}.lock", uuid::Uuid::new_v4()));
        Self {
            state,
            runner,
            lock_path,
        }
    }

    fn attacher(&self, mode: AttachMode, uplinks: u16) -> Attacher {
        let config = AttachConfig {
            uplink_count: uplinks,
            mode,
            lock_file: self.lock_path.clone(),
            ..Default::default()
        };
        let runner: Arc<dyn CommandRunner> = self.runner.clone();
        Attacher::new(config, runner)
            .with_lock(AdvisoryLock::new(&self.lock_path).with_retry(Duration::from_millis(10)))
    }

    fn add_pod(&self, cid: &str, pid: u32, ip: &'static str, mac: &'static str) -> PodRef {
        self.state.lock().unwrap().add_pod(cid, pid, ip, mac);
        PodRef {
            namespace: "default".into(),
            name: format!("pod-{}", cid),
            container_id: cid.into(),
        }
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[tokio::test]
async fn setup_binds_lowest_uplink_and_installs_four_rules() {
    let host = FakeHost::new(10);
    let attacher = host.attacher(AttachMode::Switch, 10);
    assert!(attacher.init().await.is_clean());

    let pod = host.add_pod("aaaa", 101, "172.17.0.2", "02:42:ac:11:00:02");
    let (attachment, report) = attacher.setup(&pod).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(attachment.uplink, 1);
    assert_eq!(attachment.host_veth.as_deref(), Some("vethaaaa"));
    assert_eq!(attachment.veth_ofport, Some(21));
    assert_eq!(attachment.uplink_mac.as_deref(), Some("00:50:56:00:00:01"));

    let state = host.state.lock().unwrap();
    let rules = state.pod_rules();
    assert_eq!(rules.len(), 4);
    assert!(rules.iter().any(|e| e.table == 2 && e.in_port() == Some(21) && e.outputs().collect::<Vec<_>>() == vec![1]));
    assert!(rules.iter().any(|e| e.table == 3
        && e.has_flag("arp")
        && e.in_port() == Some(1)
        && e.actions.contains(&"set_field:02:42:ac:11:00:02->arp_tha".to_string())));
    // the fall-through chain survives
    assert_eq!(state.flows.iter().filter(|e| e.priority == 0).count(), 3);
}

#[tokio::test]
async fn repeated_setup_reuses_the_bound_uplink() {
    let host = FakeHost::new(10);
    let attacher = host.attacher(AttachMode::Switch, 10);
    attacher.init().await;
    let pod = host.add_pod("aaaa", 101, "172.17.0.2", "02:42:ac:11:00:02");

    let (first, _) = attacher.setup(&pod).await.unwrap();
    let (second, _) = attacher.setup(&pod).await.unwrap();

    assert_eq!(first.uplink, second.uplink);
    assert_eq!(host.state.lock().unwrap().pod_rules().len(), 4);
}

#[tokio::test]
async fn teardown_frees_the_uplink_for_the_next_pod() {
    let host = FakeHost::new(10);
    let attacher = host.attacher(AttachMode::Switch, 10);
    attacher.init().await;
    let a = host.add_pod("aaaa", 101, "172.17.0.2", "02:42:ac:11:00:02");
    let b = host.add_pod("bbbb", 102, "172.17.0.3", "02:42:ac:11:00:03");

    assert_eq!(attacher.setup(&a).await.unwrap().0.uplink, 1);
    assert_eq!(attacher.setup(&b).await.unwrap().0.uplink, 2);

    let report = attacher.teardown(&a).await.unwrap();
    assert!(report.is_clean());
    {
        let state = host.state.lock().unwrap();
        assert_eq!(state.pod_rules().len(), 4);
        assert!(!state.ports.contains_key("vethaaaa"));
        assert!(state.pod_rules().iter().all(|e| e.in_port() != Some(1)));
    }

    let c = host.add_pod("cccc", 103, "172.17.0.4", "02:42:ac:11:00:04");
    assert_eq!(attacher.setup(&c).await.unwrap().0.uplink, 1);
}

#[tokio::test]
async fn exhausted_pool_fails_setup() {
    let host = FakeHost::new(3);
    let attacher = host.attacher(AttachMode::Switch, 3);
    attacher.init().await;

    for (cid, pid) in [("aaaa", 101), ("bbbb", 102)] {
        let pod = host.add_pod(cid, pid, "172.17.0.9", "02:42:ac:11:00:09");
        attacher.setup(&pod).await.unwrap();
    }
    let third = host.add_pod("cccc", 103, "172.17.0.10", "02:42:ac:11:00:0a");
    let err = attacher.setup(&third).await.unwrap_err();
    assert!(err.to_string().contains("no free uplink"));
}

#[tokio::test]
async fn unknown_container_stops_before_touching_the_switch() {
    let host = FakeHost::new(10);
    let attacher = host.attacher(AttachMode::Switch, 10);
    let ghost = PodRef {
        namespace: "default".into(),
        name: "ghost".into(),
        container_id: "dead".into(),
    };
    assert!(attacher.setup(&ghost).await.is_err());
    assert!(host.runner.lines().iter().all(|l| !l.starts_with("ovs-")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_setups_get_distinct_uplinks() {
    let host = FakeHost::new(10);
    host.attacher(AttachMode::Switch, 10).init().await;
    let a = host.add_pod("aaaa", 101, "172.17.0.2", "02:42:ac:11:00:02");
    let b = host.add_pod("bbbb", 102, "172.17.0.3", "02:42:ac:11:00:03");

    let first = host.attacher(AttachMode::Switch, 10);
    let second = host.attacher(AttachMode::Switch, 10);
    let ta = tokio::spawn(async move { first.setup(&a).await.map(|(att, _)| att.uplink) });
    let tb = tokio::spawn(async move { second.setup(&b).await.map(|(att, _)| att.uplink) });

    let uplinks: BTreeSet<u16> = [ta.await.unwrap().unwrap(), tb.await.unwrap().unwrap()]
        .into_iter()
        .collect();
    assert_eq!(uplinks, BTreeSet::from([1, 2]));
}

#[tokio::test]
async fn ipvlan_setup_moves_tap_and_teardown_recreates_it() {
    let host = FakeHost::new(4);
    let attacher = host.attacher(AttachMode::Ipvlan, 4);
    let report = attacher.init().await;
    // deleting taps that don't exist yet fails and is only logged
    assert_eq!(report.attempted, 6);
    assert_eq!(report.failed, 3);

    let pod = host.add_pod("aaaa", 101, "172.17.0.2", "02:42:ac:11:00:02");
    let (attachment, report) = attacher.setup(&pod).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(attachment.uplink, 1);
    {
        let state = host.state.lock().unwrap();
        assert!(!state.links.iter().any(|(_, n, _)| n == "ipv1"));
        let pod = &state.pods["aaaa"];
        assert_eq!(pod.extra_links, vec!["ipv1".to_string()]);
        assert!(!pod.has_default);
    }
    assert!(host
        .runner
        .lines()
        .contains(&"nsenter --target 101 --net ip route add default via 172.17.0.1 dev ipv1".to_string()));

    // re-setup finds the tap already in the pod
    let (again, _) = attacher.setup(&pod).await.unwrap();
    assert_eq!(again.uplink, 1);

    let report = attacher.teardown(&pod).await.unwrap();
    assert!(report.is_clean());
    let state = host.state.lock().unwrap();
    assert!(state.pods["aaaa"].extra_links.is_empty());
    assert!(state
        .links
        .iter()
        .any(|(_, n, p)| n == "ipv1" && p.as_deref() == Some("eth1")));
}
