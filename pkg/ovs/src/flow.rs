use std::fmt;
use std::net::Ipv4Addr;

/// A match field of a flow rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Ip,
    Arp,
    InPort(u32),
    NwDst(Ipv4Addr),
    NwProto(u8),
    TcpDst(u16),
    UdpDst(u16),
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::Ip => write!(f, "ip"),
            Match::Arp => write!(f, "arp"),
            Match::InPort(p) => write!(f, "in_port={}", p),
            Match::NwDst(ip) => write!(f, "nw_dst={}", ip),
            Match::NwProto(p) => write!(f, "nw_proto={}", p),
            Match::TcpDst(p) => write!(f, "tcp_dst={}", p),
            Match::UdpDst(p) => write!(f, "udp_dst={}", p),
        }
    }
}

/// NAT clause of a `ct` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nat {
    /// Apply whatever NAT the tracked connection already carries.
    Existing,
    /// Rewrite the destination address.
    Dst(Ipv4Addr),
}

/// An action of a flow rule or group bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    GotoTable(u8),
    Output(u32),
    ModDlSrc(String),
    ModDlDst(String),
    ModTpDst(u16),
    /// `set_field:VALUE->FIELD`
    SetField { value: String, field: String },
    Group(u32),
    Conntrack {
        commit: bool,
        table: Option<u8>,
        nat: Option<Nat>,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::GotoTable(t) => write!(f, "goto_table:{}", t),
            Action::Output(p) => write!(f, "output:{}", p),
            Action::ModDlSrc(mac) => write!(f, "mod_dl_src:{}", mac),
            Action::ModDlDst(mac) => write!(f, "mod_dl_dst:{}", mac),
            Action::ModTpDst(p) => write!(f, "mod_tp_dst:{}", p),
            Action::SetField { value, field } => write!(f, "set_field:{}->{}", value, field),
            Action::Group(g) => write!(f, "group:{}", g),
            Action::Conntrack { commit, table, nat } => {
                let mut args = Vec::new();
                if *commit {
                    args.push("commit".to_string());
                }
                if let Some(t) = table {
                    args.push(format!("table={}", t));
                }
                match nat {
                    Some(Nat::Existing) => args.push("nat".to_string()),
                    Some(Nat::Dst(ip)) => args.push(format!("nat(dst={})", ip)),
                    None => {}
                }
                write!(f, "ct({})", args.join(","))
            }
        }
    }
}

/// A flow rule to be installed with `ovs-ofctl add-flow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub table: u8,
    pub priority: u16,
    pub matches: Vec<Match>,
    pub actions: Vec<Action>,
}

impl Flow {
    pub fn new(table: u8, priority: u16) -> Self {
        Self {
            table,
            priority,
            matches: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn matching(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    pub fn action(mut self, a: Action) -> Self {
        self.actions.push(a);
        self
    }

    /// `table=T,<matches>`: the selector `del-flows` takes. Priority is left
    /// out since non-strict deletes ignore it.
    pub fn selector(&self) -> String {
        let mut parts = vec![format!("table={}", self.table)];
        parts.extend(self.matches.iter().map(Match::to_string));
        parts.join(",")
    }

    /// Full `add-flow` spec.
    pub fn render(&self) -> String {
        let mut parts = vec![
            format!("table={}", self.table),
            format!("priority={}", self.priority),
        ];
        parts.extend(self.matches.iter().map(Match::to_string));
        let actions = self
            .actions
            .iter()
            .map(Action::to_string)
            .collect::<Vec<_>>()
            .join(",");
        parts.push(format!("actions={}", if actions.is_empty() { "drop" } else { &actions }));
        parts.join(",")
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ─── dump-flows snapshot ───────────────────────────────────────────────

/// Statistics keys `dump-flows` prints ahead of the match fields.
const STAT_KEYS: &[&str] = &[
    "cookie",
    "duration",
    "n_packets",
    "n_bytes",
    "idle_age",
    "hard_age",
    "idle_timeout",
    "hard_timeout",
    "reset_counts",
    "send_flow_rem",
    "importance",
];

/// OpenFlow default priority for rules installed without one.
const DEFAULT_PRIORITY: u16 = 32768;

/// A match field as printed by the switch: `key=value` or a bare flag such
/// as `ip` or `arp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchField {
    pub key: String,
    pub value: Option<String>,
}

/// One installed rule, as reported by `ovs-ofctl dump-flows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    pub table: u8,
    pub priority: u16,
    pub matches: Vec<MatchField>,
    pub actions: Vec<String>,
}

impl FlowEntry {
    /// Parse one dump line; header and blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (head, actions) = match line.split_once(" actions=") {
            Some(split) => split,
            None => ("", line.strip_prefix("actions=")?),
        };

        let mut table = 0u8;
        let mut priority = DEFAULT_PRIORITY;
        let mut matches = Vec::new();
        for token in head.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some(("table", v)) => table = v.parse().ok()?,
                Some(("priority", v)) => priority = v.parse().ok()?,
                Some((k, _)) if STAT_KEYS.contains(&k) => {}
                Some((k, v)) => matches.push(MatchField {
                    key: k.to_string(),
                    value: Some(v.to_string()),
                }),
                None if STAT_KEYS.contains(&token) => {}
                None => matches.push(MatchField {
                    key: token.to_string(),
                    value: None,
                }),
            }
        }

        Some(Self {
            table,
            priority,
            matches,
            actions: split_actions(actions.trim()),
        })
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.matches
            .iter()
            .find(|m| m.key == key)
            .and_then(|m| m.value.as_deref())
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.matches.iter().any(|m| m.key == flag && m.value.is_none())
    }

    pub fn in_port(&self) -> Option<u32> {
        self.field("in_port")?.parse().ok()
    }

    /// Port numbers this rule outputs to.
    pub fn outputs(&self) -> impl Iterator<Item = u32> + '_ {
        self.actions
            .iter()
            .filter_map(|a| a.strip_prefix("output:"))
            .filter_map(|p| p.parse().ok())
    }
}

/// Top-level comma split that keeps `ct(commit,nat(dst=..))` intact.
fn split_actions(actions: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in actions.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Structured snapshot of every rule on the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowTable {
    pub entries: Vec<FlowEntry>,
}

impl FlowTable {
    pub fn parse(dump: &str) -> Self {
        Self {
            entries: dump.lines().filter_map(FlowEntry::parse).collect(),
        }
    }

    pub fn table(&self, table: u8) -> impl Iterator<Item = &FlowEntry> + '_ {
        self.entries.iter().filter(move |e| e.table == table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
