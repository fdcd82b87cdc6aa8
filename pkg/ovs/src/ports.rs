/// A port attached to the bridge, as listed by `ovs-ofctl show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPort {
    pub ofport: u32,
    pub name: String,
    pub mac: String,
}

/// Structured snapshot of the bridge's port list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortTable {
    pub ports: Vec<SwitchPort>,
}

impl PortTable {
    /// Parse `ovs-ofctl show` output. Only numbered port header lines such as
    /// ` 5(veth1a2b): addr:ce:ad:7b:12:34:56` are kept; `LOCAL` and the
    /// per-port detail lines are skipped.
    pub fn parse(show: &str) -> Self {
        let ports = show
            .lines()
            .filter_map(|line| {
                let (num, rest) = line.trim().split_once('(')?;
                let ofport = num.parse().ok()?;
                let (name, tail) = rest.split_once("):")?;
                let mac = tail.trim().strip_prefix("addr:")?.trim();
                Some(SwitchPort {
                    ofport,
                    name: name.to_string(),
                    mac: mac.to_string(),
                })
            })
            .collect();
        Self { ports }
    }

    pub fn by_name(&self, name: &str) -> Option<&SwitchPort> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn ofport_of(&self, name: &str) -> Option<u32> {
        self.by_name(name).map(|p| p.ofport)
    }
}
