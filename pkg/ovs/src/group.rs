use std::net::Ipv4Addr;

use pkg_constants::ovs::{BUCKET_WEIGHT, TABLE_EGRESS};

use crate::flow::{Action, Nat};

/// A `type=select` load-balancing group: one equal-weight bucket per backend,
/// each committing a destination NAT to that backend and continuing in the
/// egress table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u32,
    pub backends: Vec<Ipv4Addr>,
}

impl Group {
    pub fn new(id: u32, backends: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            id,
            backends: backends.into_iter().collect(),
        }
    }

    /// Full `add-group` spec. A group without backends has no buckets, so
    /// flows pointing at it stay valid and drop traffic.
    pub fn render(&self) -> String {
        let mut spec = format!("group_id={},type=select", self.id);
        for ip in &self.backends {
            let nat = Action::Conntrack {
                commit: true,
                table: Some(TABLE_EGRESS),
                nat: Some(Nat::Dst(*ip)),
            };
            spec.push_str(&format!(",bucket=weight:{},actions={}", BUCKET_WEIGHT, nat));
        }
        spec
    }

    /// Selector for `del-groups`.
    pub fn selector(id: u32) -> String {
        format!("group_id={}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_two_equal_buckets() {
        let group = Group::new(
            100,
            [Ipv4Addr::new(10, 1, 1, 2), Ipv4Addr::new(10, 1, 1, 3)],
        );
        assert_eq!(
            group.render(),
            "group_id=100,type=select,\
             bucket=weight:100,actions=ct(commit,table=2,nat(dst=10.1.1.2)),\
             bucket=weight:100,actions=ct(commit,table=2,nat(dst=10.1.1.3))"
        );
    }

    #[test]
    fn empty_group_has_no_buckets() {
        let group = Group::new(101, []);
        assert_eq!(group.render(), "group_id=101,type=select");
        assert_eq!(Group::selector(101), "group_id=101");
    }
}
