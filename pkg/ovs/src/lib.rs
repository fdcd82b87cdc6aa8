//! Typed model of the virtual switch: flow and group specs, snapshot
//! parsing of the tool output, the per-bridge [`Switch`] facade and the
//! fixed table [`Pipeline`].

pub mod flow;
pub mod group;
pub mod pipeline;
pub mod ports;
pub mod switch;

pub use flow::{Action, Flow, FlowEntry, FlowTable, Match, Nat};
pub use group::Group;
pub use pipeline::Pipeline;
pub use ports::{PortTable, SwitchPort};
pub use switch::Switch;
