//! Centralized constants for the kovs project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod network;
pub mod ovs;
pub mod paths;
