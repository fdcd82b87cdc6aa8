//! Shared data types: the plugin and controller config files.

pub mod config;
