//! Filesystem path constants.

// ─── Plugin ────────────────────────────────────────────────────────────────

/// Default config file path for the attachment plugin.
pub const DEFAULT_PLUGIN_CONFIG: &str = "/etc/kovs/plugin.yaml";

/// Log file every plugin invocation appends to.
pub const DEFAULT_PLUGIN_LOG: &str = "/tmp/kovs-plugin.log";

/// Lock file serializing concurrent plugin invocations.
pub const DEFAULT_PLUGIN_LOCK: &str = "/tmp/kovs-plugin.lock";

// ─── Controller ───────────────────────────────────────────────────────────

/// Default config file path for the service controller.
pub const DEFAULT_CONTROLLER_CONFIG: &str = "/etc/kovs/controller.yaml";

/// Log file of the service controller.
pub const DEFAULT_CONTROLLER_LOG: &str = "/tmp/kovs-controller.log";
