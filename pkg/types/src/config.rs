use serde::{Deserialize, Serialize};

/// How a pod is given its uplink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// Pod veth joins the switch bridge; per-pod flows pair it with an uplink.
    #[default]
    Switch,
    /// An ipvlan tap of the uplink is moved into the pod namespace.
    Ipvlan,
}

impl std::fmt::Display for AttachMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachMode::Switch => write!(f, "switch"),
            AttachMode::Ipvlan => write!(f, "ipvlan"),
        }
    }
}

/// Attachment plugin configuration file (YAML).
///
/// Example `plugin.yaml`:
/// ```yaml
/// bridge: br0
/// docker-bridge: docker0
/// uplink-count: 10
/// uplink-prefix: eth
/// mode: switch
/// lock-file: /tmp/kovs-plugin.lock
/// log-file: /tmp/kovs-plugin.log
/// strict-exit: false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfigFile {
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default, alias = "docker-bridge")]
    pub docker_bridge: Option<String>,
    #[serde(default, alias = "uplink-count")]
    pub uplink_count: Option<u16>,
    #[serde(default, alias = "uplink-prefix")]
    pub uplink_prefix: Option<String>,
    #[serde(default)]
    pub mode: Option<AttachMode>,
    #[serde(default, alias = "lock-file")]
    pub lock_file: Option<String>,
    #[serde(default, alias = "log-file")]
    pub log_file: Option<String>,
    #[serde(default, alias = "strict-exit")]
    pub strict_exit: Option<bool>,
}

/// Service controller configuration file (YAML).
///
/// Example `controller.yaml`:
/// ```yaml
/// api-server: http://10.0.0.1:8080
/// namespace: default
/// bridge: br0
/// group-base: 100
/// debounce-ms: 300
/// watch-retry-secs: 5
/// log-file: /tmp/kovs-controller.log
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default, alias = "api-server")]
    pub api_server: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub bridge: Option<String>,
    #[serde(default, alias = "group-base")]
    pub group_base: Option<u32>,
    #[serde(default, alias = "debounce-ms")]
    pub debounce_ms: Option<u64>,
    #[serde(default, alias = "watch-retry-secs")]
    pub watch_retry_secs: Option<u64>,
    #[serde(default, alias = "log-file")]
    pub log_file: Option<String>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Like [`load_config_file`], but an unreadable or malformed file yields the
/// defaults together with the error, so the caller can log it once logging
/// is up.
pub fn load_config_or_default<T: serde::de::DeserializeOwned + Default>(path: &str) -> (T, Option<anyhow::Error>) {
    match load_config_file(path) {
        Ok(config) => (config, None),
        Err(e) => (T::default(), Some(e)),
    }
}
