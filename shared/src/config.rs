//! Configuration types and validation, loaded from `server.toml`/`client.toml`
//! and overridable from the CLI.
//!
//! Layout follows the teacher's `shared::config` module (one struct per
//! component, `#[serde(default = "...")]` per field, a `validate()` that
//! turns bad input into a `crate::Error::Config` instead of panicking);
//! field names and defaults come from `original_source/server.py` and
//! `original_source/client.py`'s CLI option tables.

use serde::{Deserialize, Serialize};

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    50_001
}
fn default_bundlesize() -> usize {
    1
}
fn default_bundlewait_server() -> u64 {
    5
}
fn default_bundlewait_client() -> u64 {
    2
}
fn default_max_retries() -> i32 {
    0
}
fn default_evict_after() -> u64 {
    600
}
fn default_num_tasks() -> usize {
    1
}
fn default_heartrate() -> u64 {
    10
}
fn default_signalwait() -> u64 {
    30
}
fn default_template() -> String {
    crate::template::DEFAULT_TEMPLATE.to_string()
}

fn default_true() -> bool {
    true
}
fn default_autoscale_policy() -> String {
    "fixed".to_string()
}
fn default_autoscale_factor() -> f64 {
    1.0
}
fn default_autoscale_period() -> u64 {
    60
}
fn default_autoscale_init_size() -> usize {
    1
}
fn default_autoscale_max_size() -> usize {
    2
}

/// Configuration for the `hypershell-server` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Bind address for the bundle-queue listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared-secret hex key authenticating clients and submitters.
    pub auth: String,
    /// Path to the sqlite database file (`None` runs with `--no-db`).
    #[serde(default)]
    pub database: Option<String>,
    /// Auto-create the database schema on startup.
    #[serde(default)]
    pub initdb: bool,
    /// Number of tasks per scheduled/completed bundle.
    #[serde(default = "default_bundlesize")]
    pub bundlesize: usize,
    /// Seconds to wait before flushing a partial bundle.
    #[serde(default = "default_bundlewait_server")]
    pub bundlewait: u64,
    /// Extra attempts granted to a failed task (0 disables retry).
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    /// Schedule failed tasks ahead of new ones.
    #[serde(default)]
    pub eager: bool,
    /// Keep scheduling after the task source is exhausted.
    #[serde(default)]
    pub forever: bool,
    /// Resume scheduling from the last completed task rather than from NEW.
    #[serde(default)]
    pub restart: bool,
    /// Require `ClientInfo` confirmation of bundle receipt.
    #[serde(default = "default_true")]
    pub confirm: bool,
    /// Seconds of heartbeat silence before a client is evicted.
    #[serde(default = "default_evict_after")]
    pub evict_after: u64,
    /// Optional file to redirect failed task argument lines into.
    #[serde(default)]
    pub failures_path: Option<String>,
    /// Launch and retire clients automatically against task pressure.
    #[serde(default)]
    pub autoscale: bool,
    /// Either `"fixed"` (hold `autoscale_init_size` clients) or `"dynamic"`
    /// (scale against `store::task_pressure`).
    #[serde(default = "default_autoscale_policy")]
    pub autoscale_policy: String,
    /// Dynamic-policy pressure divisor; higher values scale more lazily.
    #[serde(default = "default_autoscale_factor")]
    pub autoscale_factor: f64,
    /// Seconds to wait between autoscale checks.
    #[serde(default = "default_autoscale_period")]
    pub autoscale_period: u64,
    /// Number of clients launched during the initial ramp-up.
    #[serde(default = "default_autoscale_init_size")]
    pub autoscale_init_size: usize,
    /// Fleet size never shrunk below, even under zero pressure.
    #[serde(default)]
    pub autoscale_min_size: usize,
    /// Fleet size never grown beyond, even under high pressure.
    #[serde(default = "default_autoscale_max_size")]
    pub autoscale_max_size: usize,
    /// Shell command line used to launch one client (argv, shell-quoted).
    /// Required when `autoscale` is set; there is no implicit default since
    /// a client always needs its own `client.toml`.
    #[serde(default)]
    pub autoscale_launcher: String,
}

impl ServerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.auth.trim().is_empty() {
            return Err(crate::Error::Config("auth key must not be empty".into()).into());
        }
        if self.bundlesize == 0 {
            return Err(crate::Error::Config("bundlesize must be at least 1".into()).into());
        }
        if self.max_retries < 0 {
            return Err(crate::Error::Config("max_retries cannot be negative".into()).into());
        }
        if self.autoscale {
            match self.autoscale_policy.to_ascii_lowercase().as_str() {
                "fixed" | "dynamic" => {}
                other => return Err(crate::Error::Config(format!("unknown autoscale policy '{other}'")).into()),
            }
            if self.autoscale_min_size > self.autoscale_max_size {
                return Err(crate::Error::Config("autoscale_min_size cannot exceed autoscale_max_size".into()).into());
            }
            if self.autoscale_launcher.trim().is_empty() {
                return Err(crate::Error::Config("autoscale_launcher must be set when autoscale is enabled".into()).into());
            }
        }
        Ok(())
    }
}

/// Configuration for the `hypershell-client` binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Server host to connect to.
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared-secret hex key matching the server's `auth`.
    pub auth: String,
    /// Number of task executors run in parallel.
    #[serde(default = "default_num_tasks")]
    pub num_tasks: usize,
    /// Command-line template pattern applied to each task's argument line.
    #[serde(default = "default_template")]
    pub template: String,
    /// Number of tasks per completed bundle posted back to the server.
    #[serde(default = "default_bundlesize")]
    pub bundlesize: usize,
    /// Seconds to wait before flushing a partial completed bundle.
    #[serde(default = "default_bundlewait_client")]
    pub bundlewait: u64,
    /// Seconds between heartbeat posts (0 disables heartbeating).
    #[serde(default = "default_heartrate")]
    pub heartrate: u64,
    /// Overall client idle timeout in seconds (`None` = run forever).
    #[serde(default)]
    pub client_timeout: Option<u64>,
    /// Per-task wall-clock timeout in seconds (`None` = unbounded).
    #[serde(default)]
    pub task_timeout: Option<u64>,
    /// Seconds between signal escalation steps (SIGINT/SIGTERM/SIGKILL).
    #[serde(default = "default_signalwait")]
    pub signalwait: u64,
    /// Send `ClientInfo` confirmation once a bundle is accepted.
    #[serde(default = "default_true")]
    pub confirm: bool,
    /// Capture stdout/stderr to files alongside the task working directory.
    #[serde(default)]
    pub capture: bool,
    /// Directory each task executes in (`None` = current directory).
    #[serde(default)]
    pub directory: Option<String>,
    /// Seconds to wait before the client starts pulling tasks.
    #[serde(default)]
    pub delay_start: f64,
}

impl ClientConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.host.trim().is_empty() {
            return Err(crate::Error::Config("host must not be empty".into()).into());
        }
        if self.auth.trim().is_empty() {
            return Err(crate::Error::Config("auth key must not be empty".into()).into());
        }
        if self.num_tasks == 0 {
            return Err(crate::Error::Config("num_tasks must be at least 1".into()).into());
        }
        Ok(())
    }
}

/// Parse a config struct from TOML text, as loaded from `server.toml` or
/// `client.toml`.
pub fn from_toml<T: for<'de> Deserialize<'de>>(text: &str) -> crate::Result<T> {
    Ok(toml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_rejects_empty_auth() {
        let cfg = ServerConfig {
            bind: default_bind(),
            port: default_port(),
            auth: String::new(),
            database: None,
            initdb: false,
            bundlesize: 1,
            bundlewait: 5,
            max_retries: 0,
            eager: false,
            forever: false,
            restart: false,
            confirm: true,
            evict_after: 600,
            failures_path: None,
            autoscale: false,
            autoscale_policy: default_autoscale_policy(),
            autoscale_factor: default_autoscale_factor(),
            autoscale_period: default_autoscale_period(),
            autoscale_init_size: default_autoscale_init_size(),
            autoscale_min_size: 0,
            autoscale_max_size: default_autoscale_max_size(),
            autoscale_launcher: String::new(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn server_config_rejects_inverted_autoscale_bounds() {
        let text = "auth = \"deadbeef\"\nautoscale = true\nautoscale_min_size = 5\nautoscale_max_size = 2\n";
        let cfg: ServerConfig = from_toml(text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn server_config_rejects_unknown_autoscale_policy() {
        let text = "auth = \"deadbeef\"\nautoscale = true\nautoscale_policy = \"elastic\"\n";
        let cfg: ServerConfig = from_toml(text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn client_config_from_toml_fills_defaults() {
        let text = "host = \"server.example\"\nauth = \"deadbeef\"\n";
        let cfg: ClientConfig = from_toml(text).unwrap();
        assert_eq!(cfg.port, default_port());
        assert_eq!(cfg.num_tasks, 1);
        assert_eq!(cfg.template, crate::template::DEFAULT_TEMPLATE);
        cfg.validate().unwrap();
    }

    #[test]
    fn client_config_rejects_zero_num_tasks() {
        let text = "host = \"h\"\nauth = \"k\"\nnum_tasks = 0\n";
        let cfg: ClientConfig = from_toml(text).unwrap();
        assert!(cfg.validate().is_err());
    }
}
