use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Example shown when required configuration is missing
pub const EXAMPLE_CONFIG: &str = r#"[target]
host = "<game-server-ip>"
port = 25565

[commands]
start = "aws ec2 start-instances --instance-ids i-xxxxxxxxxxxxxxxxx"
shutdown = "aws ec2 stop-instances --instance-ids i-xxxxxxxxxxxxxxxxx"

[whitelist]
enabled = true
path = "./whitelist.json"
"#;

/// Global configuration for the gate
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The single on-demand backend
    pub target: TargetConfig,

    /// Commands run on lifecycle events
    pub commands: CommandsConfig,

    /// Who may boot the backend
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Idle and watchdog timing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Backend probe timing
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port clients connect to (default: 25565)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Seconds an intercepted client may stay silent before being dropped
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pid_file: None,
            client_timeout_secs: default_client_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Address of the backend server
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub host: String,

    #[serde(default = "default_target_port")]
    pub port: u16,
}

impl TargetConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// `host:port` suitable for `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command lines for the lifecycle events
///
/// # Security Warning
///
/// These commands are executed with the permissions of the gate process.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct CommandsConfig {
    /// Run when the backend should boot
    pub start: String,

    /// Run when the backend should shut down
    pub shutdown: String,

    /// Working directory for both commands (default: current directory)
    pub working_dir: Option<String>,
}

impl CommandsConfig {
    pub fn new(start: &str, shutdown: &str) -> Self {
        Self {
            start: start.to_string(),
            shutdown: shutdown.to_string(),
            working_dir: None,
        }
    }

    /// Look up a command line by name
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "start" => Some(&self.start),
            "shutdown" => Some(&self.shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WhitelistConfig {
    /// Only listed players may boot the backend (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Path to the whitelist JSON file
    #[serde(default = "default_whitelist_path")]
    pub path: PathBuf,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_whitelist_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Seconds with zero players before requesting shutdown
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds a start or stop may take before the watchdog steps in
    #[serde(default = "default_transition_timeout")]
    pub transition_timeout_secs: u64,

    /// Milliseconds between lifecycle evaluations
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            transition_timeout_secs: default_transition_timeout(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Milliseconds between backend probes
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Milliseconds a single probe may take
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    25565
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_client_timeout() -> u64 {
    10
}

fn default_target_port() -> u16 {
    25565
}

fn default_whitelist_path() -> PathBuf {
    PathBuf::from("whitelist.json")
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_transition_timeout() -> u64 {
    300 // 5 minutes
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_health_interval() -> u64 {
    2000
}

fn default_health_timeout() -> u64 {
    3000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read configuration file '{}': {}\nCreate it with (and customize):\n{}",
                path.display(),
                e,
                EXAMPLE_CONFIG
            )
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| {
            anyhow::anyhow!(
                "Invalid configuration: {}\nA minimal configuration looks like:\n{}",
                e.message(),
                EXAMPLE_CONFIG
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.target.host.trim().is_empty() {
            errors.push("'target.host' must not be empty".to_string());
        }
        if self.target.port == 0 {
            errors.push("'target.port' must be greater than 0".to_string());
        }

        for (name, command) in [
            ("start", &self.commands.start),
            ("shutdown", &self.commands.shutdown),
        ] {
            match shell_words::split(command) {
                Ok(argv) if argv.is_empty() => {
                    errors.push(format!("'commands.{}' must not be empty", name));
                }
                Ok(_) => {}
                Err(e) => {
                    errors.push(format!("'commands.{}' cannot be parsed: {}", name, e));
                }
            }
        }

        if self.server.client_timeout_secs == 0 {
            errors.push("'server.client_timeout_secs' must be greater than 0".to_string());
        }
        if self.lifecycle.transition_timeout_secs == 0 {
            errors.push("'lifecycle.transition_timeout_secs' must be greater than 0".to_string());
        }
        if self.lifecycle.tick_interval_ms == 0 {
            errors.push("'lifecycle.tick_interval_ms' must be greater than 0".to_string());
        }
        if self.health.interval_ms == 0 {
            errors.push("'health.interval_ms' must be greater than 0".to_string());
        }
        if self.health.timeout_ms == 0 {
            errors.push("'health.timeout_ms' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[target]
host = "10.0.0.5"

[commands]
start = "aws ec2 start-instances --instance-ids i-123"
shutdown = "aws ec2 stop-instances --instance-ids i-123"
"#;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 25570
bind = "127.0.0.1"
client_timeout_secs = 5

[target]
host = "mc.internal"
port = 25566

[commands]
start = "./start.sh"
shutdown = "./stop.sh --now"
working_dir = "/opt/gate"

[whitelist]
enabled = true
path = "/srv/whitelist.json"

[lifecycle]
idle_timeout_secs = 600
transition_timeout_secs = 120
tick_interval_ms = 500

[health]
interval_ms = 1000
timeout_ms = 1500
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.port, 25570);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.client_timeout(), Duration::from_secs(5));
        assert_eq!(config.target, TargetConfig::new("mc.internal", 25566));
        assert_eq!(config.commands.working_dir.as_deref(), Some("/opt/gate"));
        assert!(config.whitelist.enabled);
        assert_eq!(config.whitelist.path, PathBuf::from("/srv/whitelist.json"));
        assert_eq!(config.lifecycle.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.lifecycle.transition_timeout(), Duration::from_secs(120));
        assert_eq!(config.lifecycle.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.health.interval(), Duration::from_millis(1000));
        assert_eq!(config.health.timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();

        assert_eq!(config.server.port, 25565);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.server.pid_file.is_none());
        assert_eq!(config.target.port, 25565);
        assert_eq!(config.target.addr(), "10.0.0.5:25565");
        assert!(!config.whitelist.enabled);
        assert_eq!(config.whitelist.path, PathBuf::from("whitelist.json"));
        assert_eq!(config.lifecycle.idle_timeout_secs, 300);
        assert_eq!(config.lifecycle.transition_timeout_secs, 300);
        assert_eq!(config.lifecycle.tick_interval_ms, 1000);
        assert_eq!(config.health.interval_ms, 2000);
        assert_eq!(config.health.timeout_ms, 3000);
    }

    #[test]
    fn test_missing_target_is_descriptive() {
        let toml = r#"
[commands]
start = "a"
shutdown = "b"
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("target"), "{}", err);
        assert!(err.contains("[target]"), "example config should be shown: {}", err);
    }

    #[test]
    fn test_missing_commands_is_descriptive() {
        let toml = r#"
[target]
host = "10.0.0.5"
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("commands"), "{}", err);
    }

    #[test]
    fn test_whitelist_enabled_must_be_boolean() {
        let toml = format!("{}\n[whitelist]\nenabled = \"true\"\n", MINIMAL);
        assert!(Config::parse(&toml).is_err());
    }

    #[test]
    fn test_validate_empty_command() {
        let toml = r#"
[target]
host = "10.0.0.5"

[commands]
start = "   "
shutdown = "stop"
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("'commands.start' must not be empty"));
    }

    #[test]
    fn test_validate_unbalanced_quotes() {
        let toml = r#"
[target]
host = "10.0.0.5"

[commands]
start = "start 'unterminated"
shutdown = "stop"
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("'commands.start' cannot be parsed"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[target]
host = ""
port = 0

[commands]
start = ""
shutdown = "stop"

[health]
interval_ms = 0
"#;
        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("'target.host' must not be empty"));
        assert!(err.contains("'target.port' must be greater than 0"));
        assert!(err.contains("'commands.start' must not be empty"));
        assert!(err.contains("'health.interval_ms' must be greater than 0"));
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let toml = format!(
            "{}\n[server]\nclient_timeout_secs = 0\n\n[lifecycle]\ntransition_timeout_secs = 0\n",
            MINIMAL
        );
        let err = Config::parse(&toml).unwrap_err().to_string();
        assert!(err.contains("'server.client_timeout_secs' must be greater than 0"));
        assert!(err.contains("'lifecycle.transition_timeout_secs' must be greater than 0"));
    }

    #[test]
    fn test_command_lookup() {
        let commands = CommandsConfig::new("boot", "halt");
        assert_eq!(commands.get("start"), Some("boot"));
        assert_eq!(commands.get("shutdown"), Some("halt"));
        assert_eq!(commands.get("restart"), None);
    }

    #[test]
    fn test_load_missing_file_shows_example() {
        let err = Config::load("/nonexistent/wakegate.toml")
            .unwrap_err()
            .to_string();
        assert!(err.contains("/nonexistent/wakegate.toml"));
        assert!(err.contains("[commands]"));
    }
}
