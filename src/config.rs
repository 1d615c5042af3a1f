use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::script::ScriptIsolation;

/// Transport carrying JSON-RPC messages to the protocol handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One JSON message per line on stdin/stdout
    #[default]
    Stdio,
    /// One JSON message per POST body
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkilldConfig {
    /// Directory holding the skill database
    pub data_dir: PathBuf,
    /// Optional directory watched for drop-in skills
    pub skills_dir: Option<PathBuf>,
    pub composition: CompositionConfig,
    pub sandbox: SandboxSettings,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionConfig {
    pub max_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
    pub script_isolation: ScriptIsolation,
    pub allow_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub http_addr: SocketAddr,
    /// Expose the skills/* extension methods to clients
    pub allow_registration: bool,
}

impl Default for SkilldConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            data_dir: PathBuf::from(home).join(".skilld"),
            skills_dir: None,
            composition: CompositionConfig::default(),
            sandbox: SandboxSettings::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self { max_depth: 5 }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            memory_limit_mb: 100,
            script_isolation: ScriptIsolation::None,
            allow_network: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            allow_registration: true,
        }
    }
}

impl SandboxSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

impl SkilldConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `SKILLD_*` environment overrides on top of the file values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("SKILLD_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("SKILLD_SKILLS_DIR") {
            if !dir.is_empty() {
                self.skills_dir = Some(PathBuf::from(dir));
            }
        }
        match std::env::var("SKILLD_SANDBOX").as_deref() {
            Ok("bubblewrap") | Ok("bwrap") => {
                self.sandbox.script_isolation = ScriptIsolation::Bubblewrap
            }
            Ok("firejail") => self.sandbox.script_isolation = ScriptIsolation::Firejail,
            Ok("nsjail") => self.sandbox.script_isolation = ScriptIsolation::Nsjail,
            _ => {}
        }
        if std::env::var("SKILLD_SANDBOX_NETWORK").is_ok() {
            self.sandbox.allow_network = true;
        }
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("skills.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = SkilldConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.composition.max_depth, 5);
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(5));
        assert_eq!(config.server.transport, TransportKind::Stdio);
        assert!(config.server.allow_registration);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("skilld.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/skilld"

[composition]
max_depth = 3

[sandbox]
timeout_ms = 250
script_isolation = "firejail"

[server]
transport = "http"
http_addr = "0.0.0.0:9000"
"#,
        )
        .unwrap();

        let config = SkilldConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/skilld"));
        assert_eq!(config.composition.max_depth, 3);
        assert_eq!(config.sandbox.timeout(), Duration::from_millis(250));
        assert_eq!(config.sandbox.memory_limit_mb, 100);
        assert_eq!(config.sandbox.script_isolation, ScriptIsolation::Firejail);
        assert_eq!(config.server.transport, TransportKind::Http);
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/skilld/skills.db")
        );
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "[composition\nmax_depth = ").unwrap();
        assert!(SkilldConfig::load(&path).is_err());
    }
}
