// TOML config parsing for scriptd.toml.
//
// Precedence, lowest first: built-in defaults, the TOML file, then
// command-line flags and their environment variables (see main.rs).

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "scriptd.toml";

pub const DEFAULT_LANDING_MESSAGE: &str =
    "Hello world! scriptd is running and the startup script was launched.";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub script: ScriptConfig,
    pub files: FilesConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Body served on `GET /`.
    pub landing_message: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            landing_message: DEFAULT_LANDING_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptConfig {
    pub path: PathBuf,
    /// Program the script is handed to. Empty means exec the script itself.
    pub interpreter: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Permission bits applied before launch.
    pub mode: u32,
    /// `KEY=VALUE` file merged into the child's environment, if present.
    pub env_file: Option<PathBuf>,
    pub stop_grace_secs: u64,
    /// Number of output lines retained for `GET /logs`.
    pub log_capacity: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("start.sh"),
            interpreter: "bash".to_string(),
            args: Vec::new(),
            workdir: None,
            mode: 0o777,
            env_file: Some(PathBuf::from(".env")),
            stop_grace_secs: 5,
            log_capacity: 100,
        }
    }
}

impl ScriptConfig {
    /// Short name used to prefix forwarded output, e.g. `start.sh`.
    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Absolute location of the script. A relative `path` is taken against
    /// `workdir` when set, and `workdir` itself against `cwd`, so the file
    /// that gets chmodded is the one that gets executed.
    pub fn resolve_path(&self, cwd: &Path) -> PathBuf {
        let base = match &self.workdir {
            Some(dir) => cwd.join(dir),
            None => cwd.to_path_buf(),
        };
        base.join(&self.path)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FilesConfig {
    /// Text file served on `GET /sub`.
    pub subscription: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            subscription: PathBuf::from("./.npm/sub.txt"),
        }
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub script: Option<PathBuf>,
    pub sub_path: Option<PathBuf>,
}

impl Config {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(bind) = overrides.bind {
            self.server.bind = bind;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(script) = overrides.script {
            self.script.path = script;
        }
        if let Some(sub_path) = overrides.sub_path {
            self.files.subscription = sub_path;
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

/// Load the config from `path`, or from `scriptd.toml` when it exists.
/// An explicit path that cannot be read is an error; a missing default is not.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                tracing::debug!("No {} found, using built-in defaults", DEFAULT_CONFIG_PATH);
                return Ok(Config::default());
            }
            default
        }
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = Config::parse(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}
