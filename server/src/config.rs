use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(name = "chatline", about = "Self-hosted chat server")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Holds the database and the uploaded files.
    pub data_dir: PathBuf,
    pub max_upload_mb: u64,
    pub logging_enabled: bool,
    /// Attach link previews to text messages containing a URL.
    pub preview_enabled: bool,
    pub preview_timeout: Duration,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    uploads: FileUploads,
    #[serde(default)]
    preview: FilePreview,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileStorage {
    data_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct FileUploads {
    #[serde(default = "default_max_upload_mb")]
    max_mb: u64,
}

#[derive(Deserialize)]
struct FilePreview {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_preview_timeout_secs")]
    timeout_secs: u64,
}

fn default_port() -> u16 {
    8787
}

fn default_true() -> bool {
    true
}

fn default_max_upload_mb() -> u64 {
    16
}

fn default_preview_timeout_secs() -> u64 {
    5
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for FileUploads {
    fn default() -> Self {
        Self {
            max_mb: default_max_upload_mb(),
        }
    }
}

impl Default for FilePreview {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            timeout_secs: default_preview_timeout_secs(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHATLINE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chatline.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => toml::from_str::<FileConfig>(&String::from_utf8_lossy(&bytes))
                .with_context(|| format!("invalid config file {}", config_path.display()))?,
            Err(_) => FileConfig::default(),
        };

        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        if let Some(p) = env_parse("CHATLINE_PORT") {
            port = p;
        }
        if let Some(l) = env_parse("CHATLINE_LOGGING") {
            logging = l;
        }
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port: {port} is outside 1024..=65535");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{port}")
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or(file_cfg.storage.data_dir)
            .unwrap_or_else(|| PathBuf::from("./chatline_data"));
        let max_upload_mb = env_parse("MAX_UPLOAD_MB").unwrap_or(file_cfg.uploads.max_mb);
        let timeout_secs =
            env_parse("PREVIEW_TIMEOUT_SECS").unwrap_or(file_cfg.preview.timeout_secs);

        Ok(Self {
            bind,
            data_dir,
            max_upload_mb,
            logging_enabled: logging,
            preview_enabled: file_cfg.preview.enabled,
            preview_timeout: Duration::from_secs(timeout_secs.max(1)),
        })
    }

    /// Upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chatline.db")
    }

    pub fn file_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }
}
