use anyhow::{Context, Result};
use chrono::FixedOffset;
use faceguard_core::oracle::gemini;
use faceguard_core::DayBoundary;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/faceguard/faceguardd.toml";

/// Daemon configuration: defaults, then the TOML file, then `FACEGUARD_*` env vars.
#[derive(Debug)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SQLite snapshot database.
    pub db_path: PathBuf,
    /// Base URL of the Gemini-compatible oracle API.
    pub oracle_endpoint: String,
    pub oracle_model: String,
    /// Env-only; never read from the config file.
    pub oracle_api_key: Option<String>,
    /// Upper bound for one oracle call.
    pub oracle_timeout_secs: u64,
    /// How long a resolved scan stays on display.
    pub display_interval_secs: u64,
    /// Frames discarded after opening the camera (AE stabilization).
    pub warmup_frames: usize,
    /// Raw frames tried per still before giving up on dark frames.
    pub capture_attempts: usize,
    pub jpeg_quality: u8,
    /// Fixed organizational offset for the attendance day; `None` = host local time.
    pub utc_offset: Option<FixedOffset>,
    /// Use the session bus instead of the system bus.
    pub session_bus: bool,
}

/// Optional overrides read from the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    db_path: Option<PathBuf>,
    oracle_endpoint: Option<String>,
    oracle_model: Option<String>,
    oracle_timeout_secs: Option<u64>,
    display_interval_secs: Option<u64>,
    warmup_frames: Option<usize>,
    capture_attempts: Option<usize>,
    jpeg_quality: Option<u8>,
    utc_offset: Option<String>,
    session_bus: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("faceguard");

        Self {
            camera_device: "/dev/video0".to_string(),
            db_path: data_dir.join("faceguard.db"),
            oracle_endpoint: gemini::DEFAULT_ENDPOINT.to_string(),
            oracle_model: gemini::DEFAULT_MODEL.to_string(),
            oracle_api_key: None,
            oracle_timeout_secs: 20,
            display_interval_secs: 5,
            warmup_frames: 4,
            capture_attempts: 5,
            jpeg_quality: 85,
            utc_offset: None,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load from `FACEGUARD_CONFIG` (or the default path if it exists) and the environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        let explicit = std::env::var("FACEGUARD_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if explicit.is_some() || path.exists() {
            let file = read_file(&path)?;
            config.apply_file(file)?;
            tracing::info!(path = %path.display(), "config file loaded");
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.oracle_endpoint {
            self.oracle_endpoint = v;
        }
        if let Some(v) = file.oracle_model {
            self.oracle_model = v;
        }
        if let Some(v) = file.oracle_timeout_secs {
            self.oracle_timeout_secs = v;
        }
        if let Some(v) = file.display_interval_secs {
            self.display_interval_secs = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.capture_attempts {
            self.capture_attempts = v;
        }
        if let Some(v) = file.jpeg_quality {
            self.jpeg_quality = v;
        }
        if let Some(v) = file.utc_offset {
            self.utc_offset = Some(parse_offset(&v)?);
        }
        if let Some(v) = file.session_bus {
            self.session_bus = v;
        }
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("FACEGUARD_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("FACEGUARD_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEGUARD_ORACLE_ENDPOINT") {
            self.oracle_endpoint = v;
        }
        if let Some(v) = var("FACEGUARD_ORACLE_MODEL") {
            self.oracle_model = v;
        }
        self.oracle_api_key = var("FACEGUARD_ORACLE_API_KEY")
            .or_else(|| var("GEMINI_API_KEY"))
            .filter(|k| !k.trim().is_empty());
        self.oracle_timeout_secs =
            parse_or(&var, "FACEGUARD_ORACLE_TIMEOUT_SECS", self.oracle_timeout_secs);
        self.display_interval_secs =
            parse_or(&var, "FACEGUARD_DISPLAY_INTERVAL_SECS", self.display_interval_secs);
        self.warmup_frames = parse_or(&var, "FACEGUARD_WARMUP_FRAMES", self.warmup_frames);
        self.capture_attempts = parse_or(&var, "FACEGUARD_CAPTURE_ATTEMPTS", self.capture_attempts);
        self.jpeg_quality = parse_or(&var, "FACEGUARD_JPEG_QUALITY", self.jpeg_quality);
        if let Some(v) = var("FACEGUARD_UTC_OFFSET") {
            self.utc_offset = Some(parse_offset(&v)?);
        }
        if let Some(v) = var("FACEGUARD_SESSION_BUS") {
            self.session_bus = v != "0";
        }
        Ok(())
    }

    pub fn day_boundary(&self) -> DayBoundary {
        match self.utc_offset {
            Some(offset) => DayBoundary::Fixed(offset),
            None => DayBoundary::Local,
        }
    }

    pub fn oracle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn display_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.display_interval_secs)
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `+HH:MM`, `-HH:MM` or `Z`.
fn parse_offset(s: &str) -> Result<FixedOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s == "UTC" {
        return FixedOffset::east_opt(0).context("zero offset");
    }
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => anyhow::bail!("utc offset must start with + or -: {s:?}"),
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let h: i32 = h.parse().with_context(|| format!("bad offset hours in {s:?}"))?;
    let m: i32 = m.parse().with_context(|| format!("bad offset minutes in {s:?}"))?;
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
        .with_context(|| format!("utc offset out of range: {s:?}"))
}
