// =============================================================================
// Configuration — App config file, environment settings, CA bundle
// =============================================================================
//
// The app config is a JSON file with section objects; every field carries a
// serde default so that partial (or absent) files load cleanly. Environment
// variables use lowercase names; the uppercase spellings are still accepted
// but reported once through the loader's deprecation latch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::wall_detector::DetectorConfig;

/// Environment variable consulted by the TLS stack for root certificates.
/// A configured CA bundle is advertised through it.
pub const ROOT_CERT_ENV: &str = "SSL_CERT_FILE";

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Unable to read config file {path}: {source}")]
    FileUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid JSON in config file {path}: {source}")]
    FileInvalid {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{name} must be a float, got {value:?}")]
    InvalidFloat { name: String, value: String },
    #[error("{name} must be a boolean, got {value:?}")]
    InvalidBool { name: String, value: String },
    #[error("{name} must be a comma-separated list of integers, got {value:?}")]
    InvalidIdList { name: String, value: String },
    #[error("{name} must be BASE or ALL, got {value:?}")]
    InvalidInstrumentStatus { name: String, value: String },
    #[error("Unknown log level: {0}")]
    InvalidLogLevel(String),
    #[error("Missing required environment variables: {0}")]
    MissingEnv(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CaBundleError {
    #[error("tinvest_ca_bundle_b64 is not valid base64")]
    InvalidBase64,
    #[error("tinvest_ca_bundle_b64 decoded to empty content")]
    EmptyBase64,
    #[error("tinvest_ca_bundle_b64 does not look like PEM data")]
    Base64NotPem,
    #[error("tinvest_ca_bundle_path not found: {0}")]
    PathNotFound(PathBuf),
    #[error("tinvest_ca_bundle_path is not a file: {0}")]
    PathNotAFile(PathBuf),
    #[error("tinvest_ca_bundle_path is not readable: {0}")]
    PathNotReadable(PathBuf),
    #[error("tinvest_ca_bundle_path is empty: {0}")]
    PathEmpty(PathBuf),
    #[error("tinvest_ca_bundle_path does not look like PEM: {0}")]
    PathNotPem(PathBuf),
    #[error("unable to write CA bundle to temp file {path}: {source}")]
    TempWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_depth() -> u32 {
    20
}

fn default_top_n_levels() -> usize {
    10
}

fn default_candidate_ratio_to_median() -> f64 {
    10.0
}

fn default_candidate_max_distance_ticks() -> u32 {
    10
}

fn default_confirm_dwell_seconds() -> f64 {
    30.0
}

fn default_confirm_max_distance_ticks() -> u32 {
    10
}

fn default_consume_window_seconds() -> f64 {
    8.0
}

fn default_consume_drop_pct() -> f64 {
    0.2
}

fn default_reposition_window_seconds() -> f64 {
    3.0
}

fn default_reposition_ticks() -> u32 {
    1
}

fn default_reposition_similar_pct() -> f64 {
    0.2
}

fn default_reposition_max() -> u32 {
    1
}

fn default_trades_window_seconds() -> f64 {
    20.0
}

fn default_e_min() -> f64 {
    200.0
}

fn default_a_min() -> f64 {
    0.2
}

fn default_cancel_share_max() -> f64 {
    0.7
}

fn default_min_exec_confirm() -> f64 {
    50.0
}

fn default_cooldown_confirmed_seconds() -> f64 {
    120.0
}

fn default_cooldown_consuming_seconds() -> f64 {
    45.0
}

fn default_max_symbols() -> usize {
    10
}

fn default_walls_interval_seconds() -> f64 {
    5.0
}

fn default_poll_interval_seconds() -> f64 {
    2.0
}

fn default_send_events() -> Vec<String> {
    vec![
        "wall_confirmed".to_string(),
        "wall_consuming".to_string(),
        "wall_lost".to_string(),
    ]
}

fn default_cooldown_seconds() -> HashMap<String, f64> {
    HashMap::from([
        ("wall_candidate".to_string(), 60.0),
        ("wall_confirmed".to_string(), 120.0),
        ("wall_consuming".to_string(), 45.0),
        ("wall_lost".to_string(), 120.0),
    ])
}

fn default_button_text() -> String {
    "Open in T-Invest".to_string()
}

// =============================================================================
// App config sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSection {
    #[serde(default = "default_depth")]
    pub depth: u32,
}

impl Default for MarketDataSection {
    fn default() -> Self {
        Self {
            depth: default_depth(),
        }
    }
}

/// Wall-engine thresholds as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallsSection {
    #[serde(default = "default_top_n_levels")]
    pub top_n_levels: usize,
    #[serde(default = "default_candidate_ratio_to_median")]
    pub candidate_ratio_to_median: f64,
    #[serde(default = "default_candidate_max_distance_ticks")]
    pub candidate_max_distance_ticks: u32,
    #[serde(default = "default_confirm_dwell_seconds")]
    pub confirm_dwell_seconds: f64,
    #[serde(default = "default_confirm_max_distance_ticks")]
    pub confirm_max_distance_ticks: u32,
    #[serde(default = "default_consume_window_seconds")]
    pub consume_window_seconds: f64,
    #[serde(default = "default_consume_drop_pct")]
    pub consume_drop_pct: f64,
    #[serde(default)]
    pub teleport_reset: bool,
    #[serde(default)]
    pub abs_qty_threshold: f64,
    #[serde(default = "default_reposition_window_seconds")]
    pub reposition_window_seconds: f64,
    #[serde(default = "default_reposition_ticks")]
    pub reposition_ticks: u32,
    #[serde(default = "default_reposition_similar_pct")]
    pub reposition_similar_pct: f64,
    #[serde(default = "default_reposition_max")]
    pub reposition_max: u32,
    #[serde(default = "default_trades_window_seconds")]
    pub trades_window_seconds: f64,
    #[serde(default = "default_e_min")]
    pub e_min: f64,
    #[serde(default = "default_a_min")]
    pub a_min: f64,
    #[serde(default = "default_cancel_share_max")]
    pub cancel_share_max: f64,
    #[serde(default = "default_min_exec_confirm")]
    pub min_exec_confirm: f64,
    #[serde(default = "default_cooldown_confirmed_seconds")]
    pub cooldown_confirmed_seconds: f64,
    #[serde(default = "default_cooldown_consuming_seconds")]
    pub cooldown_consuming_seconds: f64,
    #[serde(default = "default_max_symbols")]
    pub max_symbols: usize,
}

impl Default for WallsSection {
    fn default() -> Self {
        Self {
            top_n_levels: default_top_n_levels(),
            candidate_ratio_to_median: default_candidate_ratio_to_median(),
            candidate_max_distance_ticks: default_candidate_max_distance_ticks(),
            confirm_dwell_seconds: default_confirm_dwell_seconds(),
            confirm_max_distance_ticks: default_confirm_max_distance_ticks(),
            consume_window_seconds: default_consume_window_seconds(),
            consume_drop_pct: default_consume_drop_pct(),
            teleport_reset: false,
            abs_qty_threshold: 0.0,
            reposition_window_seconds: default_reposition_window_seconds(),
            reposition_ticks: default_reposition_ticks(),
            reposition_similar_pct: default_reposition_similar_pct(),
            reposition_max: default_reposition_max(),
            trades_window_seconds: default_trades_window_seconds(),
            e_min: default_e_min(),
            a_min: default_a_min(),
            cancel_share_max: default_cancel_share_max(),
            min_exec_confirm: default_min_exec_confirm(),
            cooldown_confirmed_seconds: default_cooldown_confirmed_seconds(),
            cooldown_consuming_seconds: default_cooldown_consuming_seconds(),
            max_symbols: default_max_symbols(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSection {
    #[serde(default)]
    pub walls_enabled: bool,
    #[serde(default = "default_walls_interval_seconds")]
    pub walls_interval_seconds: f64,
}

impl Default for DebugSection {
    fn default() -> Self {
        Self {
            walls_enabled: false,
            walls_interval_seconds: default_walls_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub polling: bool,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_true")]
    pub startup_message: bool,
    #[serde(default = "default_send_events")]
    pub send_events: Vec<String>,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: HashMap<String, f64>,
    #[serde(default = "default_true")]
    pub disable_web_preview: bool,
    #[serde(default = "default_true")]
    pub commands_enabled: bool,
    #[serde(default = "default_true")]
    pub include_instrument_button: bool,
    #[serde(default = "default_button_text")]
    pub button_text: String,
    #[serde(default)]
    pub append_security_share_utm: bool,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            enabled: false,
            polling: true,
            poll_interval_seconds: default_poll_interval_seconds(),
            startup_message: true,
            send_events: default_send_events(),
            cooldown_seconds: default_cooldown_seconds(),
            disable_web_preview: true,
            commands_enabled: true,
            include_instrument_button: true,
            button_text: default_button_text(),
            append_security_share_utm: false,
        }
    }
}

/// Top-level app configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub marketdata: MarketDataSection,
    #[serde(default)]
    pub walls: WallsSection,
    #[serde(default)]
    pub debug: DebugSection,
    #[serde(default)]
    pub telegram: TelegramSection,
}

impl AppConfig {
    /// Map the file sections into the detector's own config record.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            max_symbols: self.walls.max_symbols,
            depth: self.marketdata.depth,
            distance_ticks: self.walls.candidate_max_distance_ticks,
            k_ratio: self.walls.candidate_ratio_to_median,
            abs_qty_threshold: self.walls.abs_qty_threshold,
            dwell_seconds: self.walls.confirm_dwell_seconds,
            reposition_window_seconds: self.walls.reposition_window_seconds,
            reposition_ticks: self.walls.reposition_ticks,
            reposition_similar_pct: self.walls.reposition_similar_pct,
            reposition_max: self.walls.reposition_max,
            trades_window_seconds: self.walls.trades_window_seconds,
            e_min: self.walls.e_min,
            a_min: self.walls.a_min,
            cancel_share_max: self.walls.cancel_share_max,
            consuming_drop_pct: self.walls.consume_drop_pct,
            consuming_window_seconds: self.walls.consume_window_seconds,
            min_exec_confirm: self.walls.min_exec_confirm,
            cooldown_confirmed_seconds: self.walls.cooldown_confirmed_seconds,
            cooldown_consuming_seconds: self.walls.cooldown_consuming_seconds,
            vref_levels: self.walls.top_n_levels,
            teleport_reset: self.walls.teleport_reset,
        }
    }
}

/// Load the app config. `None` yields the built-in defaults; a named file
/// must exist and parse.
pub fn load_app_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::FileInvalid {
        path: path.to_path_buf(),
        source,
    })
}

// =============================================================================
// Environment settings
// =============================================================================

/// Instrument visibility requested from the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentStatus {
    Base,
    All,
}

impl InstrumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "BASE",
            Self::All => "ALL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub token: Option<String>,
    pub ca_bundle_path: Option<String>,
    pub ca_bundle_b64: Option<String>,
    pub log_level: Option<String>,
    pub retry_backoff_initial_seconds: f64,
    pub retry_backoff_max_seconds: f64,
    pub stream_idle_sleep_seconds: f64,
    pub instrument_status: InstrumentStatus,
    pub tg_bot_token: Option<String>,
    pub tg_chat_ids: Vec<i64>,
    pub tg_allowed_user_ids: Vec<i64>,
    pub tg_polling: bool,
    pub tg_parse_mode: String,
}

/// Environment loader. Lowercase names are canonical; uppercase hits are
/// collected once behind the deprecation latch.
pub struct EnvLoader<F: Fn(&str) -> Option<String>> {
    source: F,
    deprecation_reported: bool,
    deprecated_seen: Vec<String>,
}

/// Loader over the real process environment.
pub fn process_env_loader() -> EnvLoader<impl Fn(&str) -> Option<String>> {
    EnvLoader::new(|name: &str| std::env::var(name).ok())
}

impl<F: Fn(&str) -> Option<String>> EnvLoader<F> {
    pub fn new(source: F) -> Self {
        Self {
            source,
            deprecation_reported: false,
            deprecated_seen: Vec::new(),
        }
    }

    /// Uppercase variable names seen during the last `load`, surfaced at
    /// most once (the latch).
    pub fn take_deprecated(&mut self) -> Option<Vec<String>> {
        if self.deprecation_reported || self.deprecated_seen.is_empty() {
            return None;
        }
        self.deprecation_reported = true;
        Some(self.deprecated_seen.clone())
    }

    pub fn load(&mut self) -> Result<EnvSettings, ConfigError> {
        let mut deprecated = Vec::new();
        let token = self.lookup("tinvest_token", &mut deprecated);
        let ca_bundle_path = self.lookup("tinvest_ca_bundle_path", &mut deprecated);
        let ca_bundle_b64 = self.lookup("tinvest_ca_bundle_b64", &mut deprecated);
        let log_level = self.lookup("log_level", &mut deprecated);
        let retry_backoff_initial_seconds = self.parse_float(
            "wallwatch_retry_backoff_initial_seconds",
            1.0,
            &mut deprecated,
        )?;
        let retry_backoff_max_seconds =
            self.parse_float("wallwatch_retry_backoff_max_seconds", 30.0, &mut deprecated)?;
        let stream_idle_sleep_seconds =
            self.parse_float("wallwatch_stream_idle_sleep_seconds", 3600.0, &mut deprecated)?;
        let instrument_status =
            self.parse_instrument_status("wallwatch_instrument_status", &mut deprecated)?;
        let tg_bot_token = self.lookup("tg_bot_token", &mut deprecated);
        let tg_chat_ids = self.parse_id_list("tg_chat_id", &mut deprecated)?;
        let tg_allowed_user_ids = self.parse_id_list("tg_allowed_user_ids", &mut deprecated)?;
        let tg_polling = self.parse_bool("tg_polling", true, &mut deprecated)?;
        let tg_parse_mode = self
            .lookup("tg_parse_mode", &mut deprecated)
            .unwrap_or_else(|| "HTML".to_string());

        self.deprecated_seen = deprecated;
        Ok(EnvSettings {
            token,
            ca_bundle_path,
            ca_bundle_b64,
            log_level,
            retry_backoff_initial_seconds,
            retry_backoff_max_seconds,
            stream_idle_sleep_seconds,
            instrument_status,
            tg_bot_token,
            tg_chat_ids,
            tg_allowed_user_ids,
            tg_polling,
            tg_parse_mode,
        })
    }

    fn lookup(&self, name: &str, deprecated: &mut Vec<String>) -> Option<String> {
        if let Some(value) = (self.source)(name).and_then(clean_value) {
            return Some(value);
        }
        let upper = name.to_uppercase();
        let value = (self.source)(&upper).and_then(clean_value)?;
        deprecated.push(upper);
        Some(value)
    }

    fn parse_float(
        &self,
        name: &str,
        default: f64,
        deprecated: &mut Vec<String>,
    ) -> Result<f64, ConfigError> {
        match self.lookup(name, deprecated) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidFloat {
                name: name.to_string(),
                value: raw,
            }),
        }
    }

    fn parse_bool(
        &self,
        name: &str,
        default: bool,
        deprecated: &mut Vec<String>,
    ) -> Result<bool, ConfigError> {
        match self.lookup(name, deprecated) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidBool {
                    name: name.to_string(),
                    value: raw,
                }),
            },
        }
    }

    fn parse_id_list(
        &self,
        name: &str,
        deprecated: &mut Vec<String>,
    ) -> Result<Vec<i64>, ConfigError> {
        let Some(raw) = self.lookup(name, deprecated) else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse().map_err(|_| ConfigError::InvalidIdList {
                    name: name.to_string(),
                    value: raw.clone(),
                })
            })
            .collect()
    }

    fn parse_instrument_status(
        &self,
        name: &str,
        deprecated: &mut Vec<String>,
    ) -> Result<InstrumentStatus, ConfigError> {
        match self.lookup(name, deprecated) {
            None => Ok(InstrumentStatus::Base),
            Some(raw) => match raw.to_ascii_uppercase().as_str() {
                "BASE" => Ok(InstrumentStatus::Base),
                "ALL" => Ok(InstrumentStatus::All),
                _ => Err(ConfigError::InvalidInstrumentStatus {
                    name: name.to_string(),
                    value: raw,
                }),
            },
        }
    }
}

fn clean_value(value: String) -> Option<String> {
    let cleaned = value.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

pub fn missing_required_env(settings: &EnvSettings) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if settings.token.is_none() {
        missing.push("tinvest_token");
    }
    missing
}

pub fn ensure_required_env(settings: &EnvSettings) -> Result<(), ConfigError> {
    let missing = missing_required_env(settings);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingEnv(missing.join(", ")))
    }
}

/// Telegram delivery needs both a bot token and at least one chat id.
pub fn ensure_telegram_env(settings: &EnvSettings) -> Result<(), ConfigError> {
    let mut missing = Vec::new();
    if settings.tg_bot_token.is_none() {
        missing.push("tg_bot_token");
    }
    if settings.tg_chat_ids.is_empty() {
        missing.push("tg_chat_id");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingEnv(missing.join(", ")))
    }
}

// =============================================================================
// Log level
// =============================================================================

/// Precedence: CLI flag > config file > environment > "info".
pub fn resolve_log_level(
    cli: Option<&str>,
    config: &str,
    env: Option<&str>,
) -> Result<String, ConfigError> {
    let chosen = cli
        .map(str::to_string)
        .or_else(|| {
            if config.is_empty() {
                None
            } else {
                Some(config.to_string())
            }
        })
        .or_else(|| env.map(str::to_string))
        .unwrap_or_else(|| "info".to_string());
    let normalized = chosen.to_ascii_lowercase();
    match normalized.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(normalized),
        _ => Err(ConfigError::InvalidLogLevel(chosen)),
    }
}

// =============================================================================
// CA bundle
// =============================================================================

/// Load the configured CA bundle bytes, if any. The base64 form wins over
/// the path form.
pub fn load_ca_bundle(settings: &EnvSettings) -> Result<Option<Vec<u8>>, CaBundleError> {
    if let Some(b64) = &settings.ca_bundle_b64 {
        return decode_ca_bundle_b64(b64).map(Some);
    }
    if let Some(path) = &settings.ca_bundle_path {
        return read_ca_bundle_path(Path::new(path)).map(Some);
    }
    Ok(None)
}

/// Materialize the configured CA bundle on disk and advertise it through
/// [`ROOT_CERT_ENV`]. Returns the advertised path, if any.
pub fn configure_root_certificates(
    settings: &EnvSettings,
) -> Result<Option<PathBuf>, CaBundleError> {
    if let Some(b64) = &settings.ca_bundle_b64 {
        let data = decode_ca_bundle_b64(b64)?;
        let path = std::env::temp_dir().join(format!("wallwatch-ca-{}.pem", std::process::id()));
        std::fs::write(&path, &data).map_err(|source| CaBundleError::TempWrite {
            path: path.clone(),
            source,
        })?;
        std::env::set_var(ROOT_CERT_ENV, &path);
        return Ok(Some(path));
    }
    if let Some(raw) = &settings.ca_bundle_path {
        let path = Path::new(raw);
        read_ca_bundle_path(path)?;
        std::env::set_var(ROOT_CERT_ENV, path);
        return Ok(Some(path.to_path_buf()));
    }
    Ok(None)
}

fn decode_ca_bundle_b64(value: &str) -> Result<Vec<u8>, CaBundleError> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|_| CaBundleError::InvalidBase64)?;
    if data.is_empty() {
        return Err(CaBundleError::EmptyBase64);
    }
    if !looks_like_pem(&data) {
        return Err(CaBundleError::Base64NotPem);
    }
    Ok(data)
}

fn read_ca_bundle_path(path: &Path) -> Result<Vec<u8>, CaBundleError> {
    if !path.exists() {
        return Err(CaBundleError::PathNotFound(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(CaBundleError::PathNotAFile(path.to_path_buf()));
    }
    let data = std::fs::read(path)
        .map_err(|_| CaBundleError::PathNotReadable(path.to_path_buf()))?;
    if data.is_empty() {
        return Err(CaBundleError::PathEmpty(path.to_path_buf()));
    }
    if !looks_like_pem(&data) {
        return Err(CaBundleError::PathNotPem(path.to_path_buf()));
    }
    Ok(data)
}

fn looks_like_pem(data: &[u8]) -> bool {
    let begin: &[u8] = b"-----BEGIN";
    let end: &[u8] = b"-----END";
    data.windows(begin.len()).any(|window| window == begin)
        && data.windows(end.len()).any(|window| window == end)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loader_from(pairs: &[(&str, &str)]) -> EnvLoader<impl Fn(&str) -> Option<String>> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvLoader::new(move |name: &str| map.get(name).cloned())
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.marketdata.depth, 20);
        assert_eq!(config.walls.top_n_levels, 10);
        assert!((config.walls.candidate_ratio_to_median - 10.0).abs() < f64::EPSILON);
        assert!(!config.walls.teleport_reset);
        assert!(!config.debug.walls_enabled);
        assert!(config.telegram.polling);
        assert!(config.telegram.include_instrument_button);
        assert_eq!(config.telegram.send_events.len(), 3);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let json = r#"{
            "marketdata": { "depth": 50 },
            "walls": { "candidate_ratio_to_median": 4.5, "teleport_reset": true },
            "telegram": { "enabled": true, "send_events": ["wall_confirmed"] }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.marketdata.depth, 50);
        assert!((config.walls.candidate_ratio_to_median - 4.5).abs() < f64::EPSILON);
        assert!(config.walls.teleport_reset);
        assert!((config.walls.confirm_dwell_seconds - 30.0).abs() < f64::EPSILON);
        assert!(config.telegram.enabled);
        assert_eq!(config.telegram.send_events, vec!["wall_confirmed"]);
    }

    #[test]
    fn detector_config_mapping() {
        let json = r#"{
            "marketdata": { "depth": 30 },
            "walls": {
                "top_n_levels": 5,
                "candidate_ratio_to_median": 7.0,
                "candidate_max_distance_ticks": 3,
                "confirm_dwell_seconds": 12.0,
                "consume_window_seconds": 6.0,
                "consume_drop_pct": 0.25,
                "teleport_reset": true
            }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        let detector = config.detector_config();
        assert_eq!(detector.depth, 30);
        assert_eq!(detector.vref_levels, 5);
        assert!((detector.k_ratio - 7.0).abs() < f64::EPSILON);
        assert_eq!(detector.distance_ticks, 3);
        assert!((detector.dwell_seconds - 12.0).abs() < f64::EPSILON);
        assert!((detector.consuming_window_seconds - 6.0).abs() < f64::EPSILON);
        assert!((detector.consuming_drop_pct - 0.25).abs() < f64::EPSILON);
        assert!(detector.teleport_reset);
    }

    #[test]
    fn load_app_config_missing_file_errors() {
        let err = load_app_config(Some(Path::new("/nonexistent/wallwatch.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn env_lowercase_preferred() {
        let mut loader = loader_from(&[
            ("tinvest_token", "token"),
            ("wallwatch_retry_backoff_initial_seconds", "2.5"),
        ]);
        let settings = loader.load().unwrap();
        assert_eq!(settings.token.as_deref(), Some("token"));
        assert!((settings.retry_backoff_initial_seconds - 2.5).abs() < f64::EPSILON);
        assert!(loader.take_deprecated().is_none());
    }

    #[test]
    fn env_uppercase_reported_once() {
        let mut loader = loader_from(&[("TINVEST_TOKEN", "token")]);
        let settings = loader.load().unwrap();
        assert_eq!(settings.token.as_deref(), Some("token"));
        let deprecated = loader.take_deprecated().expect("latch fires once");
        assert!(deprecated.contains(&"TINVEST_TOKEN".to_string()));
        assert!(loader.take_deprecated().is_none());
    }

    #[test]
    fn env_invalid_float_errors() {
        let mut loader = loader_from(&[("wallwatch_retry_backoff_max_seconds", "fast")]);
        let err = loader.load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFloat { .. }));
    }

    #[test]
    fn env_chat_id_list_parsing() {
        let mut loader = loader_from(&[
            ("tg_chat_id", "123, -456"),
            ("tg_allowed_user_ids", "42"),
        ]);
        let settings = loader.load().unwrap();
        assert_eq!(settings.tg_chat_ids, vec![123, -456]);
        assert_eq!(settings.tg_allowed_user_ids, vec![42]);

        let mut loader = loader_from(&[("tg_chat_id", "abc")]);
        assert!(matches!(
            loader.load().unwrap_err(),
            ConfigError::InvalidIdList { .. }
        ));
    }

    #[test]
    fn env_instrument_status_parsing() {
        let mut loader = loader_from(&[("wallwatch_instrument_status", "all")]);
        assert_eq!(
            loader.load().unwrap().instrument_status,
            InstrumentStatus::All
        );
        let mut loader = loader_from(&[("wallwatch_instrument_status", "SOME")]);
        assert!(matches!(
            loader.load().unwrap_err(),
            ConfigError::InvalidInstrumentStatus { .. }
        ));
    }

    #[test]
    fn missing_token_is_required() {
        let mut loader = loader_from(&[]);
        let settings = loader.load().unwrap();
        let err = ensure_required_env(&settings).unwrap_err();
        assert!(err.to_string().contains("tinvest_token"));
    }

    #[test]
    fn telegram_env_requires_token_and_chat() {
        let mut loader = loader_from(&[("tg_bot_token", "bot")]);
        let settings = loader.load().unwrap();
        let err = ensure_telegram_env(&settings).unwrap_err();
        assert!(err.to_string().contains("tg_chat_id"));
    }

    #[test]
    fn log_level_precedence_and_validation() {
        assert_eq!(
            resolve_log_level(Some("DEBUG"), "info", Some("warn")).unwrap(),
            "debug"
        );
        assert_eq!(resolve_log_level(None, "warn", None).unwrap(), "warn");
        assert_eq!(resolve_log_level(None, "", Some("error")).unwrap(), "error");
        assert_eq!(resolve_log_level(None, "", None).unwrap(), "info");
        assert!(matches!(
            resolve_log_level(Some("loud"), "info", None),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    fn settings_with(b64: Option<&str>, path: Option<&str>) -> EnvSettings {
        let mut loader = loader_from(&[]);
        let mut settings = loader.load().unwrap();
        settings.ca_bundle_b64 = b64.map(str::to_string);
        settings.ca_bundle_path = path.map(str::to_string);
        settings
    }

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    #[test]
    fn ca_bundle_b64_invalid() {
        let settings = settings_with(Some("not-base64@@@"), None);
        assert!(matches!(
            load_ca_bundle(&settings).unwrap_err(),
            CaBundleError::InvalidBase64
        ));
    }

    #[test]
    fn ca_bundle_b64_not_pem() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("just text");
        let settings = settings_with(Some(&encoded), None);
        assert!(matches!(
            load_ca_bundle(&settings).unwrap_err(),
            CaBundleError::Base64NotPem
        ));
    }

    #[test]
    fn ca_bundle_b64_valid() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(PEM);
        let settings = settings_with(Some(&encoded), None);
        let bundle = load_ca_bundle(&settings).unwrap().expect("bundle decoded");
        assert_eq!(bundle, PEM.as_bytes());
    }

    #[test]
    fn ca_bundle_path_missing() {
        let settings = settings_with(None, Some("/nonexistent/bundle.pem"));
        assert!(matches!(
            load_ca_bundle(&settings).unwrap_err(),
            CaBundleError::PathNotFound(_)
        ));
    }

    #[test]
    fn ca_bundle_path_empty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let settings = settings_with(None, Some(file.path().to_str().unwrap()));
        assert!(matches!(
            load_ca_bundle(&settings).unwrap_err(),
            CaBundleError::PathEmpty(_)
        ));
    }

    #[test]
    fn ca_bundle_path_valid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PEM.as_bytes()).unwrap();
        file.flush().unwrap();
        let settings = settings_with(None, Some(file.path().to_str().unwrap()));
        let bundle = load_ca_bundle(&settings).unwrap().expect("bundle read");
        assert_eq!(bundle, PEM.as_bytes());
    }

    #[test]
    fn no_ca_bundle_configured() {
        let settings = settings_with(None, None);
        assert!(load_ca_bundle(&settings).unwrap().is_none());
        assert!(configure_root_certificates(&settings).unwrap().is_none());
    }
}
