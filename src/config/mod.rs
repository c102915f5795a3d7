#![forbid(unsafe_code)]

//! Runtime configuration and the on-disk directory layout.
//!
//! Key precedence: per-task override > CLI flag > environment variable
//! (`CLAUDE_AUTOPILOT_<UPPER_SNAKE_KEY>`) > config file > built-in default.
//! The per-task layer is applied where tasks are consumed; everything else
//! resolves here.

pub mod matchers;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::error::AutopilotError;
use crate::fsutil;

pub const ENV_PREFIX: &str = "CLAUDE_AUTOPILOT_";

/// Environment override for the base directory; primarily for test isolation.
pub const DIR_ENV: &str = "CLAUDE_AUTOPILOT_DIR";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub skip_permissions: bool,
    pub hang_timeout: Duration,
    pub webhook_url: String,
    pub notification_desktop: bool,
    pub notification_bell: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            skip_permissions: false,
            hang_timeout: Duration::from_secs(10 * 60),
            webhook_url: String::new(),
            notification_desktop: false,
            notification_bell: true,
        }
    }
}

pub const KNOWN_KEYS: &[&str] = &[
    "skip_permissions",
    "hang_timeout",
    "webhook_url",
    "notification_desktop",
    "notification_bell",
];

/// On-disk representation; durations are stored as strings ("10m").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFileRaw {
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_permissions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hang_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_desktop: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_bell: Option<bool>,
}

/// The directory layout rooted at the base directory
/// (default `~/.claude-autopilot/`).
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    #[must_use]
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Resolves the base directory: `CLAUDE_AUTOPILOT_DIR` when set,
    /// otherwise `~/.claude-autopilot`.
    #[must_use]
    pub fn resolve() -> Self {
        if let Some(dir) = std::env::var_os(DIR_ENV)
            && !dir.is_empty()
        {
            return Self::new(PathBuf::from(dir));
        }
        let home = home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".claude-autopilot"))
    }

    #[must_use]
    pub fn tasks_dir(&self) -> PathBuf {
        self.base.join("tasks")
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.base.join("state")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    #[must_use]
    pub fn control_dir(&self) -> PathBuf {
        self.base.join("control")
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.base.join("runner.lock")
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.yaml")
    }

    #[must_use]
    pub fn matchers_file(&self) -> PathBuf {
        self.base.join("matchers.yaml")
    }

    #[must_use]
    pub fn first_run_ack_file(&self) -> PathBuf {
        self.base.join(".first-run-ack")
    }

    #[must_use]
    pub fn task_log_file(&self, id: &str) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }

    #[must_use]
    pub fn summary_log_file(&self) -> PathBuf {
        self.logs_dir().join("summary.log")
    }

    /// Creates the full directory tree: base, state, tasks, logs, control.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            self.base.clone(),
            self.state_dir(),
            self.tasks_dir(),
            self.logs_dir(),
            self.control_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Every directory in which atomic writes occur; the orphan sweep set.
    #[must_use]
    pub fn sweep_dirs(&self, project_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.base.clone(),
            self.state_dir(),
            self.tasks_dir(),
            self.control_dir(),
        ];
        if let Some(p) = project_dir {
            dirs.push(p.to_path_buf());
        }
        dirs
    }
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    None
}

/// Loads the effective configuration: file, then environment, then the given
/// CLI flag overrides.
pub fn load(paths: &Paths, overrides: &BTreeMap<String, String>) -> anyhow::Result<Config> {
    let mut cfg = Config::default();

    let raw = load_raw_file(&paths.config_file())?;
    apply_file(&raw, &mut cfg);
    apply_env(&mut cfg);
    apply_overrides(overrides, &mut cfg)?;

    Ok(cfg)
}

fn load_raw_file(path: &Path) -> anyhow::Result<ConfigFileRaw> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ConfigFileRaw::default());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    serde_yaml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn apply_file(raw: &ConfigFileRaw, cfg: &mut Config) {
    if let Some(v) = raw.skip_permissions {
        cfg.skip_permissions = v;
    }
    if let Some(v) = raw.hang_timeout.as_deref()
        && let Ok(d) = parse_duration(v)
    {
        cfg.hang_timeout = d;
    }
    if let Some(v) = raw.webhook_url.as_deref() {
        cfg.webhook_url = v.to_owned();
    }
    if let Some(v) = raw.notification_desktop {
        cfg.notification_desktop = v;
    }
    if let Some(v) = raw.notification_bell {
        cfg.notification_bell = v;
    }
}

fn apply_env(cfg: &mut Config) {
    if let Some(v) = lookup_env("skip_permissions") {
        cfg.skip_permissions = parse_bool(&v);
    }
    if let Some(v) = lookup_env("hang_timeout")
        && let Ok(d) = parse_duration(&v)
    {
        cfg.hang_timeout = d;
    }
    if let Some(v) = lookup_env("webhook_url") {
        cfg.webhook_url = v;
    }
    if let Some(v) = lookup_env("notification_desktop") {
        cfg.notification_desktop = parse_bool(&v);
    }
    if let Some(v) = lookup_env("notification_bell") {
        cfg.notification_bell = parse_bool(&v);
    }
}

fn apply_overrides(overrides: &BTreeMap<String, String>, cfg: &mut Config) -> anyhow::Result<()> {
    for (key, value) in overrides {
        validate_key(key)?;
        match key.as_str() {
            "skip_permissions" => cfg.skip_permissions = parse_bool(value),
            "hang_timeout" => {
                cfg.hang_timeout = parse_duration(value)
                    .with_context(|| format!("invalid hang_timeout '{value}'"))?;
            }
            "webhook_url" => cfg.webhook_url = value.clone(),
            "notification_desktop" => cfg.notification_desktop = parse_bool(value),
            "notification_bell" => cfg.notification_bell = parse_bool(value),
            _ => {}
        }
    }
    Ok(())
}

fn lookup_env(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{}", key.to_uppercase())).ok()
}

pub fn validate_key(key: &str) -> Result<(), AutopilotError> {
    if KNOWN_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(AutopilotError::UnknownConfigKey(key.to_owned()))
    }
}

/// Writes one key into the config file through the atomic store. The value
/// is validated before anything touches disk.
pub fn set_value(paths: &Paths, key: &str, value: &str) -> anyhow::Result<()> {
    validate_key(key)?;

    let path = paths.config_file();
    let mut raw = load_raw_file(&path)?;

    match key {
        "skip_permissions" => raw.skip_permissions = Some(parse_bool(value)),
        "hang_timeout" => {
            parse_duration(value).with_context(|| format!("invalid hang_timeout '{value}'"))?;
            raw.hang_timeout = Some(value.to_owned());
        }
        "webhook_url" => raw.webhook_url = Some(value.to_owned()),
        "notification_desktop" => raw.notification_desktop = Some(parse_bool(value)),
        "notification_bell" => raw.notification_bell = Some(parse_bool(value)),
        _ => {}
    }

    let data = serde_yaml::to_string(&raw).context("serialize config")?;
    fsutil::atomic_write(&path, data.as_bytes())
}

/// The effective value of one key as a display string (file + env layers).
pub fn get_value(paths: &Paths, key: &str) -> anyhow::Result<String> {
    validate_key(key)?;
    let cfg = load(paths, &BTreeMap::new())?;
    Ok(display_value(&cfg, key))
}

/// All keys with their effective values, in deterministic order.
pub fn list_values(paths: &Paths) -> anyhow::Result<BTreeMap<String, String>> {
    let cfg = load(paths, &BTreeMap::new())?;
    Ok(KNOWN_KEYS
        .iter()
        .map(|k| ((*k).to_owned(), display_value(&cfg, k)))
        .collect())
}

/// Which layer supplied the effective value: `env`, `file`, or `default`.
#[must_use]
pub fn value_source(paths: &Paths, key: &str) -> &'static str {
    if lookup_env(key).is_some() {
        return "env";
    }
    if let Ok(raw) = load_raw_file(&paths.config_file()) {
        let in_file = match key {
            "skip_permissions" => raw.skip_permissions.is_some(),
            "hang_timeout" => raw.hang_timeout.is_some(),
            "webhook_url" => raw.webhook_url.is_some(),
            "notification_desktop" => raw.notification_desktop.is_some(),
            "notification_bell" => raw.notification_bell.is_some(),
            _ => false,
        };
        if in_file {
            return "file";
        }
    }
    "default"
}

fn display_value(cfg: &Config, key: &str) -> String {
    match key {
        "skip_permissions" => cfg.skip_permissions.to_string(),
        "hang_timeout" => format_duration(cfg.hang_timeout),
        "webhook_url" => cfg.webhook_url.clone(),
        "notification_desktop" => cfg.notification_desktop.to_string(),
        "notification_bell" => cfg.notification_bell.to_string(),
        _ => String::new(),
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

/// Parses `<n>(ms|s|m|h|d|w)` durations; a bare number means seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration");
    }

    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map_or((s, ""), |i| s.split_at(i));
    let n: u64 = num
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;

    Ok(match unit.trim() {
        "ms" => Duration::from_millis(n),
        "s" | "" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 60 * 60),
        "d" => Duration::from_secs(n * 24 * 60 * 60),
        "w" => Duration::from_secs(n * 7 * 24 * 60 * 60),
        _ => anyhow::bail!("unsupported duration unit in '{s}' (use ms|s|m|h|d|w)"),
    })
}

/// Renders a duration compactly with the largest exact unit ("10m", "90s").
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_owned();
    }
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    if secs % (24 * 60 * 60) == 0 {
        return format!("{}d", secs / (24 * 60 * 60));
    }
    if secs % (60 * 60) == 0 {
        return format!("{}h", secs / (60 * 60));
    }
    if secs % 60 == 0 {
        return format!("{}m", secs / 60);
    }
    format!("{secs}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(td: &tempfile::TempDir) -> Paths {
        Paths::new(td.path().to_path_buf())
    }

    #[test]
    fn defaults_when_no_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let cfg = load(&paths(&td), &BTreeMap::new()).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.hang_timeout, Duration::from_secs(600));
        assert!(cfg.notification_bell);
    }

    #[test]
    fn set_and_get_round_trip() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = paths(&td);

        set_value(&p, "hang_timeout", "15m").unwrap();
        set_value(&p, "skip_permissions", "true").unwrap();

        assert_eq!(get_value(&p, "hang_timeout").unwrap(), "15m");
        assert_eq!(get_value(&p, "skip_permissions").unwrap(), "true");
        assert_eq!(value_source(&p, "hang_timeout"), "file");
        assert_eq!(value_source(&p, "webhook_url"), "default");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = paths(&td);
        assert!(set_value(&p, "bogus", "1").is_err());
        assert!(get_value(&p, "bogus").is_err());

        let mut overrides = BTreeMap::new();
        overrides.insert("bogus".to_owned(), "1".to_owned());
        assert!(load(&p, &overrides).is_err());
    }

    #[test]
    fn invalid_duration_is_rejected_on_set() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = paths(&td);
        assert!(set_value(&p, "hang_timeout", "soon").is_err());
        // Nothing was written.
        assert!(!p.config_file().exists());
    }

    #[test]
    fn cli_overrides_beat_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let p = paths(&td);
        set_value(&p, "hang_timeout", "15m").unwrap();

        let mut overrides = BTreeMap::new();
        overrides.insert("hang_timeout".to_owned(), "2m".to_owned());
        let cfg = load(&p, &overrides).unwrap();
        assert_eq!(cfg.hang_timeout, Duration::from_secs(120));
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }

    #[test]
    fn paths_layout() {
        let p = Paths::new(PathBuf::from("/base"));
        assert_eq!(p.state_dir(), PathBuf::from("/base/state"));
        assert_eq!(p.lock_file(), PathBuf::from("/base/runner.lock"));
        assert_eq!(p.task_log_file("x"), PathBuf::from("/base/logs/x.log"));
        assert_eq!(p.sweep_dirs(None).len(), 4);
        assert_eq!(p.sweep_dirs(Some(Path::new("/proj"))).len(), 5);
    }
}
