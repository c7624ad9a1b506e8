//! Proxy configuration loading and validation.
//!
//! Reads a YAML (or JSON, by extension) file, resolves `${VAR}` /
//! `${VAR:-default}` environment references in the raw text, resolves
//! relative working directories against the config file's directory, and
//! validates the result before any backend is started.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ConfigError;

// ─── Global Options ──────────────────────────────────────────────────────────

/// How alias collisions between backends are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Nobody gets the alias; the qualified name stays the only path.
    #[default]
    Reject,
    /// The earliest backend in catalog order keeps the alias.
    FirstWins,
    /// The latest backend in catalog order keeps the alias.
    LastWins,
}

/// Shape of the compatibility alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasStyle {
    /// `backend.tool`
    #[default]
    Short,
    /// `tool`
    Bare,
    /// `backend_tool`
    Underscore,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliasConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub style: AliasStyle,
    #[serde(default)]
    pub collision: CollisionPolicy,
    /// List tools under their alias only. Qualified names still route.
    #[serde(default)]
    pub only: bool,
}

/// All timeouts, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Router per-call bound, independent of the session's own timeout.
    #[serde(default = "default_30s")]
    pub call_ms: u64,
    /// How long a session waits for a backend's response.
    #[serde(default = "default_30s")]
    pub session_call_ms: u64,
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,
    /// Long enough for servers that import heavy frameworks at startup.
    #[serde(default = "default_30s")]
    pub handshake_ms: u64,
    #[serde(default = "default_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl TimeoutConfig {
    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn session_call(&self) -> Duration {
        Duration::from_millis(self.session_call_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_ms: default_30s(),
            session_call_ms: default_30s(),
            write_ms: default_write_ms(),
            handshake_ms: default_30s(),
            shutdown_grace_ms: default_grace_ms(),
        }
    }
}

/// Reconnect policy for a session.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_30s")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Exponential backoff: `base * 2^attempt`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_30s(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartupConfig {
    /// Fail startup when no backend reaches `Ready`.
    #[serde(default = "default_true")]
    pub require_any_ready: bool,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            require_any_ready: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log to this file instead of stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

fn default_namespace() -> String {
    "proxy".to_string()
}
fn default_30s() -> u64 {
    30_000
}
fn default_write_ms() -> u64 {
    5_000
}
fn default_grace_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}

// ─── Backends ────────────────────────────────────────────────────────────────

/// One configured backend. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: BackendKind,
}

/// Kind-specific connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    Subprocess(SubprocessParams),
    Stream(StreamParams),
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subprocess(_) => "subprocess",
            Self::Stream(_) => "stream",
        }
    }
}

/// A local child process speaking line-delimited JSON-RPC on stdio.
#[derive(Debug, Clone, Deserialize)]
pub struct SubprocessParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Relative paths are resolved against the config file's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A remote server-sent-events endpoint.
#[derive(Clone, Deserialize)]
pub struct StreamParams {
    pub url: String,
    #[serde(default)]
    pub credential: Option<String>,
}

impl StreamParams {
    /// The bearer credential, if one is set and non-empty.
    ///
    /// An unset `${VAR}` interpolates to an empty string, which counts as none.
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref().filter(|c| !c.is_empty())
    }
}

impl fmt::Debug for StreamParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamParams")
            .field("url", &self.url)
            .field("credential", &self.credential().map(|_| "<redacted>"))
            .finish()
    }
}

// ─── ProxyConfig ─────────────────────────────────────────────────────────────

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub aliases: AliasConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Catalog order follows this list.
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

impl ProxyConfig {
    /// Backends that should be started, in configuration order.
    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter().filter(|b| b.enabled)
    }

    /// Check the config before any backend is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() || self.namespace.contains('.') {
            return Err(invalid(format!(
                "namespace '{}' must be non-empty and contain no '.'",
                self.namespace
            )));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() || backend.name.contains('.') {
                return Err(invalid(format!(
                    "backend name '{}' must be non-empty and contain no '.'",
                    backend.name
                )));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackend {
                    name: backend.name.clone(),
                });
            }
            match &backend.kind {
                BackendKind::Subprocess(params) if params.command.trim().is_empty() => {
                    return Err(invalid(format!(
                        "backend '{}': command must not be empty",
                        backend.name
                    )));
                }
                BackendKind::Stream(params) => validate_url(&backend.name, &params.url)?,
                BackendKind::Subprocess(_) => {}
            }
        }

        if self.aliases.only && !self.aliases.enabled {
            return Err(invalid("aliases.only requires aliases.enabled".into()));
        }

        if self.enabled_backends().next().is_none() {
            return Err(invalid("at least one enabled backend is required".into()));
        }

        let t = &self.timeouts;
        let timeouts = [
            ("call_ms", t.call_ms),
            ("session_call_ms", t.session_call_ms),
            ("write_ms", t.write_ms),
            ("handshake_ms", t.handshake_ms),
            ("shutdown_grace_ms", t.shutdown_grace_ms),
            ("retry.base_delay_ms", self.retry.base_delay_ms),
            ("retry.max_delay_ms", self.retry.max_delay_ms),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(invalid(format!("{field} must be greater than zero")));
        }

        Ok(())
    }

    /// Resolve relative working directories against `base_dir`.
    fn resolve_paths(&mut self, base_dir: &Path) {
        for backend in &mut self.backends {
            if let BackendKind::Subprocess(params) = &mut backend.kind {
                if let Some(cwd) = params.cwd.take() {
                    let expanded = PathBuf::from(expand_tilde(&cwd.to_string_lossy()));
                    params.cwd = Some(if expanded.is_relative() {
                        base_dir.join(expanded)
                    } else {
                        expanded
                    });
                }
            }
        }
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid { reason }
}

fn validate_url(backend: &str, url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| invalid(format!("backend '{backend}': invalid url '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!(
            "backend '{backend}': unsupported url scheme '{other}'"
        ))),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load, interpolate, resolve and validate a configuration file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str::<ProxyConfig>(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str::<ProxyConfig>(&interpolated).map_err(|e| e.to_string())
    };
    let mut config = parsed.map_err(|reason| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base_dir);
    config.validate()?;

    tracing::debug!(
        path = %path.display(),
        backends = config.backends.len(),
        "loaded proxy config"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
///
/// An unterminated `${` is left as-is.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
