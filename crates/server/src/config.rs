use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use courier_core::BrokerConfig;
use serde::Deserialize;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_ENDPOINT: &str = "/api/main";
pub const CONFIG_ENV: &str = "COURIER_CONFIG";
pub const CONFIG_FILE_NAME: &str = "courier.toml";

/// Fully resolved runtime configuration of `courierd`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub cors: CorsConfig,
    pub broker: BrokerConfig,
    pub persistence: Option<PersistenceConfig>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    Tokens,
    Agent,
    #[default]
    Any,
    Off,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tokens" | "bearer" => Ok(AuthMode::Tokens),
            "agent" => Ok(AuthMode::Agent),
            "any" => Ok(AuthMode::Any),
            "off" | "none" => Ok(AuthMode::Off),
            other => Err(anyhow!(
                "Unsupported auth mode '{}'. Expected tokens, agent, any or off.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub tokens: HashSet<String>,
    pub agent: AgentRules,
}

/// Substring lists used to screen game agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRules {
    pub user_agents: Vec<String>,
    pub allowed_referers: Vec<String>,
    pub blocked_headers: Vec<String>,
    pub blocked_agents: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl Default for AgentRules {
    fn default() -> Self {
        Self {
            user_agents: strings(&["RobloxStudio", "RobloxApp"]),
            allowed_referers: strings(&["roblox.com", "localhost"]),
            blocked_headers: strings(&["postman-token", "x-postman-interceptor-id"]),
            blocked_agents: strings(&["curl", "wget", "python"]),
        }
    }
}

/// Empty `allowed_origins` allows any origin.
#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub path: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct CliOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub endpoint: Option<String>,
    pub auth_mode: Option<String>,
    pub tokens: Vec<String>,
    pub tokens_file: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub endpoint: Option<String>,
    pub auth: Option<FileAuthConfig>,
    pub cors: Option<FileCorsConfig>,
    pub broker: Option<BrokerConfig>,
    pub persistence: Option<FilePersistenceConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct FileAuthConfig {
    pub enabled: Option<bool>,
    pub mode: Option<String>,
    pub tokens_file: Option<PathBuf>,
    pub tokens: Vec<String>,
    pub agent: Option<AgentRules>,
}

#[derive(Debug, Clone)]
pub struct FileCorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FilePersistenceConfig {
    pub path: Option<PathBuf>,
    pub debounce_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawRootConfig {
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    cors: Option<RawCorsConfig>,
    broker: Option<BrokerConfig>,
    persistence: Option<RawPersistenceConfig>,
}

#[derive(Deserialize, Default)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
    endpoint: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawAuthConfig {
    enabled: Option<bool>,
    mode: Option<String>,
    tokens_file: Option<String>,
    tokens: Option<Vec<String>>,
    agent: Option<RawAgentRules>,
}

#[derive(Deserialize, Default)]
struct RawAgentRules {
    user_agents: Option<Vec<String>>,
    allowed_referers: Option<Vec<String>>,
    blocked_headers: Option<Vec<String>>,
    blocked_agents: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct RawCorsConfig {
    allowed_origins: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct RawPersistenceConfig {
    path: Option<String>,
    debounce_ms: Option<u64>,
}

/// `--config`, then `$COURIER_CONFIG`, then `./courier.toml` if present.
pub fn locate_config(cli_path: Option<&Path>, working_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(resolve_relative(working_dir, path));
    }

    if let Ok(value) = std::env::var(CONFIG_ENV) {
        if !value.trim().is_empty() {
            return Some(resolve_relative(working_dir, Path::new(value.trim())));
        }
    }

    let candidate = working_dir.join(CONFIG_FILE_NAME);
    candidate.exists().then_some(candidate)
}

pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read courier config from {}", path.display()))?;
    let parsed: RawRootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    Ok(Some(
        parsed.into_runtime_config(path.parent().unwrap_or(Path::new("."))),
    ))
}

/// CLI > file > defaults.
pub fn resolve(
    cli: &CliOptions,
    file_cfg: Option<&FileConfig>,
    working_dir: &Path,
) -> Result<ServerConfig> {
    let host = cli
        .host
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.host.clone()))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = cli
        .port
        .or_else(|| file_cfg.and_then(|cfg| cfg.port))
        .unwrap_or(DEFAULT_PORT);

    let endpoint = normalize_endpoint(
        cli.endpoint
            .clone()
            .or_else(|| file_cfg.and_then(|cfg| cfg.endpoint.clone()))
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT),
    )?;

    let mut broker = file_cfg
        .and_then(|cfg| cfg.broker.clone())
        .unwrap_or_default();
    if let Some(debounce) = file_cfg
        .and_then(|cfg| cfg.persistence.as_ref())
        .and_then(|persistence| persistence.debounce_ms)
    {
        broker.snapshot_debounce_ms = debounce;
    }

    let persistence = cli
        .snapshot_path
        .as_ref()
        .map(|path| resolve_relative(working_dir, path))
        .or_else(|| {
            file_cfg
                .and_then(|cfg| cfg.persistence.as_ref())
                .and_then(|persistence| persistence.path.clone())
        })
        .map(|path| PersistenceConfig { path });

    Ok(ServerConfig {
        http: HttpConfig {
            host,
            port,
            endpoint,
        },
        auth: build_auth_config(cli, file_cfg, working_dir)?,
        cors: build_cors_config(cli, file_cfg),
        broker,
        persistence,
    })
}

fn normalize_endpoint(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Err(anyhow!("Endpoint path must not be empty"));
    }
    if trimmed == "/health" {
        return Err(anyhow!("Endpoint path '/health' is reserved"));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{}", trimmed))
    }
}

fn build_auth_config(
    cli: &CliOptions,
    file_cfg: Option<&FileConfig>,
    working_dir: &Path,
) -> Result<AuthConfig> {
    let mut tokens: HashSet<String> = HashSet::new();
    let mut mode = AuthMode::default();
    let mut agent = AgentRules::default();

    if let Some(cfg) = file_cfg.and_then(|cfg| cfg.auth.as_ref()) {
        if let Some(raw) = cfg.mode.as_deref() {
            mode = raw.parse()?;
        }

        if cfg.enabled == Some(false) {
            mode = AuthMode::Off;
        }

        tokens.extend(cfg.tokens.iter().cloned());

        if let Some(path) = cfg.tokens_file.as_ref() {
            tokens.extend(load_tokens_from_file(path)?);
        }

        if let Some(rules) = cfg.agent.as_ref() {
            agent = rules.clone();
        }
    }

    if let Some(path) = cli.tokens_file.as_ref() {
        let resolved = resolve_relative(working_dir, path);
        tokens.extend(load_tokens_from_file(&resolved)?);
    }

    tokens.extend(cli.tokens.iter().cloned());

    if let Some(raw) = cli.auth_mode.as_deref() {
        mode = raw.parse()?;
    }

    if mode == AuthMode::Tokens && tokens.is_empty() {
        tracing::warn!("Token auth enabled but no tokens configured; every caller is trusted");
    }
    if mode == AuthMode::Off {
        tracing::warn!("Authentication is off");
    }

    Ok(AuthConfig {
        mode,
        tokens,
        agent,
    })
}

fn build_cors_config(cli: &CliOptions, file_cfg: Option<&FileConfig>) -> CorsConfig {
    let mut origins: Vec<String> = Vec::new();

    if let Some(cfg) = file_cfg.and_then(|cfg| cfg.cors.as_ref()) {
        origins.extend(cfg.allowed_origins.iter().cloned());
    }

    origins.extend(cli.cors_origins.iter().cloned());
    origins.sort();
    origins.dedup();

    CorsConfig {
        allowed_origins: origins,
    }
}

fn load_tokens_from_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokens file {}", path.display()))?;
    let parsed: TokenFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse tokens file {}", path.display()))?;
    Ok(parsed.tokens.into_iter().map(|entry| entry.token).collect())
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl RawRootConfig {
    fn into_runtime_config(self, base: &Path) -> FileConfig {
        let server = self.server.unwrap_or_default();
        FileConfig {
            host: server.host,
            port: server.port,
            endpoint: server.endpoint,
            auth: self.auth.map(|raw| raw.into_runtime_config(base)),
            cors: self.cors.map(|raw| raw.into_runtime_config()),
            broker: self.broker,
            persistence: self.persistence.map(|raw| raw.into_runtime_config(base)),
        }
    }
}

impl RawAuthConfig {
    fn into_runtime_config(self, base: &Path) -> FileAuthConfig {
        let tokens_file = self
            .tokens_file
            .map(|value| resolve_relative(base, Path::new(&value)));

        FileAuthConfig {
            enabled: self.enabled,
            mode: self.mode,
            tokens_file,
            tokens: self.tokens.unwrap_or_default(),
            agent: self.agent.map(RawAgentRules::into_runtime_config),
        }
    }
}

impl RawAgentRules {
    /// Lists left out keep their defaults.
    fn into_runtime_config(self) -> AgentRules {
        let defaults = AgentRules::default();
        AgentRules {
            user_agents: self.user_agents.unwrap_or(defaults.user_agents),
            allowed_referers: self.allowed_referers.unwrap_or(defaults.allowed_referers),
            blocked_headers: self
                .blocked_headers
                .map(|headers| {
                    headers
                        .into_iter()
                        .map(|header| header.to_ascii_lowercase())
                        .collect()
                })
                .unwrap_or(defaults.blocked_headers),
            blocked_agents: self.blocked_agents.unwrap_or(defaults.blocked_agents),
        }
    }
}

impl RawCorsConfig {
    fn into_runtime_config(self) -> FileCorsConfig {
        FileCorsConfig {
            allowed_origins: self.allowed_origins.unwrap_or_default(),
        }
    }
}

impl RawPersistenceConfig {
    fn into_runtime_config(self, base: &Path) -> FilePersistenceConfig {
        FilePersistenceConfig {
            path: self
                .path
                .map(|value| resolve_relative(base, Path::new(&value))),
            debounce_ms: self.debounce_ms,
        }
    }
}

#[derive(Deserialize)]
struct TokenFile {
    tokens: Vec<TokenEntry>,
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
}
