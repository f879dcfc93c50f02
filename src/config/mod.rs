//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{BackendKind, CacheError, ClientConfig, RawClientConfig};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tagcache";
const ENV_PREFIX: &str = "TAGCACHE";
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Command-line arguments for the tagcache binary.
#[derive(Debug, Parser)]
#[command(name = "tagcache", version, about = "Namespaced memcache client")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TAGCACHE_CONFIG_FILE", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub config_file: Option<PathBuf>,

    /// Cache to operate on; defaults to the only configured cache, else `default`.
    #[arg(long = "cache", value_name = "NAME", global = true)]
    pub cache: Option<String>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        global = true,
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Replace the selected cache's server list (repeatable).
    #[arg(long = "server", value_name = "HOST:PORT", global = true)]
    pub servers: Vec<String>,

    /// Override the selected cache's default namespace.
    #[arg(long = "default-namespace", value_name = "NS", global = true)]
    pub default_namespace: Option<String>,

    /// Override the selected cache's backend (memcache|memory).
    #[arg(long = "backend", value_name = "KIND", global = true, value_parser = parse_backend)]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print per-server statistics.
    Stats,
    /// Look up a key and print its value.
    Get(KeyArgs),
    /// Store a JSON value under a key.
    Set(SetArgs),
    /// Invalidate a key, dependency tags, or both.
    Invalidate(InvalidateArgs),
    /// Flush every server of the selected cache.
    #[command(name = "invalidate-all")]
    InvalidateAll,
    /// Request a reverse-proxy purge.
    Purge(PurgeArgs),
    /// List tracked keys of a namespace.
    Keys(NamespaceArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct NamespaceArgs {
    /// Namespace; the cache's default namespace when omitted.
    #[arg(long = "ns", value_name = "NS")]
    pub ns: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    pub key: String,

    #[command(flatten)]
    pub namespace: NamespaceArgs,

    /// Use the key verbatim instead of deriving a hashed key.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub raw: bool,
}

#[derive(Debug, Args, Clone)]
pub struct SetArgs {
    #[command(flatten)]
    pub target: KeyArgs,

    /// JSON document to store; bare text is stored as a string.
    pub value: String,

    /// Lifetime in seconds; zero never expires.
    #[arg(long, value_name = "SECONDS")]
    pub lifetime: Option<u32>,

    /// Dependency tag (repeatable).
    #[arg(long = "depends-on", value_name = "TAG")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    pub key: Option<String>,

    #[command(flatten)]
    pub namespace: NamespaceArgs,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub raw: bool,

    /// Dependency tag (repeatable).
    #[arg(long = "depends-on", value_name = "TAG")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    /// URL path to purge (repeatable); everything when omitted.
    #[arg(long = "path", value_name = "PATH")]
    pub paths: Vec<String>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub caches: BTreeMap<String, ClientConfig>,
}

impl Settings {
    /// Name of the cache a command should use.
    pub fn select_cache<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        if let Some(name) = requested {
            return name;
        }
        match self.caches.keys().next() {
            Some(only) if self.caches.len() == 1 => only.as_str(),
            _ => DEFAULT_CACHE_NAME,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid configuration for cache `{name}`: {source}")]
    Cache {
        name: String,
        #[source]
        source: CacheError,
    },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(cli.cache.as_deref(), &cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    caches: BTreeMap<String, RawClientConfig>,
}

impl RawSettings {
    fn apply_overrides(&mut self, cache: Option<&str>, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        let touches_cache = !overrides.servers.is_empty()
            || overrides.default_namespace.is_some()
            || overrides.backend.is_some();
        if !touches_cache {
            return;
        }

        let name = match cache {
            Some(name) => name.to_string(),
            None if self.caches.len() == 1 => {
                self.caches.keys().next().cloned().unwrap_or_default()
            }
            None => DEFAULT_CACHE_NAME.to_string(),
        };
        let entry = self.caches.entry(name).or_default();
        if !overrides.servers.is_empty() {
            entry.servers = Some(overrides.servers.clone());
        }
        if let Some(ns) = overrides.default_namespace.as_ref() {
            entry.default_namespace = Some(ns.clone());
        }
        if let Some(backend) = overrides.backend {
            entry.backend = Some(backend);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, caches } = raw;

        let logging = build_logging_settings(logging)?;
        let caches = build_cache_settings(caches)?;

        Ok(Self { logging, caches })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(
    caches: BTreeMap<String, RawClientConfig>,
) -> Result<BTreeMap<String, ClientConfig>, LoadError> {
    if caches.is_empty() {
        return Ok(BTreeMap::from([(
            DEFAULT_CACHE_NAME.to_string(),
            ClientConfig::default(),
        )]));
    }

    caches
        .into_iter()
        .map(|(name, raw)| {
            if name.trim().is_empty() {
                return Err(LoadError::invalid("caches", "cache names must not be empty"));
            }
            match ClientConfig::try_from(raw) {
                Ok(config) => Ok((name, config)),
                Err(source) => Err(LoadError::Cache { name, source }),
            }
        })
        .collect()
}

fn parse_backend(value: &str) -> Result<BackendKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "memcache" => Ok(BackendKind::Memcache),
        "memory" => Ok(BackendKind::Memory),
        other => Err(format!("unknown backend `{other}` (expected memcache or memory)")),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests;
