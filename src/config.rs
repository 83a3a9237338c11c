use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::pipeline::dispatch::{Direction, EngineRegistry, SystemId};
use crate::pipeline::engine::CommandEngine;

/// Application-level constants
pub const APP_NAME: &str = "instrument-bridge";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix shared by every environment variable the service reads.
pub const ENV_PREFIX: &str = "INSTRUMENT_BRIDGE_";

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 20;

const WRITE_PROBE: &str = ".write-probe";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot determine a data directory; set INSTRUMENT_BRIDGE_LOG_DIR")]
    NoDataDir,

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Log directory {} does not exist or is not a directory", .path.display())]
    LogRootMissing { path: PathBuf },

    #[error("Log directory {} is not readable, writable and listable: {source}", .path.display())]
    LogRootAccess {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "instrument_bridge_lib=info,instrument_bridge=info,tower_http=info"
}

/// `<data_local_dir>/instrument-bridge/sessions`
pub fn default_log_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(APP_NAME).join("sessions"))
}

/// Environment key holding the converter command line for one registry slot,
/// e.g. `INSTRUMENT_BRIDGE_ENGINE_REDCAP_TO`.
pub fn engine_key(system: SystemId, direction: Direction) -> String {
    let direction = match direction {
        Direction::ToStandard => "TO",
        Direction::FromStandard => "FROM",
    };
    format!(
        "{ENV_PREFIX}ENGINE_{}_{direction}",
        system.as_str().to_ascii_uppercase()
    )
}

/// Service settings, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log_dir: PathBuf,
    pub bind: SocketAddr,
    pub max_upload_bytes: usize,
    /// Converter commands by registry slot. Unset slots stay empty.
    ///
    /// Each `ENGINE_*` value is split shell style, so a program path or
    /// argument containing spaces must be quoted.
    pub engines: BTreeMap<(SystemId, Direction), CommandEngine>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let log_dir = match get("LOG_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_log_dir().ok_or(ConfigError::NoDataDir)?,
        };

        let bind_raw = get("BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            key: format!("{ENV_PREFIX}BIND"),
            value: bind_raw.clone(),
            reason: e.to_string(),
        })?;

        let max_upload_mb = match get("MAX_UPLOAD_MB") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(mb) if mb > 0 => mb,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: format!("{ENV_PREFIX}MAX_UPLOAD_MB"),
                        value: raw,
                        reason: "expected a positive whole number of megabytes".into(),
                    })
                }
            },
            None => DEFAULT_MAX_UPLOAD_MB,
        };

        let mut engines = BTreeMap::new();
        for system in SystemId::ALL {
            for direction in [Direction::ToStandard, Direction::FromStandard] {
                let key = engine_key(system, direction);
                let Some(line) = lookup(&key) else {
                    continue;
                };
                let parsed = CommandEngine::from_command_line(&line).map_err(|e| ConfigError::Invalid {
                    key: key.clone(),
                    value: line.clone(),
                    reason: e.to_string(),
                })?;
                if let Some(engine) = parsed {
                    engines.insert((system, direction), engine);
                }
            }
        }

        Ok(Self {
            log_dir,
            bind,
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            engines,
        })
    }

    /// Register a subprocess engine for every configured slot.
    pub fn engine_registry(&self) -> EngineRegistry {
        let mut registry = EngineRegistry::new();
        for (&(system, direction), engine) in &self.engines {
            tracing::info!(%system, %direction, program = engine.program(), "Conversion engine registered");
            registry = registry.register(system, direction, engine.clone());
        }
        for system in SystemId::ALL {
            for direction in [Direction::ToStandard, Direction::FromStandard] {
                if !registry.is_registered(system, direction) {
                    tracing::warn!(
                        %system,
                        %direction,
                        key = %engine_key(system, direction),
                        "No conversion engine configured; requests will fail"
                    );
                }
            }
        }
        registry
    }
}

/// Startup check: the log root must exist and allow listing, creating and
/// removing entries.
pub fn check_log_root(path: &Path) -> Result<(), ConfigError> {
    let access = |source| ConfigError::LogRootAccess {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        _ => {
            return Err(ConfigError::LogRootMissing {
                path: path.to_path_buf(),
            })
        }
    }

    std::fs::read_dir(path).map_err(access)?;

    let probe = path.join(format!("{WRITE_PROBE}-{}", std::process::id()));
    std::fs::write(&probe, b"probe").map_err(access)?;
    std::fs::remove_file(&probe).map_err(access)?;

    tracing::debug!(path = %path.display(), "Log root is usable");
    Ok(())
}
