//! Logging setup and configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

/// Verbosity of the library and of the USB backend underneath it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    #[default]
    Warning,
    Info,
    Debug,
    /// Debug output including the backend's own tracing
    DebugAll,
}

impl LogLevel {
    /// Tracing filter directive for this level
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::DebugAll => "trace",
        }
    }

    /// Level the USB backend itself should log at
    ///
    /// Only [`LogLevel::DebugAll`] turns on backend debug output.
    pub fn backend_level(&self) -> LogLevel {
        match self {
            LogLevel::None | LogLevel::Error => LogLevel::Error,
            LogLevel::Warning | LogLevel::Info | LogLevel::Debug => LogLevel::Warning,
            LogLevel::DebugAll => LogLevel::Debug,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::None => "none",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::DebugAll => "debugall",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LogLevel::None),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "debugall" | "trace" => Ok(LogLevel::DebugAll),
            other => Err(crate::Error::Config(format!(
                "Invalid log level '{}'. Must be one of: none, error, warning, info, debug, debugall",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::DebugAll);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for level in [
            LogLevel::None,
            LogLevel::Error,
            LogLevel::Warning,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::DebugAll,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_backend_level() {
        assert_eq!(LogLevel::None.backend_level(), LogLevel::Error);
        assert_eq!(LogLevel::Debug.backend_level(), LogLevel::Warning);
        assert_eq!(LogLevel::DebugAll.backend_level(), LogLevel::Debug);
    }

    #[test]
    fn test_directive_is_valid_filter() {
        assert!(EnvFilter::try_new(LogLevel::DebugAll.directive()).is_ok());
        assert!(EnvFilter::try_new(LogLevel::None.directive()).is_ok());
    }
}
