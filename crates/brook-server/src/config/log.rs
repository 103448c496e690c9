use std::fmt;

use serde::Deserialize;

/// `[log]` section. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

/// Default filter handed to `env_logger`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        log: LogConfig,
    }

    #[test]
    fn test_level_names() {
        let parsed: Wrapper = toml::from_str("[log]\nlevel = \"trace\"\n").unwrap();
        assert_eq!(parsed.log.level, LogLevel::Trace);
        assert_eq!(parsed.log.level.to_string(), "trace");

        let parsed: Wrapper = toml::from_str("[log]\n").unwrap();
        assert_eq!(parsed.log.level, LogLevel::Info);
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert!(toml::from_str::<Wrapper>("[log]\nlevel = \"loud\"\n").is_err());
    }
}
