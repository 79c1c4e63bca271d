use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_INTERVAL: &str = "10m";
pub const DEFAULT_SHUTDOWN_GRACE: &str = "10s";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: &'static str },
    #[error("check under {parent:?} has an empty name")]
    EmptyName { parent: String },
    #[error("duplicate check id {id:?}")]
    DuplicateId { id: String },
    #[error("check {id:?} has invalid address {address:?}, expected host:port")]
    InvalidAddress { id: String, address: String },
    #[error("group {id:?} has no checks")]
    EmptyGroup { id: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorConfig {
    pub checks: Vec<CheckDefinition>,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
    pub webhook_url: Option<String>,
}

fn default_interval() -> String { DEFAULT_INTERVAL.into() }
fn default_listen() -> String { "0.0.0.0:3000".into() }
fn default_shutdown_grace() -> String { DEFAULT_SHUTDOWN_GRACE.into() }

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckDefinition {
    Group {
        name: String,
        #[serde(default)]
        checks: Vec<CheckDefinition>,
    },
    Tls {
        name: String,
        address: String,
        #[serde(default)]
        insecure: bool,
    },
    Smtp {
        name: String,
        address: String,
    },
}

impl CheckDefinition {
    pub fn name(&self) -> &str {
        match self {
            CheckDefinition::Group { name, .. }
            | CheckDefinition::Tls { name, .. }
            | CheckDefinition::Smtp { name, .. } => name,
        }
    }
}

impl MonitorConfig {
    /// Reads the config file, choosing JSON or YAML by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.interval)
    }

    pub fn shutdown_grace(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.shutdown_grace)
    }
}

/// Parses durations like "10m", "90s", "500ms" or "1h30m". A bare integer
/// counts as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason,
    };
    let s = value.trim();
    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return non_zero(Duration::from_secs(secs)).ok_or_else(|| invalid("must be positive"));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid("number too large"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let segment = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        total = total.saturating_add(segment);
        rest = &rest[unit_len..];
    }

    non_zero(total).ok_or_else(|| invalid("must be positive"))
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

/// Checks that `address` is `host:port` with a numeric port.
pub(crate) fn validate_address(id: &str, address: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        id: id.to_string(),
        address: address.to_string(),
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_yaml_tree() {
        let file = write_fixture(
            ".yaml",
            r#"
interval: 1m
checks:
  - name: web
    type: group
    checks:
      - name: frontend
        type: tls
        address: example.com:443
      - name: backend
        type: tls
        address: 10.0.0.2:8443
        insecure: true
  - name: mail
    type: smtp
    address: mail.example.com:25
"#,
        );
        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.interval().unwrap(), Duration::from_secs(60));
        assert_eq!(config.listen, "0.0.0.0:3000");
        assert_eq!(config.shutdown_grace().unwrap(), Duration::from_secs(10));
        assert!(config.webhook_url.is_none());
        assert_eq!(config.checks.len(), 2);

        match &config.checks[0] {
            CheckDefinition::Group { name, checks } => {
                assert_eq!(name, "web");
                assert_eq!(
                    checks[1],
                    CheckDefinition::Tls {
                        name: "backend".into(),
                        address: "10.0.0.2:8443".into(),
                        insecure: true,
                    }
                );
            }
            other => panic!("expected group, got {:?}", other),
        }
    }

    #[test]
    fn loads_json_by_extension() {
        let file = write_fixture(
            ".json",
            r#"{"checks":[{"name":"mail","type":"smtp","address":"mx:25"}],"listen":"127.0.0.1:9000"}"#,
        );
        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.checks[0].name(), "mail");
        assert_eq!(config.interval().unwrap(), Duration::from_secs(600));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let file = write_fixture(
            ".yaml",
            "checks:\n  - name: x\n    type: ftp\n    address: h:21\n",
        );
        let err = MonitorConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = MonitorConfig::load(Path::new("/nonexistent/checks.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        for bad in ["", "abc", "10x", "m5", "0s", "0", "5 m"] {
            assert!(
                matches!(parse_duration(bad), Err(ConfigError::InvalidDuration { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn address_validation() {
        assert!(validate_address("a", "example.com:443").is_ok());
        assert!(validate_address("a", "[::1]:25").is_ok());
        assert!(validate_address("a", "example.com").is_err());
        assert!(validate_address("a", ":443").is_err());
        assert!(validate_address("a", "example.com:https").is_err());
    }
}
