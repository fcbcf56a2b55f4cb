//! Configuration structs and YAML loader with `${ENV_VAR}` interpolation.
//!
//! Every struct here is constructed once at startup and passed by reference
//! (or cheap clone) through the pipeline; nothing mutates configuration after
//! [`load`] returns.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

/// Azure provider settings. Presence of a non-empty `subscription_id`
/// activates Azure discovery.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub subscription_id: String,
    /// Resource groups to scan; empty means the whole subscription.
    pub resource_groups: Vec<String>,
}

/// AWS provider settings. Presence of a non-empty `region` activates AWS
/// discovery.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    /// Used only for logging and identification.
    pub account_id: String,
    /// Empty means the default credential chain.
    pub credential_profile: String,
}

/// Tag names and allow/deny rules applied to discovered instances.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TagsConfig {
    pub service_name_tag: String,
    pub service_port_tag: String,
    pub instance_port_tag: String,
    pub az_weight_tag: String,
    /// Instances must match every entry (AND).
    pub allowlist: BTreeMap<String, String>,
    /// Instances matching any entry are excluded (OR).
    pub denylist: BTreeMap<String, String>,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            service_name_tag: "HAProxy:Service:Name".to_string(),
            service_port_tag: "HAProxy:Service:Port".to_string(),
            instance_port_tag: "HAProxy:Instance:Port".to_string(),
            az_weight_tag: "HAProxy:Instance:AZperc".to_string(),
            allowlist: BTreeMap::new(),
            denylist: BTreeMap::new(),
        }
    }
}

/// Naming and template settings for created backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Empty means "use the active provider's name" ("azure" or "aws");
    /// resolved during [`load`].
    pub name_prefix: String,
    pub name_separator: String,
    pub balance: String,
    pub mode: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name_prefix: String::new(),
            name_separator: "-".to_string(),
            balance: "roundrobin".to_string(),
            mode: "http".to_string(),
        }
    }
}

/// How server-slot counts grow once the active instance count exceeds the
/// base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthType {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSlotsConfig {
    pub base: u32,
    pub growth_factor: f64,
    pub growth_type: GrowthType,
}

impl Default for ServerSlotsConfig {
    fn default() -> Self {
        Self {
            base: 10,
            growth_factor: 1.5,
            growth_type: GrowthType::Linear,
        }
    }
}

/// HAProxy Dataplane API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HaproxyConfig {
    pub base_url: String,
    pub api_version: String,
    pub username: String,
    pub password: String,
    /// Per-request timeout, seconds.
    pub timeout: u64,
    pub verify_ssl: bool,
    /// The zone HAProxy itself runs in ("1" for Azure, "us-east-1a" for
    /// AWS). Enables cross-zone weighting when set.
    pub availability_zone: Option<String>,
    pub backend: BackendConfig,
    pub server_slots: ServerSlotsConfig,
    /// Service name -> free-form fragment merged into the create-backend
    /// payload for that service.
    pub backend_options: BTreeMap<String, serde_json::Value>,
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5555".to_string(),
            api_version: "v2".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            timeout: 10,
            verify_ssl: true,
            availability_zone: None,
            backend: BackendConfig::default(),
            server_slots: ServerSlotsConfig::default(),
            backend_options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub jitter_seconds: u64,
    pub backoff_base_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            jitter_seconds: 5,
            backoff_base_seconds: 5,
            max_backoff_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub azure: Option<AzureConfig>,
    pub aws: Option<AwsConfig>,
    pub tags: TagsConfig,
    pub haproxy: HaproxyConfig,
    pub polling: PollingConfig,
    pub logging: LoggingConfig,
}

/// The cloud provider a process instance is bound to. Exactly one per
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Azure,
    Aws,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Azure => f.write_str("azure"),
            Provider::Aws => f.write_str("aws"),
        }
    }
}

impl AppConfig {
    /// The active provider, as determined by validation.
    pub fn provider(&self) -> Result<Provider, Error> {
        let has_azure = self
            .azure
            .as_ref()
            .is_some_and(|a| !a.subscription_id.is_empty());
        let has_aws = self.aws.as_ref().is_some_and(|a| !a.region.is_empty());

        match (has_azure, has_aws) {
            (true, true) => Err(Error::Config(
                "both 'azure' and 'aws' sections are configured; only one cloud \
                 provider may be active at a time"
                    .to_string(),
            )),
            (false, false) => Err(Error::Config(
                "no cloud provider configured; add an 'azure' section (with \
                 subscription_id) or an 'aws' section (with region)"
                    .to_string(),
            )),
            (true, false) => Ok(Provider::Azure),
            (false, true) => Ok(Provider::Aws),
        }
    }
}

/// Load, interpolate, and validate configuration from a YAML file.
pub fn load(path: &Path) -> Result<AppConfig, Error> {
    if !path.is_file() {
        return Err(Error::Config(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display())))?;

    if !value.is_mapping() {
        return Err(Error::Config(
            "configuration file must be a YAML mapping".to_string(),
        ));
    }

    let value = interpolate(value)?;
    let mut config: AppConfig = serde_yaml::from_value(value)
        .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;

    let provider = config.provider()?;
    validate(&config)?;

    if config.haproxy.backend.name_prefix.is_empty() {
        config.haproxy.backend.name_prefix = provider.to_string();
    }

    Ok(config)
}

fn validate(config: &AppConfig) -> Result<(), Error> {
    let slots = &config.haproxy.server_slots;
    if slots.base < 10 {
        return Err(Error::Config(
            "haproxy.server_slots.base must be >= 10".to_string(),
        ));
    }
    match slots.growth_type {
        GrowthType::Linear if slots.growth_factor <= 0.0 => {
            return Err(Error::Config(
                "haproxy.server_slots.growth_factor must be > 0 for linear growth".to_string(),
            ));
        }
        GrowthType::Exponential if slots.growth_factor <= 1.0 => {
            return Err(Error::Config(
                "haproxy.server_slots.growth_factor must be > 1 for exponential growth"
                    .to_string(),
            ));
        }
        _ => {}
    }

    if config.polling.interval_seconds < 5 {
        return Err(Error::Config(
            "polling.interval_seconds must be >= 5".to_string(),
        ));
    }

    let mode = config.haproxy.backend.mode.as_str();
    if mode != "http" && mode != "tcp" {
        return Err(Error::Config(
            "haproxy.backend.mode must be 'http' or 'tcp'".to_string(),
        ));
    }

    Ok(())
}

/// Replace `${ENV_VAR}` placeholders in every string value. A placeholder
/// naming an unset variable is a configuration error; text with no closing
/// brace is left untouched.
fn interpolate(value: serde_yaml::Value) -> Result<serde_yaml::Value, Error> {
    use serde_yaml::Value;

    Ok(match value {
        Value::String(s) => Value::String(interpolate_str(&s)?),
        Value::Mapping(mapping) => {
            let mut out = serde_yaml::Mapping::with_capacity(mapping.len());
            for (key, val) in mapping {
                out.insert(key, interpolate(val)?);
            }
            Value::Mapping(out)
        }
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter()
                .map(interpolate)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other => other,
    })
}

fn interpolate_str(raw: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let key = &tail[..end];
        let val = std::env::var(key).map_err(|_| {
            Error::Config(format!("environment variable '{key}' is not set"))
        })?;
        out.push_str(&val);
        rest = &tail[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_defaults_materialize() {
        let file = write_config("aws:\n  region: us-east-1\n");
        let config = load(file.path()).unwrap();

        assert_eq!(config.tags.service_name_tag, "HAProxy:Service:Name");
        assert_eq!(config.tags.az_weight_tag, "HAProxy:Instance:AZperc");
        assert_eq!(config.haproxy.base_url, "http://localhost:5555");
        assert_eq!(config.haproxy.timeout, 10);
        assert!(config.haproxy.verify_ssl);
        assert_eq!(config.haproxy.server_slots.base, 10);
        assert_eq!(config.haproxy.server_slots.growth_type, GrowthType::Linear);
        assert_eq!(config.polling.interval_seconds, 30);
        assert_eq!(config.polling.max_backoff_seconds, 300);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_prefix_defaults_to_provider() {
        let file = write_config("aws:\n  region: us-east-1\n");
        let config = load(file.path()).unwrap();
        assert_eq!(config.haproxy.backend.name_prefix, "aws");

        let file = write_config("azure:\n  subscription_id: sub-1\n");
        let config = load(file.path()).unwrap();
        assert_eq!(config.haproxy.backend.name_prefix, "azure");
    }

    #[test]
    fn test_explicit_prefix_wins() {
        let file = write_config(
            "aws:\n  region: us-east-1\nhaproxy:\n  backend:\n    name_prefix: edge\n",
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.haproxy.backend.name_prefix, "edge");
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("DPAPI_TEST_PASSWORD", "s3cret");
        let file = write_config(
            "aws:\n  region: us-east-1\nhaproxy:\n  password: \"${DPAPI_TEST_PASSWORD}\"\n",
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.haproxy.password, "s3cret");
    }

    #[test]
    fn test_unset_env_var_is_an_error() {
        let file = write_config(
            "aws:\n  region: us-east-1\nhaproxy:\n  password: \"${DPAPI_TEST_UNSET_VAR}\"\n",
        );
        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("DPAPI_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        assert_eq!(interpolate_str("${OOPS").unwrap(), "${OOPS");
        assert_eq!(interpolate_str("plain").unwrap(), "plain");
    }

    #[test]
    fn test_both_providers_rejected() {
        let file = write_config(
            "aws:\n  region: us-east-1\nazure:\n  subscription_id: sub-1\n",
        );
        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("only one cloud provider"));
    }

    #[test]
    fn test_no_provider_rejected() {
        let file = write_config("haproxy:\n  base_url: http://localhost:5555\n");
        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("no cloud provider"));
    }

    #[test]
    fn test_invalid_growth_type_rejected() {
        let file = write_config(
            "aws:\n  region: us-east-1\nhaproxy:\n  server_slots:\n    growth_type: cubic\n",
        );
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn test_exponential_growth_needs_factor_above_one() {
        let file = write_config(
            "aws:\n  region: us-east-1\nhaproxy:\n  server_slots:\n    growth_type: exponential\n    growth_factor: 1.0\n",
        );
        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("growth_factor"));
    }

    #[test]
    fn test_small_slot_base_rejected() {
        let file = write_config(
            "aws:\n  region: us-east-1\nhaproxy:\n  server_slots:\n    base: 4\n",
        );
        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("base"));
    }

    #[test]
    fn test_short_interval_rejected() {
        let file = write_config(
            "aws:\n  region: us-east-1\npolling:\n  interval_seconds: 2\n",
        );
        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains("interval_seconds"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load(Path::new("/nonexistent/discovery.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_backend_options_are_free_form() {
        let file = write_config(
            "aws:\n  region: us-east-1\nhaproxy:\n  backend_options:\n    web:\n      forwardfor:\n        enabled: enabled\n",
        );
        let config = load(file.path()).unwrap();
        let web = config.haproxy.backend_options.get("web").unwrap();
        assert_eq!(web["forwardfor"]["enabled"], "enabled");
    }
}
