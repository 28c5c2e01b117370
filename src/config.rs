//! Config file parsing and validation.
//!
//! One `profile.key=value` per line, `#` starts a comment. Profiles named
//! `fast`, `standard` or `slow` start from the built-in profile of that name
//! and the file only overrides what it mentions. Any other profile name
//! starts from `standard` and must appear in the file.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::client::ClientConfig;
use crate::error::{self, AddContext, ApiError};
use crate::time::Milliseconds;
use crate::{log_debug, log_warn, Result};

pub const CONFIG_PATH: &str = ".config/afetch/api";
pub const TOKEN_ENV_VAR: &str = "AFETCH_API_TOKEN";

lazy_static! {
    static ref CONFIG_LINE: Regex =
        Regex::new(r"^(?P<profile>[\w.-]+)\.(?P<key>\w+)=(?P<value>.*)$").unwrap();
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub profile: String,
    pub client: ClientConfig,
    pub api_token: Option<String>,
    pub token_file: Option<PathBuf>,
}

impl Config {
    pub fn new<T: Read>(reader: T, profile: &str) -> Result<Self> {
        let values = Config::parse(reader, profile)?;
        let builtin = ClientConfig::by_name(profile);
        if values.is_empty() && builtin.is_none() {
            return Err(ApiError::ConfigurationError(format!(
                "No configuration found for profile {profile}"
            ))
            .into());
        }
        let mut config = Config {
            profile: profile.to_string(),
            client: builtin.unwrap_or_default(),
            api_token: None,
            token_file: None,
        };
        for (key, value) in values.iter() {
            config
                .apply(key, value)
                .err_context(format!("Invalid value for {profile}.{key}"))?;
        }
        Ok(config)
    }

    /// Built-in profile without any file.
    pub fn builtin(profile: &str) -> Result<Self> {
        let client = ClientConfig::by_name(profile).ok_or_else(|| {
            ApiError::ConfigurationError(format!(
                "Unknown profile {profile} - built-in profiles are fast, standard, slow"
            ))
        })?;
        Ok(Config {
            profile: profile.to_string(),
            client,
            api_token: None,
            token_file: None,
        })
    }

    /// Read `path`, falling back to the built-in profile when the file does
    /// not exist. The `AFETCH_API_TOKEN` environment variable overrides any
    /// token in the file.
    pub fn read(path: &Path, profile: &str) -> Result<Self> {
        let mut config = if path.exists() {
            let file = File::open(path)
                .err_context(format!("Unable to open config file {}", path.display()))?;
            Config::new(file, profile)?
        } else {
            log_debug!("No config file at {}, using built-in profile", path.display());
            Config::builtin(profile)?
        };
        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            config.api_token = Some(token);
        }
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf> {
        let home_dir = std::env::var("HOME").map_err(|_| {
            ApiError::ConfigurationError("HOME is not set, pass --config".to_string())
        })?;
        Ok(Path::new(&home_dir).join(CONFIG_PATH))
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let client = &mut self.client;
        match key {
            "base_url" => client.base_url = value.to_string(),
            "timeout" => client.timeout = duration(value)?,
            "retries" => client.retries = value.parse()?,
            "retry_delay" => client.retry_delay = duration(value)?,
            "jitter" => client.jitter = duration(value)?,
            "cache_enabled" => client.cache_enabled = value.parse()?,
            "cache_duration" => client.cache_duration = duration(value)?,
            "cache_sweep_interval" => client.cache_sweep_interval = duration(value)?,
            "metrics_retention" => client.metrics_retention = duration(value)?,
            "metrics_sweep_interval" => client.metrics_sweep_interval = duration(value)?,
            "cache_key_headers" => {
                client.cache_key_headers = value
                    .split(',')
                    .map(|header| header.trim().to_lowercase())
                    .filter(|header| !header.is_empty())
                    .collect()
            }
            "login_route" => client.login_route = value.to_string(),
            "api_token" => self.api_token = Some(value.to_string()),
            "token_file" => self.token_file = Some(PathBuf::from(value)),
            _ => log_warn!("Ignoring unknown config key {}.{}", self.profile, key),
        }
        Ok(())
    }

    fn parse<T: Read>(mut reader: T, profile: &str) -> Result<HashMap<String, String>> {
        let mut config_data = String::new();
        reader.read_to_string(&mut config_data)?;
        let mut profile_config = HashMap::new();
        for line in config_data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(captured) = CONFIG_LINE.captures(line) else {
                return Err(error::gen(format!("Malformed config line: {line}")));
            };
            if &captured["profile"] != profile {
                continue;
            }
            profile_config.insert(
                captured["key"].to_string(),
                captured["value"].trim().to_string(),
            );
        }
        Ok(profile_config)
    }
}

fn duration(value: &str) -> Result<Milliseconds> {
    Ok(Milliseconds::try_from(value)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_profile_overrides_builtin_values() {
        let config_data = r#"
        fast.base_url=https://api.airqo.net/api/v2
        fast.retries=4
        slow.retries=9
        "#;
        let config = Config::new(Cursor::new(config_data), "fast").unwrap();
        assert_eq!("https://api.airqo.net/api/v2", config.client.base_url);
        assert_eq!(4, config.client.retries);
        // untouched values keep the fast profile
        assert_eq!(Milliseconds::new(10_000), config.client.timeout);
    }

    #[test]
    fn test_ignore_commented_out_lines_and_empty_lines() {
        let config_data = r#"

        # staging
        standard.timeout=5s
        "#;
        let config = Config::new(Cursor::new(config_data), "standard").unwrap();
        assert_eq!(Milliseconds::new(5_000), config.client.timeout);
    }

    #[test]
    fn test_durations_accept_units() {
        let config_data = r#"
        netmanager.retry_delay=250ms
        netmanager.cache_duration=2m
        netmanager.metrics_retention=1h
        netmanager.jitter=100
        "#;
        let config = Config::new(Cursor::new(config_data), "netmanager").unwrap();
        assert_eq!(Milliseconds::new(250), config.client.retry_delay);
        assert_eq!(Milliseconds::new(120_000), config.client.cache_duration);
        assert_eq!(Milliseconds::new(3_600_000), config.client.metrics_retention);
        assert_eq!(Milliseconds::new(100), config.client.jitter);
    }

    #[test]
    fn test_custom_profile_starts_from_standard() {
        let config_data = "analytics.cache_enabled=false";
        let config = Config::new(Cursor::new(config_data), "analytics").unwrap();
        assert!(!config.client.cache_enabled);
        assert_eq!(ClientConfig::standard().retries, config.client.retries);
    }

    #[test]
    fn test_unknown_profile_without_data_is_err() {
        let config_data = "fast.retries=1";
        assert!(Config::new(Cursor::new(config_data), "analytics").is_err());
    }

    #[test]
    fn test_builtin_profile_without_data_is_ok() {
        let config = Config::new(Cursor::new(""), "slow").unwrap();
        assert_eq!(ClientConfig::slow(), config.client);
    }

    #[test]
    fn test_invalid_value_is_err() {
        let config_data = "standard.retries=many";
        let err = Config::new(Cursor::new(config_data), "standard").unwrap_err();
        assert!(format!("{err:#}").contains("standard.retries"));
        let config_data = "standard.timeout=soon";
        assert!(Config::new(Cursor::new(config_data), "standard").is_err());
    }

    #[test]
    fn test_config_multiple_equals_keeps_value() {
        let config_data = "standard.api_token=abc==";
        let config = Config::new(Cursor::new(config_data), "standard").unwrap();
        assert_eq!(Some("abc==".to_string()), config.api_token);
    }

    #[test]
    fn test_malformed_line_is_err() {
        let config_data = "standard_retries 3";
        assert!(Config::new(Cursor::new(config_data), "standard").is_err());
    }

    #[test]
    fn test_cache_key_headers_and_token_file() {
        let config_data = r#"
        standard.cache_key_headers=Authorization, X-Tenant
        standard.token_file=/tmp/afetch/tokens.json
        standard.login_route=/account/login
        "#;
        let config = Config::new(Cursor::new(config_data), "standard").unwrap();
        assert_eq!(
            vec!["authorization".to_string(), "x-tenant".to_string()],
            config.client.cache_key_headers
        );
        assert_eq!(
            Some(PathBuf::from("/tmp/afetch/tokens.json")),
            config.token_file
        );
        assert_eq!("/account/login", config.client.login_route);
    }

    #[test]
    fn test_builtin_unknown_profile_is_err() {
        assert!(Config::builtin("turbo").is_err());
        assert_eq!(ClientConfig::fast(), Config::builtin("fast").unwrap().client);
    }
}
