use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::nai::DEFAULT_API_BASE;
use crate::pipeline::DEFAULT_REQUEST_TIMEOUT;
use crate::routes::DEFAULT_JOB_RETENTION;

const DEFAULT_PORT: u16 = 8080;
const MANAGED_DATA_DIR: &str = "/data";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_base: String,
    pub data_dir: PathBuf,
    pub port: u16,
    pub request_timeout: Duration,
    pub job_retention: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = var("NAI_API_KEY").ok_or(ConfigError::Missing("NAI_API_KEY"))?;
        let api_base = var("NAI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let data_dir = match var("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None if var("ZEABUR").is_some() || Path::new(MANAGED_DATA_DIR).exists() => {
                PathBuf::from(MANAGED_DATA_DIR)
            }
            None => PathBuf::from("."),
        };

        let port = match var("PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid { key: "PORT", value: v })?,
            None => DEFAULT_PORT,
        };

        let request_timeout = match var("NAI_TIMEOUT_SECS") {
            Some(v) => match v.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::Invalid { key: "NAI_TIMEOUT_SECS", value: v }),
            },
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        let job_retention = match var("JOB_RETENTION_SECS") {
            Some(v) => v
                .parse()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid { key: "JOB_RETENTION_SECS", value: v })?,
            None => DEFAULT_JOB_RETENTION,
        };

        Ok(Self { api_key, api_base, data_dir, port, request_timeout, job_retention })
    }

    /// `***` plus the last four characters, for logs.
    pub fn masked_api_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 4 {
            return "***".to_string();
        }
        format!("***{}", chars[chars.len() - 4..].iter().collect::<String>())
    }
}
