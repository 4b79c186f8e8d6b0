use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::sandbox::{SandboxLimits, DEFAULT_MAX_STACK_SIZE, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT};

pub const ENV_MEMORY_LIMIT: &str = "WEBHOOK_MEMORY_LIMIT";
pub const ENV_MAX_STACK_SIZE: &str = "WEBHOOK_MAX_STACK_SIZE";
pub const ENV_SCRIPT_TIMEOUT_MS: &str = "WEBHOOK_SCRIPT_TIMEOUT_MS";
pub const ENV_BIND_ADDR: &str = "MAILHOOK_BIND_ADDR";
pub const ENV_DATA_DIR: &str = "MAILHOOK_DATA_DIR";
pub const ENV_JSON_LOGS: &str = "MAILHOOK_JSON_LOGS";

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
    pub json_logs: bool,
    /// Sandbox ceilings. The timeout applies to both script stages.
    pub limits: SandboxLimits,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let memory_bytes = parse_or(&lookup, ENV_MEMORY_LIMIT, DEFAULT_MEMORY_LIMIT)?;
        let stack_bytes = parse_or(&lookup, ENV_MAX_STACK_SIZE, DEFAULT_MAX_STACK_SIZE)?;
        let timeout_ms = parse_or(
            &lookup,
            ENV_SCRIPT_TIMEOUT_MS,
            DEFAULT_TIMEOUT.as_millis() as u64,
        )?;
        let addr = parse_or(
            &lookup,
            ENV_BIND_ADDR,
            SocketAddr::from_str(DEFAULT_BIND_ADDR).context("invalid default bind addr")?,
        )?;
        let data_dir = lookup(ENV_DATA_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let json_logs = lookup(ENV_JSON_LOGS)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        if memory_bytes == 0 || stack_bytes == 0 || timeout_ms == 0 {
            anyhow::bail!("sandbox limits must be greater than zero");
        }

        Ok(Self {
            addr,
            data_dir,
            json_logs,
            limits: SandboxLimits {
                memory_bytes,
                stack_bytes,
                timeout: Duration::from_millis(timeout_ms),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}
