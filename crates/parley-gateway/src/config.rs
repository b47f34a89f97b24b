//! Gateway configuration from flags and environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Session-keeping proxy for chat completion APIs.
#[derive(Debug, Clone, Parser)]
#[command(name = "parley-gateway", version, about)]
pub struct GatewayConfig {
    /// Directory holding one JSON file per session.
    #[arg(long, env = "OPENAI_DATA_FOLDER")]
    pub data_dir: PathBuf,

    #[arg(long, env = "OPENAI_PORT")]
    pub port: u16,

    #[arg(long, env = "PARLEY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// System instruction for conversations that do not bring their own.
    #[arg(long, env = "OPENAI_SYSTEM_MSG", default_value = "You are a helpful assistant.")]
    pub system_msg: String,

    /// Model selector used when a request names none.
    #[arg(long, env = "PARLEY_DEFAULT_MODEL", default_value = "GPT4")]
    pub default_model: String,

    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`.
    #[arg(long, env = "OPENAI_API_BASE")]
    pub api_base: Option<String>,

    #[arg(long, env = "PARLEY_REQUEST_TIMEOUT_SECS", default_value_t = 600)]
    pub request_timeout_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "PARLEY_LOG_JSON")]
    pub log_json: bool,
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_fill_the_config() {
        let config = GatewayConfig::try_parse_from([
            "parley-gateway",
            "--data-dir",
            "/tmp/sessions",
            "--port",
            "8089",
            "--default-model",
            "GPT4O",
        ])
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/sessions"));
        assert_eq!(config.default_model, "GPT4O");
        assert_eq!(config.system_msg, "You are a helpful assistant.");
        assert_eq!(config.request_timeout(), Duration::from_secs(600));
        assert!(!config.log_json);
        assert_eq!(config.bind_addr().unwrap(), "127.0.0.1:8089".parse().unwrap());
    }

    #[test]
    fn bad_host_is_reported() {
        let config = GatewayConfig::try_parse_from([
            "parley-gateway",
            "--data-dir",
            "/tmp/sessions",
            "--port",
            "8089",
            "--host",
            "not a host",
        ])
        .unwrap();

        assert!(config.bind_addr().is_err());
    }
}
