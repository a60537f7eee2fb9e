use std::env;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5672;
const DEFAULT_USERNAME: &str = "guest";
const DEFAULT_PASSWORD: &str = "guest";
const DEFAULT_VHOST: &str = "/";

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub metrics_port: Option<u16>,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unset keys fall back to a
    /// local broker with the default `guest` account.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rabbitmq_url = lookup("RABBITMQ_URL").filter(|url| !url.trim().is_empty());

        let host = lookup("RABBITMQ_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match lookup("RABBITMQ_PORT") {
            Some(raw) => parse_port("RABBITMQ_PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        let username = lookup("RABBITMQ_USERNAME").unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        let password = lookup("RABBITMQ_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.to_string());
        let vhost = lookup("RABBITMQ_VHOST").unwrap_or_else(|| DEFAULT_VHOST.to_string());

        let metrics_port = lookup("METRICS_PORT")
            .map(|raw| parse_port("METRICS_PORT", &raw))
            .transpose()?;

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            rabbitmq_url,
            host,
            port,
            username,
            password,
            vhost,
            metrics_port,
            rust_log,
        })
    }

    pub fn amqp_url(&self) -> String {
        if let Some(url) = &self.rabbitmq_url {
            return url.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    /// URL safe for logs.
    pub fn redacted_url(&self) -> String {
        match &self.rabbitmq_url {
            Some(_) => "<RABBITMQ_URL>".to_string(),
            None => format!("amqp://{}@{}:{}", self.username, self.host, self.port),
        }
    }
}

fn parse_port(key: &'static str, raw: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidPort {
            key,
            value: raw.to_string(),
        })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port in {key}: {value:?}")]
    InvalidPort { key: &'static str, value: String },
}
