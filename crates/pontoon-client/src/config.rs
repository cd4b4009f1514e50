use std::env;
use std::time::Duration;

use url::Url;

use crate::error::RelayError;
use crate::protocol::{MAX_POLL_INTERVAL, MIN_POLL_INTERVAL};

/// Poll interval used until the relay suggests one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

const ENDPOINT_ENV: &str = "PONTOON_RELAY_URL";
const POLL_ENV: &str = "PONTOON_POLL_MS";

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    endpoint: Url,
    initial_poll_interval: Duration,
}

impl RelayConfig {
    /// Builds a config for the given relay endpoint. Schemeless values
    /// get `http://` prepended, matching how operators write bare
    /// host:port pairs.
    pub fn new(endpoint: impl AsRef<str>) -> Result<Self, RelayError> {
        let mut raw = endpoint.as_ref().trim().to_string();
        if raw.is_empty() {
            return Err(RelayError::Config("relay endpoint cannot be empty".into()));
        }
        if !raw.starts_with("http://") && !raw.starts_with("https://") {
            raw = format!("http://{raw}");
        }
        let endpoint = Url::parse(&raw)
            .map_err(|err| RelayError::Config(format!("invalid relay endpoint: {err}")))?;
        Ok(Self {
            endpoint,
            initial_poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Reads `PONTOON_RELAY_URL` (required) and `PONTOON_POLL_MS`
    /// (optional, milliseconds) from the environment.
    pub fn from_env() -> Result<Self, RelayError> {
        let endpoint = env::var(ENDPOINT_ENV)
            .map_err(|_| RelayError::Config(format!("{ENDPOINT_ENV} is not set")))?;
        let mut config = Self::new(endpoint)?;
        if let Some(millis) = env::var(POLL_ENV).ok().and_then(|raw| raw.parse().ok()) {
            config = config.with_initial_poll_interval(Duration::from_millis(millis));
        }
        Ok(config)
    }

    /// Overrides the poll interval used before the relay suggests one.
    /// Values outside the honored range are pulled back into it.
    pub fn with_initial_poll_interval(mut self, interval: Duration) -> Self {
        self.initial_poll_interval = interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn initial_poll_interval(&self) -> Duration {
        self.initial_poll_interval
    }
}
