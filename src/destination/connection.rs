//! Structured connection descriptor with credential redaction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DestinationError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DATABASE: &str = "fitness_center_ods";
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the destination database lives and how to authenticate.
///
/// The password is never part of `Display` or `Debug` output; use
/// [`ConnectionDescriptor::redacted`] wherever the target is shown.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    password: Option<String>,
    pub connect_timeout: Option<Duration>,
    /// Server-side `lock_timeout` for every statement of the session.
    pub lock_timeout: Option<Duration>,
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        ConnectionDescriptor {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            user: DEFAULT_USER.to_string(),
            password: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            lock_timeout: None,
        }
    }
}

impl ConnectionDescriptor {
    pub fn new(host: &str, port: u16, database: &str, user: &str) -> Self {
        ConnectionDescriptor {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            lock_timeout: None,
        }
    }

    /// Parse a `postgres://` URL or a libpq `key=value` string.
    pub fn from_url(url: &str) -> Result<Self, DestinationError> {
        let config = postgres::Config::from_str(url)
            .map_err(|e| DestinationError::InvalidDescriptor(e.to_string()))?;

        let host = match config.get_hosts().first() {
            Some(postgres::config::Host::Tcp(host)) => host.clone(),
            #[cfg(unix)]
            Some(postgres::config::Host::Unix(path)) => path.to_string_lossy().into_owned(),
            None => DEFAULT_HOST.to_string(),
        };

        let password = match config.get_password() {
            Some(bytes) => Some(String::from_utf8(bytes.to_vec()).map_err(|_| {
                DestinationError::InvalidDescriptor("password is not valid UTF-8".to_string())
            })?),
            None => None,
        };

        Ok(ConnectionDescriptor {
            host,
            port: config.get_ports().first().copied().unwrap_or(DEFAULT_PORT),
            database: config.get_dbname().unwrap_or(DEFAULT_DATABASE).to_string(),
            user: config.get_user().unwrap_or(DEFAULT_USER).to_string(),
            password,
            connect_timeout: Some(
                config
                    .get_connect_timeout()
                    .copied()
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            ),
            lock_timeout: None,
        })
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// libpq `key=value` connection string, accepted by diesel and `postgres`.
    pub fn to_conninfo(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo(&self.host)),
            format!("port={}", self.port),
            format!("dbname={}", quote_conninfo(&self.database)),
            format!("user={}", quote_conninfo(&self.user)),
        ];
        if let Some(ref password) = self.password {
            parts.push(format!("password={}", quote_conninfo(password)));
        }
        if let Some(timeout) = self.connect_timeout {
            parts.push(format!("connect_timeout={}", timeout.as_secs().max(1)));
        }
        if let Some(timeout) = self.lock_timeout {
            parts.push(format!(
                "options={}",
                quote_conninfo(&format!("-c lock_timeout={}", timeout.as_millis()))
            ));
        }
        parts.join(" ")
    }

    /// `user:***@host:port/database`; safe to log and persist.
    pub fn redacted(&self) -> String {
        let credentials = if self.password.is_some() {
            format!("{}:***", self.user)
        } else {
            self.user.clone()
        };
        format!(
            "postgresql://{}@{}:{}/{}",
            credentials, self.host, self.port, self.database
        )
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout", &self.connect_timeout)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

fn quote_conninfo(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
