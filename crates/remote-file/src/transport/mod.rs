use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resource::{ResourceSpec, Scheme};

pub mod ftp;
pub mod http;
pub mod local;

pub use ftp::FtpTransport;
pub use http::HttpTransport;
pub use local::LocalTransport;

/// Maximum number of HTTP redirects followed for one request.
pub const MAX_REDIRECTS: usize = 10;

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("remote-file/", env!("CARGO_PKG_VERSION")).to_string()
}

/// `[settings]` manifest table; network knobs shared by all resources.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Whole-request limit; unset means no limit beyond the connect timeout.
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            timeout_secs: None,
            user_agent: default_user_agent(),
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Location the body was finally read from, after redirects.
    pub final_uri: Url,
    /// HTTP status of the final response; `None` for non-HTTP transports.
    pub status: Option<u16>,
    pub redirects: usize,
    pub bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub last_modified: DateTime<Utc>,
}

/// Scheme-specific retrieval strategy.
pub trait Transport: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// Stream the object at `uri` into `sink`.
    fn fetch(&self, uri: &Url, sink: &mut dyn Write) -> Result<FetchResult>;

    /// Query the remote modification time without transferring the body.
    fn head(&self, uri: &Url) -> Result<RemoteMetadata>;

    fn supports_metadata(&self) -> bool {
        true
    }
}

/// Pick the transport for the resource's source scheme.
pub fn for_spec(spec: &ResourceSpec, settings: &TransportSettings) -> Result<Box<dyn Transport>> {
    Ok(match spec.scheme {
        Scheme::Http | Scheme::Https => Box::new(HttpTransport::new(spec, settings)?),
        Scheme::Ftp => Box::new(FtpTransport::new(spec, settings)),
        Scheme::File => Box::new(LocalTransport),
    })
}
