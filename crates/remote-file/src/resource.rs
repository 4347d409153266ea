use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::attributes::FileAttributes;
use crate::checksum::{Checksum, ChecksumKind};
use crate::error::{Error, Result};

static HEX_DIGEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[0-9a-fA-F]+$").expect("valid hex regex"));

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Ensure {
    Absent,
    #[default]
    Present,
    Latest,
}

impl fmt::Display for Ensure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Present => "present",
            Self::Latest => "latest",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ftp,
    File,
}

impl Scheme {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ftp" => Some(Self::Ftp),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn is_http(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// Proxy endpoint without user-info.
    pub url: Url,
    pub credentials: Option<Credentials>,
}

/// Raw `[[remote_file]]` manifest entry, before validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteFileConfig {
    #[serde(alias = "name")]
    pub path: String,
    pub source: String,
    pub ensure: Ensure,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    #[serde(default = "default_true")]
    pub verify_peer: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub proxy: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
}

impl Default for RemoteFileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            source: String::new(),
            ensure: Ensure::Present,
            checksum: None,
            checksum_type: None,
            verify_peer: true,
            username: None,
            password: None,
            proxy: None,
            proxy_host: None,
            proxy_port: None,
            proxy_username: None,
            proxy_password: None,
            headers: BTreeMap::new(),
            owner: None,
            group: None,
            mode: None,
        }
    }
}

/// Validated, immutable description of one remote file.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub path: PathBuf,
    pub source: Url,
    pub scheme: Scheme,
    pub ensure: Ensure,
    pub checksum: Option<Checksum>,
    pub verify_peer: bool,
    pub auth: Option<Credentials>,
    pub proxy: Option<ProxySettings>,
    pub headers: BTreeMap<String, String>,
    pub attributes: FileAttributes,
}

impl ResourceSpec {
    pub fn id(&self) -> String {
        self.path.display().to_string()
    }
}

impl RemoteFileConfig {
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn ensure(mut self, ensure: Ensure) -> Self {
        self.ensure = ensure;
        self
    }

    pub fn checksum(mut self, kind: &str, value: &str) -> Self {
        self.checksum_type = Some(kind.to_string());
        self.checksum = Some(value.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn proxy(mut self, proxy: &str) -> Self {
        self.proxy = Some(proxy.to_string());
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn validate(&self) -> Result<ResourceSpec> {
        let path = validate_path(&self.path)?;
        let (source, scheme) = validate_source(&self.source)?;
        let checksum = validate_checksum(self.checksum.as_deref(), self.checksum_type.as_deref())?;
        let auth = pair(
            "username",
            self.username.as_deref(),
            "password",
            self.password.as_deref(),
        )?;
        let proxy = self.validate_proxy()?;
        if proxy.is_some() && !scheme.is_http() {
            return Err(Error::config(format!(
                "proxy settings only apply to http/https sources, got {}",
                source.scheme()
            )));
        }
        if auth.is_some() && scheme == Scheme::File {
            return Err(Error::config(
                "username/password do not apply to file sources",
            ));
        }
        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::config(format!("invalid header name '{name}'")))?;
            HeaderValue::from_str(value)
                .map_err(|_| Error::config(format!("invalid value for header '{name}'")))?;
        }
        let attributes = FileAttributes {
            owner: trimmed(self.owner.as_deref()),
            group: trimmed(self.group.as_deref()),
            mode: self
                .mode
                .as_deref()
                .map(FileAttributes::parse_mode)
                .transpose()?,
        };

        Ok(ResourceSpec {
            path,
            source,
            scheme,
            ensure: self.ensure,
            checksum,
            verify_peer: self.verify_peer,
            auth,
            proxy,
            headers: self.headers.clone(),
            attributes,
        })
    }

    fn validate_proxy(&self) -> Result<Option<ProxySettings>> {
        let discrete_creds = pair(
            "proxy_username",
            self.proxy_username.as_deref(),
            "proxy_password",
            self.proxy_password.as_deref(),
        )?;

        let Some(raw) = trimmed(self.proxy.as_deref()) else {
            let host = trimmed(self.proxy_host.as_deref());
            return match (host, self.proxy_port) {
                (Some(host), Some(port)) => {
                    let url = Url::parse(&format!("http://{host}:{port}"))
                        .map_err(|e| Error::config(format!("invalid proxy_host '{host}': {e}")))?;
                    Ok(Some(ProxySettings {
                        url,
                        credentials: discrete_creds,
                    }))
                }
                (None, None) if discrete_creds.is_some() => Err(Error::config(
                    "proxy_username/proxy_password require proxy_host and proxy_port",
                )),
                (None, None) => Ok(None),
                _ => Err(Error::config(
                    "proxy_host and proxy_port must be given together",
                )),
            };
        };

        let mut url =
            Url::parse(&raw).map_err(|e| Error::config(format!("invalid proxy '{raw}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "proxy '{raw}' must use http or https"
            )));
        }
        let Some(host) = url.host_str().map(str::to_string) else {
            return Err(Error::config(format!("proxy '{raw}' has no host")));
        };
        let port = url.port_or_known_default();

        if let Some(want) = trimmed(self.proxy_host.as_deref())
            && !want.eq_ignore_ascii_case(&host)
        {
            return Err(Error::config(format!(
                "proxy_host '{want}' conflicts with proxy '{raw}'"
            )));
        }
        if let Some(want) = self.proxy_port
            && Some(want) != port
        {
            return Err(Error::config(format!(
                "proxy_port {want} conflicts with proxy '{raw}'"
            )));
        }

        let embedded = if url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: url.username().to_string(),
                password: url.password().unwrap_or_default().to_string(),
            })
        };
        let credentials = match (embedded, discrete_creds) {
            (Some(a), Some(b)) if a != b => {
                return Err(Error::config(format!(
                    "proxy_username/proxy_password conflict with credentials in proxy '{raw}'"
                )));
            }
            (a, b) => a.or(b),
        };
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Some(ProxySettings { url, credentials }))
    }
}

pub(crate) fn trimmed(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

fn pair(
    a_name: &str,
    a: Option<&str>,
    b_name: &str,
    b: Option<&str>,
) -> Result<Option<Credentials>> {
    match (a, b) {
        (Some(a), Some(b)) => Ok(Some(Credentials {
            username: a.to_string(),
            password: b.to_string(),
        })),
        (None, None) => Ok(None),
        _ => Err(Error::config(format!(
            "{a_name} and {b_name} must be given together"
        ))),
    }
}

fn validate_path(raw: &str) -> Result<PathBuf> {
    if raw.is_empty() {
        return Err(Error::config("path is required"));
    }
    if raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR) {
        return Err(Error::config(format!(
            "path '{raw}' must not end with a path separator"
        )));
    }
    let p = Path::new(raw);
    if !p.is_absolute() {
        return Err(Error::config(format!("path '{raw}' must be absolute")));
    }
    Ok(p.to_path_buf())
}

fn validate_source(raw: &str) -> Result<(Url, Scheme)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::config("source is required"));
    }
    let url =
        Url::parse(raw).map_err(|e| Error::config(format!("invalid source '{raw}': {e}")))?;
    let Some(scheme) = Scheme::parse(url.scheme()) else {
        return Err(Error::config(format!(
            "source '{raw}' uses unsupported scheme '{}' (expected http, https, ftp or file)",
            url.scheme()
        )));
    };
    match scheme {
        Scheme::File => {
            url.to_file_path()
                .map_err(|_| Error::config(format!("source '{raw}' is not a local file path")))?;
        }
        _ => {
            if url.host_str().is_none_or(str::is_empty) {
                return Err(Error::config(format!("source '{raw}' has no host")));
            }
        }
    }
    if scheme == Scheme::Ftp && url.path().ends_with('/') {
        return Err(Error::config(format!(
            "ftp source '{raw}' must name a file"
        )));
    }
    Ok((url, scheme))
}

fn validate_checksum(value: Option<&str>, kind: Option<&str>) -> Result<Option<Checksum>> {
    let value = trimmed(value);
    let kind = trimmed(kind);
    let (value, kind) = match (value, kind) {
        (None, None) => return Ok(None),
        (None, Some(k)) => {
            return Err(Error::config(format!(
                "checksum_type '{k}' given without a checksum"
            )));
        }
        (Some(v), None) => (v, ChecksumKind::Md5),
        (Some(v), Some(k)) => (v, k.parse::<ChecksumKind>()?),
    };
    if !HEX_DIGEST.is_match(&value) || value.len() != kind.hex_len() {
        return Err(Error::config(format!(
            "checksum '{value}' is not a valid {kind} digest (expected {} hex characters)",
            kind.hex_len()
        )));
    }
    Ok(Some(Checksum::new(kind, value)))
}
