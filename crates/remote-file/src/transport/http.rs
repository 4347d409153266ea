use std::io::{self, Read, Write};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};

use crate::error::{Error, Result};
use crate::log_sanitize::{MAX_SNIPPET_CHARS, body_snippet};
use crate::resource::{Credentials, ResourceSpec, Scheme};
use crate::timestamp;
use crate::transport::{FetchResult, MAX_REDIRECTS, RemoteMetadata, Transport, TransportSettings};

/// GET/HEAD over HTTP(S). Redirects are followed here rather than by the
/// client so that every hop carries the same auth, headers and proxy.
pub struct HttpTransport {
    client: Client,
    scheme: Scheme,
    headers: HeaderMap,
    auth: Option<Credentials>,
    max_redirects: usize,
}

impl HttpTransport {
    pub fn new(spec: &ResourceSpec, settings: &TransportSettings) -> Result<Self> {
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.clone());

        match &spec.proxy {
            Some(p) => {
                let mut proxy = reqwest::Proxy::all(p.url.clone()).map_err(|e| {
                    Error::config(format!("invalid proxy {}: {e}", p.url))
                })?;
                if let Some(c) = &p.credentials {
                    proxy = proxy.basic_auth(&c.username, &c.password);
                }
                tracing::debug!(proxy = %p.url, "using HTTP proxy");
                builder = builder.proxy(proxy);
            }
            // Only explicitly configured proxies are used.
            None => builder = builder.no_proxy(),
        }

        if spec.scheme == Scheme::Https && !spec.verify_peer {
            tracing::warn!(
                path = %spec.path.display(),
                source = %spec.source,
                "TLS peer verification disabled for this source"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| Error::transport(&spec.source, format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            scheme: spec.scheme,
            headers: header_map(spec)?,
            auth: spec.auth.clone(),
            max_redirects: MAX_REDIRECTS,
        })
    }

    fn request(&self, method: Method, uri: &Url) -> RequestBuilder {
        let mut req = self.client.request(method, uri.clone());
        if let Some(c) = &self.auth {
            req = req.basic_auth(&c.username, Some(&c.password));
        }
        // Caller headers go last so they win over anything set above.
        req.headers(self.headers.clone())
    }

    /// Send `method` to `start`, following redirects. Returns the first
    /// non-redirect response with the URI it came from and the hop count.
    fn send_following(&self, method: Method, start: &Url) -> Result<(Response, Url, usize)> {
        let mut current = start.clone();
        let mut remaining = self.max_redirects;
        let mut hops = 0usize;

        loop {
            tracing::debug!(%method, uri = %current, hops, "HTTP request");
            let res = self
                .request(method.clone(), &current)
                .send()
                .map_err(|e| Error::transport(&current, e))?;

            if !is_followed_redirect(res.status()) {
                return Ok((res, current, hops));
            }
            if remaining == 0 {
                return Err(Error::RedirectLimitExceeded {
                    uri: start.to_string(),
                    limit: self.max_redirects,
                });
            }

            let Some(location) = res
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Err(Error::UnexpectedResponseStatus {
                    uri: current.to_string(),
                    code: res.status().as_u16(),
                    snippet: "redirect without a Location header".into(),
                });
            };
            let next = current.join(location).map_err(|e| {
                Error::transport(&current, format!("invalid redirect location '{location}': {e}"))
            })?;
            tracing::debug!(from = %current, to = %next, "following redirect");
            current = next;
            remaining -= 1;
            hops += 1;
        }
    }
}

impl Transport for HttpTransport {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn fetch(&self, uri: &Url, sink: &mut dyn Write) -> Result<FetchResult> {
        let (mut res, final_uri, redirects) = self.send_following(Method::GET, uri)?;
        let status = res.status();
        if !status.is_success() {
            return Err(unexpected_status(res, &final_uri));
        }

        let last_modified = last_modified(&res, &final_uri);
        let bytes = io::copy(&mut res, sink)
            .map_err(|e| Error::transport(&final_uri, format!("failed to read body: {e}")))?;

        Ok(FetchResult {
            final_uri,
            status: Some(status.as_u16()),
            redirects,
            bytes,
            last_modified,
        })
    }

    fn head(&self, uri: &Url) -> Result<RemoteMetadata> {
        let (res, final_uri, _) = self.send_following(Method::HEAD, uri)?;
        if !res.status().is_success() {
            return Err(unexpected_status(res, &final_uri));
        }
        last_modified(&res, &final_uri)
            .map(|last_modified| RemoteMetadata { last_modified })
            .ok_or_else(|| Error::MissingLastModified {
                uri: final_uri.to_string(),
            })
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn last_modified(res: &Response, uri: &Url) -> Option<chrono::DateTime<chrono::Utc>> {
    let raw = res.headers().get(header::LAST_MODIFIED)?.to_str().ok()?;
    let parsed = timestamp::parse_http_date(raw);
    if parsed.is_none() {
        tracing::warn!(%uri, value = raw, "ignoring unparseable Last-Modified header");
    }
    parsed
}

fn unexpected_status(res: Response, uri: &Url) -> Error {
    let code = res.status().as_u16();
    let mut buf = Vec::new();
    // Only enough of the body for a diagnostic; errors here are not interesting.
    let _ = res
        .take((MAX_SNIPPET_CHARS * 4) as u64)
        .read_to_end(&mut buf);
    Error::UnexpectedResponseStatus {
        uri: uri.to_string(),
        code,
        snippet: body_snippet(&buf),
    }
}

fn header_map(spec: &ResourceSpec) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in &spec.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::config(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::config(format!("invalid value for header '{name}'")))?;
        map.insert(name, value);
    }
    Ok(map)
}
