use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use reqwest::Url;
use suppaftp::FtpStream;
use suppaftp::types::FileType;

use crate::error::{Error, Result};
use crate::resource::{Credentials, ResourceSpec, Scheme};
use crate::timestamp;
use crate::transport::{FetchResult, RemoteMetadata, Transport, TransportSettings};

const DEFAULT_FTP_PORT: u16 = 21;
const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// Binary RETR plus MDTM over a single FTP control session.
pub struct FtpTransport {
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    /// `username`/`password` from the manifest; they win over URL user-info.
    auth: Option<Credentials>,
}

/// Directory and file name parts of an ftp:// path.
#[derive(Debug, PartialEq, Eq)]
struct RemotePath {
    dir: String,
    file: String,
}

impl RemotePath {
    fn parse(uri: &Url) -> Result<Self> {
        let path = uri.path();
        let (dir, file) = path.rsplit_once('/').unwrap_or(("", path));
        if file.is_empty() {
            return Err(Error::config(format!("ftp source '{uri}' must name a file")));
        }
        Ok(Self {
            dir: if dir.is_empty() { "/".into() } else { dir.into() },
            file: file.into(),
        })
    }
}

impl FtpTransport {
    pub fn new(spec: &ResourceSpec, settings: &TransportSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            read_timeout: settings.timeout(),
            auth: spec.auth.clone(),
        }
    }

    fn resolve(uri: &Url) -> Result<Vec<SocketAddr>> {
        let host = uri
            .host_str()
            .ok_or_else(|| Error::config(format!("ftp source '{uri}' has no host")))?;
        let port = uri.port().unwrap_or(DEFAULT_FTP_PORT);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::transport(uri, format!("failed to resolve {host}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::transport(uri, format!("no address found for {host}")));
        }
        Ok(addrs)
    }

    fn connect(&self, uri: &Url) -> Result<FtpStream> {
        connect_any(uri, &Self::resolve(uri)?, self.connect_timeout)
    }

    fn login_pair<'a>(&'a self, uri: &'a Url) -> (&'a str, &'a str) {
        if let Some(c) = &self.auth {
            (c.username.as_str(), c.password.as_str())
        } else if uri.username().is_empty() {
            (ANONYMOUS_USER, ANONYMOUS_PASSWORD)
        } else {
            (uri.username(), uri.password().unwrap_or_default())
        }
    }

    /// Connect, log in and change into the file's directory.
    fn session(&self, uri: &Url, remote: &RemotePath) -> Result<FtpStream> {
        let mut ftp = self.connect(uri)?;
        if let Some(t) = self.read_timeout {
            ftp.get_ref()
                .set_read_timeout(Some(t))
                .map_err(|e| Error::transport(uri, format!("failed to set read timeout: {e}")))?;
        }

        let (user, password) = self.login_pair(uri);
        ftp.login(user, password)
            .map_err(|e| Error::transport(uri, format!("login as '{user}' failed: {e}")))?;
        ftp.cwd(&remote.dir).map_err(|e| {
            Error::transport(uri, format!("failed to change directory to {}: {e}", remote.dir))
        })?;
        Ok(ftp)
    }
}

/// Try each address in turn; the last failure is reported.
fn connect_any(uri: &Url, addrs: &[SocketAddr], timeout: Duration) -> Result<FtpStream> {
    let mut last_err = None;
    for addr in addrs {
        tracing::debug!(%uri, %addr, "connecting to FTP server");
        match FtpStream::connect_timeout(*addr, timeout) {
            Ok(ftp) => return Ok(ftp),
            Err(e) => {
                tracing::debug!(%uri, %addr, error = %e, "FTP connect failed");
                last_err = Some(format!("connect to {addr} failed: {e}"));
            }
        }
    }
    Err(Error::transport(
        uri,
        last_err.unwrap_or_else(|| "no address to connect to".to_string()),
    ))
}

fn quit(mut ftp: FtpStream, uri: &Url) {
    if let Err(e) = ftp.quit() {
        tracing::debug!(%uri, error = %e, "FTP quit failed");
    }
}

impl Transport for FtpTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Ftp
    }

    fn fetch(&self, uri: &Url, sink: &mut dyn Write) -> Result<FetchResult> {
        let remote = RemotePath::parse(uri)?;
        let mut ftp = self.session(uri, &remote)?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| Error::transport(uri, format!("failed to switch to binary mode: {e}")))?;

        // Captured in the same session so the installer can stamp the file.
        let last_modified = match ftp.mdtm(&remote.file) {
            Ok(t) => Some(timestamp::from_ftp_mdtm(t)),
            Err(e) => {
                tracing::debug!(%uri, error = %e, "MDTM unavailable");
                None
            }
        };

        let mut data = ftp
            .retr_as_stream(&remote.file)
            .map_err(|e| Error::transport(uri, format!("RETR {} failed: {e}", remote.file)))?;
        let bytes = io::copy(&mut data, sink)
            .map_err(|e| Error::transport(uri, format!("failed to read data: {e}")))?;
        ftp.finalize_retr_stream(data)
            .map_err(|e| Error::transport(uri, format!("transfer did not complete: {e}")))?;
        quit(ftp, uri);

        Ok(FetchResult {
            final_uri: uri.clone(),
            status: None,
            redirects: 0,
            bytes,
            last_modified,
        })
    }

    fn head(&self, uri: &Url) -> Result<RemoteMetadata> {
        let remote = RemotePath::parse(uri)?;
        let mut ftp = self.session(uri, &remote)?;
        let res = ftp.mdtm(&remote.file);
        quit(ftp, uri);
        match res {
            Ok(t) => Ok(RemoteMetadata {
                last_modified: timestamp::from_ftp_mdtm(t),
            }),
            Err(e) => {
                tracing::debug!(%uri, error = %e, "MDTM failed");
                Err(Error::MissingLastModified {
                    uri: uri.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    use crate::resource::RemoteFileConfig;

    fn remote(uri: &str) -> Result<RemotePath> {
        RemotePath::parse(&Url::parse(uri).unwrap())
    }

    #[test]
    fn splits_directory_and_file() {
        assert_eq!(
            remote("ftp://h/pub/dist/file.tar").unwrap(),
            RemotePath {
                dir: "/pub/dist".into(),
                file: "file.tar".into()
            }
        );
        assert_eq!(
            remote("ftp://h/file.tar").unwrap(),
            RemotePath {
                dir: "/".into(),
                file: "file.tar".into()
            }
        );
        assert!(remote("ftp://h/pub/").is_err());
    }

    #[test]
    fn manifest_credentials_win_over_url_userinfo() {
        let uri = Url::parse("ftp://url-user:url-pass@h/f").unwrap();
        let plain = RemoteFileConfig::new("/tmp/a", uri.as_str()).validate().expect("valid");
        let t = FtpTransport::new(&plain, &TransportSettings::default());
        assert_eq!(t.login_pair(&uri), ("url-user", "url-pass"));

        let with_auth = RemoteFileConfig::new("/tmp/a", uri.as_str())
            .basic_auth("svc", "pw")
            .validate()
            .expect("valid");
        let t = FtpTransport::new(&with_auth, &TransportSettings::default());
        assert_eq!(t.login_pair(&uri), ("svc", "pw"));

        let anon = Url::parse("ftp://h/f").unwrap();
        let t = FtpTransport::new(&plain, &TransportSettings::default());
        assert_eq!(t.login_pair(&anon), (ANONYMOUS_USER, ANONYMOUS_PASSWORD));
    }

    #[test]
    fn unreachable_address_falls_through_to_next() {
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").expect("bind");
            l.local_addr().expect("addr")
        };
        let live = TcpListener::bind("127.0.0.1:0").expect("bind");
        let live_addr = live.local_addr().expect("addr");
        let greeter = thread::spawn(move || {
            let (mut stream, _) = live.accept().expect("accept");
            stream.write_all(b"220 ready\r\n").expect("greet");
        });

        let uri = Url::parse("ftp://h/f").unwrap();
        let ftp = connect_any(&uri, &[closed, live_addr], Duration::from_secs(5));
        assert!(ftp.is_ok(), "{:?}", ftp.err());
        greeter.join().expect("greeter");

        let err = connect_any(&uri, &[closed], Duration::from_secs(5)).err().expect("error");
        assert!(err.to_string().contains(&closed.to_string()), "{err}");
    }
}
