#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Request target as sent; absolute-form when the client talks to a proxy.
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path component of the target, for either origin- or absolute-form.
    pub fn path(&self) -> &str {
        match self.target.split_once("://") {
            Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
            None => &self.target,
        }
    }
}

pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Advertise this length but send only `body`, then hang up.
    pub declared_len: Option<usize>,
}

impl Response {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200).body(body)
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            declared_len: None,
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self::status(status).header("Location", location)
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn truncated(mut self, declared_len: usize) -> Self {
        self.declared_len = Some(declared_len);
        self
    }
}

type Handler = dyn Fn(&Request) -> Response + Send + Sync;

/// One-connection-per-request HTTP/1.1 server on a loopback port. Every
/// request is recorded before the handler runs.
pub struct HttpServer {
    pub base: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl HttpServer {
    pub fn spawn(handler: impl Fn(&Request) -> Response + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);
        let seen = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    continue;
                };
                let handler = Arc::clone(&handler);
                let seen = Arc::clone(&seen);
                thread::spawn(move || serve_http(stream, &*handler, &seen));
            }
        });
        Self {
            base: format!("http://{addr}"),
            requests,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn authority(&self) -> &str {
        self.base.trim_start_matches("http://")
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("lock").clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path() == path)
            .count()
    }
}

fn serve_http(stream: TcpStream, handler: &Handler, seen: &Mutex<Vec<Request>>) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    let mut headers = Vec::new();
    loop {
        let mut h = String::new();
        if reader.read_line(&mut h).unwrap_or(0) == 0 {
            break;
        }
        let h = h.trim_end();
        if h.is_empty() {
            break;
        }
        if let Some((k, v)) = h.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    let req = Request {
        method,
        target,
        headers,
    };
    seen.lock().expect("lock").push(req.clone());

    let res = handler(&req);
    let mut out = stream;
    let len = res.declared_len.unwrap_or(res.body.len());
    let mut head = format!(
        "HTTP/1.1 {} Test\r\nContent-Length: {len}\r\nConnection: close\r\n",
        res.status
    );
    for (k, v) in &res.headers {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str("\r\n");
    let _ = out.write_all(head.as_bytes());
    if req.method != "HEAD" {
        let _ = out.write_all(&res.body);
    }
    let _ = out.flush();
}

/// A file served by [`FtpServer`], keyed by absolute path.
#[derive(Clone)]
pub struct FtpFile {
    pub body: Vec<u8>,
    /// MDTM reply value, `YYYYMMDDHHMMSS`.
    pub mdtm: Option<String>,
}

/// Minimal passive-mode FTP server that understands the commands a binary
/// download needs, and records every command line it receives.
pub struct FtpServer {
    pub base: String,
    files: Arc<Mutex<BTreeMap<String, FtpFile>>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FtpServer {
    pub fn spawn(files: BTreeMap<String, FtpFile>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let files = Arc::new(Mutex::new(files));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (f, c) = (Arc::clone(&files), Arc::clone(&commands));
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    continue;
                };
                let (f, c) = (Arc::clone(&f), Arc::clone(&c));
                thread::spawn(move || {
                    let _ = serve_ftp(stream, &f, &c);
                });
            }
        });
        Self {
            base: format!("ftp://{addr}"),
            files,
            commands,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn set_file(&self, path: &str, file: FtpFile) {
        self.files.lock().expect("lock").insert(path.to_string(), file);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("lock").clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(verb))
            .count()
    }
}

fn reply(out: &mut TcpStream, line: &str) -> std::io::Result<()> {
    out.write_all(format!("{line}\r\n").as_bytes())
}

fn serve_ftp(
    stream: TcpStream,
    files: &Mutex<BTreeMap<String, FtpFile>>,
    commands: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut out = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut cwd = "/".to_string();
    let mut data: Option<TcpListener> = None;
    reply(&mut out, "220 test server ready")?;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end().to_string();
        commands.lock().expect("lock").push(line.clone());
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match verb.to_ascii_uppercase().as_str() {
            "USER" => reply(&mut out, "331 password please")?,
            "PASS" => reply(&mut out, "230 logged in")?,
            "CWD" => {
                cwd = join_path(&cwd, arg);
                reply(&mut out, "250 ok")?;
            }
            "TYPE" => reply(&mut out, "200 type set")?,
            "MDTM" => {
                let file = files.lock().expect("lock").get(&join_path(&cwd, arg)).cloned();
                match file.and_then(|f| f.mdtm) {
                    Some(t) => reply(&mut out, &format!("213 {t}"))?,
                    None => reply(&mut out, "550 not available")?,
                }
            }
            "PASV" => {
                let l = TcpListener::bind("127.0.0.1:0")?;
                let port = l.local_addr()?.port();
                data = Some(l);
                reply(
                    &mut out,
                    &format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        port >> 8,
                        port & 0xff
                    ),
                )?;
            }
            "RETR" => {
                let file = files.lock().expect("lock").get(&join_path(&cwd, arg)).cloned();
                let (Some(file), Some(l)) = (file, data.take()) else {
                    reply(&mut out, "550 no such file")?;
                    continue;
                };
                reply(&mut out, "150 opening data connection")?;
                let (mut conn, _) = l.accept()?;
                conn.write_all(&file.body)?;
                drop(conn);
                reply(&mut out, "226 transfer complete")?;
            }
            "QUIT" => {
                reply(&mut out, "221 bye")?;
                return Ok(());
            }
            _ => reply(&mut out, "502 not implemented")?,
        }
    }
}

fn join_path(cwd: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else if cwd.ends_with('/') {
        format!("{cwd}{name}")
    } else {
        format!("{cwd}/{name}")
    }
}
