use std::fs;
use std::io::{self, Write};

use reqwest::Url;

use crate::error::{Error, Result};
use crate::resource::Scheme;
use crate::transport::{FetchResult, RemoteMetadata, Transport};

/// `file://` sources: a plain byte copy, no metadata.
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn scheme(&self) -> Scheme {
        Scheme::File
    }

    fn fetch(&self, uri: &Url, sink: &mut dyn Write) -> Result<FetchResult> {
        let path = uri
            .to_file_path()
            .map_err(|_| Error::config(format!("source '{uri}' is not a local file path")))?;
        let mut src = fs::File::open(&path)
            .map_err(|e| Error::io(format!("failed to open source {}", path.display()), e))?;
        let bytes = io::copy(&mut src, sink)
            .map_err(|e| Error::io(format!("failed to copy from {}", path.display()), e))?;
        Ok(FetchResult {
            final_uri: uri.clone(),
            status: None,
            redirects: 0,
            bytes,
            last_modified: None,
        })
    }

    fn head(&self, uri: &Url) -> Result<RemoteMetadata> {
        Err(Error::UnsupportedOperation(format!(
            "file sources do not provide remote metadata ({uri})"
        )))
    }

    fn supports_metadata(&self) -> bool {
        false
    }
}
