//! Bulk archive sources
//!
//! An [`ArchiveSource`] hands out the raw bytes of a named archive file: the
//! manifest or one chunk. [`HttpArchive`] reads from a CDN, and
//! [`DirectoryArchive`] from a local mirror.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout for archive downloads
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Archive transport errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("request for {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where archive files come from
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Raw bytes of `file_name`
    async fn fetch(&self, file_name: &str) -> Result<Bytes, ArchiveError>;

    /// Human readable location, for logs
    fn location(&self) -> String;
}

/// Archive served over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpArchive {
    base_url: String,
    client: Client,
}

impl HttpArchive {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), file_name)
    }
}

#[async_trait]
impl ArchiveSource for HttpArchive {
    async fn fetch(&self, file_name: &str) -> Result<Bytes, ArchiveError> {
        let url = self.url_for(file_name);
        let http_error = |source| ArchiveError::Http {
            url: url.clone(),
            source,
        };

        let response = self
            .client
            .get(&url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(ArchiveError::Status {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }
        response.bytes().await.map_err(http_error)
    }

    fn location(&self) -> String {
        self.base_url.clone()
    }
}

/// Archive mirrored into a local folder
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveSource for DirectoryArchive {
    async fn fetch(&self, file_name: &str) -> Result<Bytes, ArchiveError> {
        let path = self.root.join(file_name);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(source) => Err(ArchiveError::Io { path, source }),
        }
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}
