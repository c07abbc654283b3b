//! Source archive transports.
//!
//! A [`Transport`] copies the object behind a URL to a local file. The
//! [`Transports`] table picks one by URL scheme and takes care of writing
//! through a `.part` file, so an interrupted download never leaves a
//! half-written archive at the final path.
//!
//! Verification is not done here: the pipeline digests the finished file
//! against the target's integrity hash.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::Settings;
use crate::layout::append_suffix;

#[derive(Error, Debug)]
pub enum TransportError {
    #[cfg(feature = "network")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object storage error: {0}")]
    ObjectStore(String),

    #[error("Malformed URL '{0}'")]
    InvalidUrl(String),

    #[error("No transport registered for scheme '{scheme}' (url: {url})")]
    UnsupportedScheme { scheme: String, url: String },
}

/// Copies one remote object to a local file.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write the object at `url` to `dest`, replacing any existing file.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransportError>;
}

/// Split `scheme://rest`.
fn split_scheme(url: &str) -> Result<(&str, &str), TransportError> {
    url.split_once("://")
        .filter(|(scheme, _)| !scheme.is_empty())
        .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))
}

/// Transport table keyed by URL scheme.
#[derive(Clone, Default)]
pub struct Transports {
    by_scheme: BTreeMap<String, Arc<dyn Transport>>,
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transports")
            .field("schemes", &self.by_scheme.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Transports {
    /// Empty table; every URL is rejected until a scheme is registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Production table: `file`, plus `http`/`https` and `gs` when the
    /// corresponding features are enabled.
    pub fn system(settings: &Settings) -> Self {
        let mut transports = Self::new().with("file", LocalTransport);

        #[cfg(feature = "network")]
        {
            let http = HttpTransport::new();
            transports = transports.with("http", http.clone()).with("https", http);
        }

        #[cfg(feature = "gcs")]
        {
            transports = transports.with(
                "gs",
                GcsTransport::new(settings.object_store_credential.clone()),
            );
        }
        #[cfg(not(feature = "gcs"))]
        let _ = settings;

        transports
    }

    /// Register `transport` for `scheme`, replacing any previous one.
    pub fn with(mut self, scheme: &str, transport: impl Transport + 'static) -> Self {
        self.by_scheme
            .insert(scheme.to_ascii_lowercase(), Arc::new(transport));
        self
    }

    /// Schemes with a registered transport, sorted.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.by_scheme.keys().map(String::as_str)
    }

    /// Download `url` to `dest`, creating parent directories.
    ///
    /// Data lands in `<dest>.part` first and is renamed on success; the
    /// partial file is removed on failure.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnsupportedScheme`] if no transport handles the URL,
    /// otherwise whatever the transport reports.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        let (scheme, _) = split_scheme(url)?;
        let transport = self
            .by_scheme
            .get(&scheme.to_ascii_lowercase())
            .ok_or_else(|| TransportError::UnsupportedScheme {
                scheme: scheme.to_string(),
                url: url.to_string(),
            })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = append_suffix(dest, ".part");
        debug!(url, dest = %dest.display(), "fetching");

        if let Err(e) = transport.fetch(url, &part).await {
            tokio::fs::remove_file(&part).await.ok();
            return Err(e);
        }
        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }
}

/// `file://` URLs: a plain copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        let (_, path) = split_scheme(url)?;
        if path.is_empty() {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        tokio::fs::copy(path, dest).await?;
        Ok(())
    }
}

/// `http://` and `https://` URLs, streamed to disk.
#[cfg(feature = "network")]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "network")]
impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "network")]
impl HttpTransport {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "network")]
#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url, bytes = downloaded, "download complete");
        Ok(())
    }
}

/// `gs://<bucket>/<object>` URLs, read through OpenDAL.
#[cfg(feature = "gcs")]
#[derive(Clone, Default)]
pub struct GcsTransport {
    credential: Option<String>,
}

#[cfg(feature = "gcs")]
impl fmt::Debug for GcsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsTransport")
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(feature = "gcs")]
impl GcsTransport {
    /// `credential` is a base64-encoded service account JSON. Without it the
    /// ambient Google credentials are used.
    pub fn new(credential: Option<String>) -> Self {
        Self { credential }
    }

    /// Split `gs://bucket/path/to/object` into bucket and object path.
    fn locate(url: &str) -> Result<(&str, &str), TransportError> {
        let (_, rest) = split_scheme(url)?;
        match rest.split_once('/') {
            Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => {
                Ok((bucket, object))
            }
            _ => Err(TransportError::InvalidUrl(url.to_string())),
        }
    }
}

#[cfg(feature = "gcs")]
#[async_trait]
impl Transport for GcsTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransportError> {
        use opendal::{Operator, services::Gcs};

        let (bucket, object) = Self::locate(url)?;

        let mut builder = Gcs::default();
        builder.bucket(bucket);
        if let Some(credential) = &self.credential {
            builder.credential(credential);
        }
        let op = Operator::new(builder)
            .map_err(|e| TransportError::ObjectStore(e.to_string()))?
            .finish();

        let mut reader = op
            .reader(object)
            .await
            .map_err(|e| TransportError::ObjectStore(e.to_string()))?;
        let mut file = tokio::fs::File::create(dest).await?;
        let copied = tokio::io::copy(&mut reader, &mut file).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;

        debug!(url, bytes = copied, "object streamed");
        Ok(())
    }
}
