// src/importer/http.rs

//! HTTP-backed source reader
//!
//! Opens the remote endpoint with a blocking client (custom CA material
//! loaded from the trust directory when supplied) and wraps the response
//! body so an owned cancellation flag can abort an in-flight read and
//! release the connection.

use crate::error::{Error, Result};
use crate::format::ReadCloser;
use crate::nbdkit::CERT_FILE;
use reqwest::blocking::{Client, Response};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Connect timeout for opening the endpoint. The body read itself may run
/// for as long as the transfer takes.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(cert_dir: Option<&Path>) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .use_rustls_tls();
    if let Some(cert_dir) = cert_dir {
        let cert_path = cert_dir.join(CERT_FILE);
        let pem = std::fs::read(&cert_path)?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(Error::HttpClient)?;
        builder = builder.add_root_certificate(cert);
        debug!("Loaded custom CA from {}", cert_path.display());
    }
    builder.build().map_err(Error::HttpClient)
}

/// Open the endpoint and return a cancellable body reader plus the content
/// length declared by the server (0 when unreported).
///
/// `access_key`/`secret_key` become basic-auth credentials when both are
/// non-empty.
pub(crate) fn create_http_reader(
    endpoint: &Url,
    access_key: &str,
    secret_key: &str,
    cert_dir: Option<&Path>,
) -> Result<(HttpReader, u64)> {
    let client = build_client(cert_dir)?;
    let mut request = client.get(endpoint.clone());
    if !access_key.is_empty() && !secret_key.is_empty() {
        request = request.basic_auth(access_key, Some(secret_key));
    }
    let response = request.send().map_err(|source| Error::Http {
        url: endpoint.to_string(),
        source,
    })?;
    if !response.status().is_success() {
        return Err(Error::HttpStatus {
            status: response.status().as_u16(),
            url: endpoint.to_string(),
        });
    }
    let content_length = response.content_length().unwrap_or(0);
    debug!("Opened {} ({} bytes declared)", endpoint, content_length);
    let reader = HttpReader {
        response: Some(response),
        cancelled: Arc::new(AtomicBool::new(false)),
    };
    Ok((reader, content_length))
}

/// Response body reader that honors a shared cancellation flag.
pub(crate) struct HttpReader {
    response: Option<Response>,
    cancelled: Arc<AtomicBool>,
}

impl HttpReader {
    /// Flag that aborts subsequent reads once set.
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

impl Read for HttpReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancelled.load(Ordering::SeqCst) {
            // Drop the response so the connection is released.
            self.response.take();
            return Err(std::io::Error::other("read cancelled"));
        }
        match self.response.as_mut() {
            Some(response) => response.read(buf),
            None => Ok(0),
        }
    }
}

impl ReadCloser for HttpReader {
    fn close(&mut self) -> std::io::Result<()> {
        self.response.take();
        Ok(())
    }
}
