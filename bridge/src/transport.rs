//! Loopback HTTP transport, client side.
//!
//! One persistent keep-alive connection per worker. Each call POSTs the
//! encoded request to `/` and reads the encoded response from the body.

use anyhow::{Context, Result as Fallible};
use commons::BridgeError;
use log::{debug, trace};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::time::Duration;

const OCTET_STREAM: &str = "application/octet-stream";

pub(crate) struct HttpTransport {
    endpoint: String,
    client: reqwest::blocking::Client,
    timeout: Option<Duration>,
}

enum PostError {
    Send(reqwest::Error),
    Status(StatusCode),
    Read(reqwest::Error),
}

impl HttpTransport {
    /// Open a transport towards `host:port` with a per-call deadline
    /// (`None` means unbounded).
    pub(crate) fn open(host: &str, port: u16, timeout: Option<Duration>) -> Fallible<Self> {
        Ok(HttpTransport {
            endpoint: format!("http://{}:{}/", host, port),
            client: build_client()?,
            timeout,
        })
    }

    /// Replace the per-call deadline.
    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Send one encoded request frame and read back the encoded
    /// response frame.
    ///
    /// A connection-level failure, where no request bytes reached the
    /// worker, is retried once; anything later is surfaced.
    pub(crate) fn roundtrip(&mut self, frame: &[u8]) -> Result<Vec<u8>, BridgeError> {
        match self.post(frame) {
            Ok(body) => Ok(body),
            Err(PostError::Send(err)) if err.is_connect() => {
                debug!("retrying after connection failure: {}", err);
                self.post(frame).map_err(|err| self.surface(err))
            }
            Err(err) => Err(self.surface(err)),
        }
    }

    fn post(&self, frame: &[u8]) -> Result<Vec<u8>, PostError> {
        trace!("POST {} ({} bytes)", self.endpoint, frame.len());
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(frame.to_vec());
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().map_err(PostError::Send)?;
        match response.status() {
            StatusCode::OK => Ok(response.bytes().map_err(PostError::Read)?.to_vec()),
            status => Err(PostError::Status(status)),
        }
    }

    fn surface(&mut self, err: PostError) -> BridgeError {
        match err {
            PostError::Send(err) if err.is_timeout() => {
                // The worker may still be busy with the request; the
                // connection is suspect from here on, so start a fresh
                // one for the next call.
                self.reset();
                BridgeError::RemoteTimeout {
                    elapsed: self.timeout.unwrap_or_default(),
                }
            }
            PostError::Send(err) => BridgeError::Transport(err.to_string()),
            PostError::Read(err) => BridgeError::Transport(err.to_string()),
            PostError::Status(StatusCode::PAYLOAD_TOO_LARGE) => {
                BridgeError::Protocol("request body exceeds the frame limit".to_string())
            }
            PostError::Status(status) => {
                BridgeError::Transport(format!("unexpected HTTP status {}", status))
            }
        }
    }

    fn reset(&mut self) {
        if let Ok(client) = build_client() {
            self.client = client;
        }
    }
}

fn build_client() -> Fallible<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .context("could not build the HTTP client")
}
