use crate::traits::PageSource;
use anyhow::{Context, Result};
use log::debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("HTTP error: {0}")]
    Network(String),
}

/// Fetches the device page over HTTP with one bounded attempt per call.
pub struct HttpPageSource {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpPageSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(HttpPageSource {
            client,
            url: url.to_string(),
        })
    }
}

impl PageSource for HttpPageSource {
    fn fetch(&self) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(classify)?;
        let body = resp.text().map_err(classify)?;
        debug!("[Fetch] {} returned {} bytes", self.url, body.len());
        Ok(body)
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else {
        FetchError::Network(e.to_string())
    }
}
