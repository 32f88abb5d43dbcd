// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./scraper_test.rs"]
mod scraper_test;

use crate::buffers::BufferPool;
use crate::config::HttpClientConfig;
use crate::target::{Target, TargetError};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use http::StatusCode;
use http::header::{ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use std::io::Read;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const ACCEPT_HEADER: &str = "application/openmetrics-text;version=1.0.0,\
                             application/openmetrics-text;version=0.0.1;q=0.75,\
                             text/plain;version=0.0.4;q=0.5,*/*;q=0.1";
const SCRAPE_TIMEOUT_HEADER: &str = "X-Prometheus-Scrape-Timeout-Seconds";

fn user_agent() -> String {
  format!("pulse-scrape/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(thiserror::Error, Debug)]
pub enum ScrapeError {
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("server returned HTTP status {0}")]
  Status(StatusCode),
  #[error("scrape timed out after {0}")]
  Timeout(Duration),
  #[error("failed to decompress body: {0}")]
  Decompress(#[from] std::io::Error),
  #[error("invalid target: {0}")]
  Target(#[from] TargetError),
}

//
// HttpClient
//

#[derive(Clone, Debug)]
enum Authorization {
  Bearer(String),
  Basic {
    username: String,
    password: Option<String>,
  },
}

/// HTTP client shared by every scraper of a pool, together with the credentials resolved from the
/// job's client configuration.
#[derive(Clone, Debug)]
pub struct HttpClient {
  client: reqwest::Client,
  authorization: Option<Authorization>,
}

impl HttpClient {
  /// Builds the client. Credential and certificate files are read once here, so a reload picks
  /// up rotated files.
  pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
    let mut builder = reqwest::Client::builder();
    let tls = &config.tls_config;
    if let Some(ca_file) = &tls.ca_file {
      builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&std::fs::read(
        ca_file,
      )?)?);
    }
    if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
      let cert = std::fs::read(cert_file)?;
      let key = std::fs::read(key_file)?;
      builder = builder.identity(reqwest::Identity::from_pem(&[cert, key].concat())?);
    }
    let client = builder
      .danger_accept_invalid_certs(tls.insecure_skip_verify)
      .build()?;

    let read_secret = |path| -> anyhow::Result<String> {
      Ok(std::fs::read_to_string(path)?.trim().to_string())
    };
    let authorization = if let Some(token) = &config.bearer_token {
      Some(Authorization::Bearer(token.clone()))
    } else if let Some(token_file) = &config.bearer_token_file {
      Some(Authorization::Bearer(read_secret(token_file)?))
    } else if let Some(basic) = &config.basic_auth {
      let password = match (&basic.password, &basic.password_file) {
        (Some(password), _) => Some(password.clone()),
        (None, Some(password_file)) => Some(read_secret(password_file)?),
        (None, None) => None,
      };
      Some(Authorization::Basic {
        username: basic.username.clone(),
        password,
      })
    } else {
      None
    };

    Ok(Self {
      client,
      authorization,
    })
  }
}

//
// Scraper
//

/// Fetches the exposition payload of a single target.
#[async_trait]
pub trait Scraper: Send + Sync {
  /// Scrapes into `buffer`, replacing its contents, and returns the response content type.
  async fn scrape(&mut self, timeout: Duration, buffer: &mut Vec<u8>)
  -> Result<String, ScrapeError>;

  /// Records the outcome of a scrape on the target.
  fn report(&self, start: OffsetDateTime, duration: Duration, error: Option<String>);

  /// Delay before the first scrape.
  fn offset(&self, interval: Duration, jitter_seed: u64) -> Duration;
}

//
// TargetScraper
//

pub struct TargetScraper {
  target: Arc<Target>,
  client: HttpClient,
  buffers: Arc<BufferPool>,
  // Built on first use and cloned for every scrape after that.
  request: Option<reqwest::Request>,
}

impl TargetScraper {
  #[must_use]
  pub const fn new(target: Arc<Target>, client: HttpClient, buffers: Arc<BufferPool>) -> Self {
    Self {
      target,
      client,
      buffers,
      request: None,
    }
  }

  fn build_request(&self, timeout: Duration) -> Result<reqwest::Request, ScrapeError> {
    let mut request = self
      .client
      .client
      .get(self.target.url()?)
      .header(ACCEPT, ACCEPT_HEADER)
      .header(ACCEPT_ENCODING, "gzip")
      .header(USER_AGENT, user_agent())
      .header(SCRAPE_TIMEOUT_HEADER, timeout.as_seconds_f64().to_string());
    request = match &self.client.authorization {
      Some(Authorization::Bearer(token)) => request.bearer_auth(token),
      Some(Authorization::Basic { username, password }) => {
        request.basic_auth(username, password.as_ref())
      },
      None => request,
    };
    Ok(request.build()?)
  }

  async fn fetch(
    &self,
    request: reqwest::Request,
    buffer: &mut Vec<u8>,
  ) -> Result<String, ScrapeError> {
    let mut response = self.client.client.execute(request).await?;
    if response.status() != StatusCode::OK {
      return Err(ScrapeError::Status(response.status()));
    }

    let header = |name| {
      response
        .headers()
        .get(name)
        .and_then(|value: &http::HeaderValue| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
    };
    let content_type = header(CONTENT_TYPE);
    let gzip = header(CONTENT_ENCODING) == "gzip";

    buffer.clear();
    if gzip {
      let mut compressed = self.buffers.get(buffer.capacity());
      while let Some(chunk) = response.chunk().await? {
        compressed.extend_from_slice(&chunk);
      }
      let result = GzDecoder::new(compressed.as_slice()).read_to_end(buffer);
      self.buffers.put(compressed);
      result?;
    } else {
      while let Some(chunk) = response.chunk().await? {
        buffer.extend_from_slice(&chunk);
      }
    }

    Ok(content_type)
  }
}

#[async_trait]
impl Scraper for TargetScraper {
  async fn scrape(
    &mut self,
    timeout: Duration,
    buffer: &mut Vec<u8>,
  ) -> Result<String, ScrapeError> {
    if self.request.is_none() {
      self.request = Some(self.build_request(timeout)?);
    }
    let request = match self.request.as_ref().and_then(reqwest::Request::try_clone) {
      Some(request) => request,
      None => self.build_request(timeout)?,
    };

    match tokio::time::timeout(timeout.unsigned_abs(), self.fetch(request, buffer)).await {
      Ok(result) => result,
      Err(_) => Err(ScrapeError::Timeout(timeout)),
    }
  }

  fn report(&self, start: OffsetDateTime, duration: Duration, error: Option<String>) {
    self.target.report(start, duration, error);
  }

  fn offset(&self, interval: Duration, jitter_seed: u64) -> Duration {
    self
      .target
      .offset(interval, jitter_seed, OffsetDateTime::now_utc())
  }
}
