// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::config::BasicAuth;
use crate::labels::Labels;
use crate::target::TargetHealth;
use assert_matches::assert_matches;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::response::Response;
use axum::routing::get;
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use time::ext::NumericalDuration;
use tokio::net::TcpListener;

//
// TestPromServer
//

struct TestPromServer {
  calls: AtomicU64,
  status: StatusCode,
  body: Vec<u8>,
  content_type: &'static str,
  gzip: bool,
  delay: Option<std::time::Duration>,
  last_request: Mutex<Option<(Uri, HeaderMap)>>,
}

impl TestPromServer {
  async fn start(self) -> (u16, Arc<Self>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    log::debug!("starting test server on port {port}");

    let server = Arc::new(self);
    let router = axum::Router::new()
      .route("/metrics", get(metrics))
      .with_state(server.clone());
    tokio::spawn(async move {
      axum::serve(listener, router.into_make_service())
        .await
        .unwrap();
    });

    (port, server)
  }

  fn last_header(&self, name: &str) -> Option<String> {
    self.last_request.lock().as_ref().and_then(|(_, headers)| {
      headers
        .get(name)
        .map(|value| value.to_str().unwrap().to_string())
    })
  }
}

impl Default for TestPromServer {
  fn default() -> Self {
    Self {
      calls: AtomicU64::new(0),
      status: StatusCode::OK,
      body: b"foo 1\n".to_vec(),
      content_type: "text/plain; version=0.0.4",
      gzip: false,
      delay: None,
      last_request: Mutex::new(None),
    }
  }
}

async fn metrics(
  State(server): State<Arc<TestPromServer>>,
  uri: Uri,
  headers: HeaderMap,
) -> Response {
  server.calls.fetch_add(1, Ordering::SeqCst);
  *server.last_request.lock() = Some((uri, headers));
  if let Some(delay) = server.delay {
    tokio::time::sleep(delay).await;
  }

  let body = if server.gzip {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&server.body).unwrap();
    encoder.finish().unwrap()
  } else {
    server.body.clone()
  };
  let mut response = Response::new(Body::from(body));
  *response.status_mut() = server.status;
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static(server.content_type),
  );
  if server.gzip {
    response
      .headers_mut()
      .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
  }
  response
}

fn make_target(port: u16, params: BTreeMap<String, Vec<String>>) -> Arc<Target> {
  Arc::new(Target::new(
    Labels::from_pairs(&[
      ("__address__", format!("127.0.0.1:{port}").as_str()),
      ("__metrics_path__", "/metrics"),
      ("__scheme__", "http"),
    ]),
    Labels::default(),
    params,
  ))
}

fn make_scraper(port: u16, config: &HttpClientConfig) -> TargetScraper {
  TargetScraper::new(
    make_target(port, BTreeMap::new()),
    HttpClient::new(config).unwrap(),
    Arc::new(BufferPool::default()),
  )
}

#[tokio::test]
async fn scrape_plain() {
  let (port, server) = TestPromServer::default().start().await;
  let mut scraper = make_scraper(port, &HttpClientConfig::default());

  let mut buffer = Vec::new();
  let content_type = scraper.scrape(5.seconds(), &mut buffer).await.unwrap();
  assert_eq!("text/plain; version=0.0.4", content_type);
  assert_eq!(b"foo 1\n".as_slice(), buffer.as_slice());

  assert_eq!(
    Some(ACCEPT_HEADER.to_string()),
    server.last_header("accept")
  );
  assert_eq!(
    Some("gzip".to_string()),
    server.last_header("accept-encoding")
  );
  assert_eq!(
    Some("5".to_string()),
    server.last_header("x-prometheus-scrape-timeout-seconds")
  );
  assert!(
    server
      .last_header("user-agent")
      .unwrap()
      .starts_with("pulse-scrape/")
  );
  assert_eq!(None, server.last_header("authorization"));

  // The cached request is reused and the buffer contents are replaced.
  scraper.scrape(5.seconds(), &mut buffer).await.unwrap();
  assert_eq!(b"foo 1\n".as_slice(), buffer.as_slice());
  assert_eq!(2, server.calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn scrape_gzip() {
  let (port, _server) = TestPromServer {
    gzip: true,
    body: b"# TYPE foo counter\nfoo_total 5\n".to_vec(),
    content_type: "application/openmetrics-text; version=1.0.0",
    ..Default::default()
  }
  .start()
  .await;
  let mut scraper = make_scraper(port, &HttpClientConfig::default());

  let mut buffer = Vec::new();
  let content_type = scraper.scrape(5.seconds(), &mut buffer).await.unwrap();
  assert!(content_type.starts_with("application/openmetrics-text"));
  assert_eq!(
    b"# TYPE foo counter\nfoo_total 5\n".as_slice(),
    buffer.as_slice()
  );
}

#[tokio::test]
async fn scrape_bad_status() {
  let (port, _server) = TestPromServer {
    status: StatusCode::INTERNAL_SERVER_ERROR,
    ..Default::default()
  }
  .start()
  .await;
  let mut scraper = make_scraper(port, &HttpClientConfig::default());

  let mut buffer = Vec::new();
  assert_matches!(
    scraper.scrape(5.seconds(), &mut buffer).await,
    Err(ScrapeError::Status(StatusCode::INTERNAL_SERVER_ERROR))
  );
}

#[tokio::test]
async fn scrape_timeout() {
  let (port, _server) = TestPromServer {
    delay: Some(std::time::Duration::from_secs(5)),
    ..Default::default()
  }
  .start()
  .await;
  let mut scraper = make_scraper(port, &HttpClientConfig::default());

  let mut buffer = Vec::new();
  assert_matches!(
    scraper.scrape(100.milliseconds(), &mut buffer).await,
    Err(ScrapeError::Timeout(_))
  );
}

#[tokio::test]
async fn scrape_connection_refused() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  let mut scraper = make_scraper(port, &HttpClientConfig::default());

  let mut buffer = Vec::new();
  assert_matches!(
    scraper.scrape(5.seconds(), &mut buffer).await,
    Err(ScrapeError::Request(_))
  );
}

#[tokio::test]
async fn scrape_auth_and_params() {
  let (port, server) = TestPromServer::default().start().await;

  let mut scraper = make_scraper(
    port,
    &HttpClientConfig {
      bearer_token: Some("secret".into()),
      ..Default::default()
    },
  );
  let mut buffer = Vec::new();
  scraper.scrape(5.seconds(), &mut buffer).await.unwrap();
  assert_eq!(
    Some("Bearer secret".to_string()),
    server.last_header("authorization")
  );

  let mut token_file = tempfile::NamedTempFile::new().unwrap();
  token_file.write_all(b"from-file\n").unwrap();
  let mut scraper = make_scraper(
    port,
    &HttpClientConfig {
      bearer_token_file: Some(token_file.path().to_path_buf()),
      ..Default::default()
    },
  );
  scraper.scrape(5.seconds(), &mut buffer).await.unwrap();
  assert_eq!(
    Some("Bearer from-file".to_string()),
    server.last_header("authorization")
  );

  let mut params = BTreeMap::new();
  params.insert("module".to_string(), vec!["a".to_string()]);
  let mut scraper = TargetScraper::new(
    make_target(port, params),
    HttpClient::new(&HttpClientConfig {
      basic_auth: Some(BasicAuth {
        username: "user".into(),
        password: Some("pass".into()),
        password_file: None,
      }),
      ..Default::default()
    })
    .unwrap(),
    Arc::new(BufferPool::default()),
  );
  scraper.scrape(5.seconds(), &mut buffer).await.unwrap();
  assert_eq!(
    Some("Basic dXNlcjpwYXNz".to_string()),
    server.last_header("authorization")
  );
  let uri = server.last_request.lock().as_ref().unwrap().0.clone();
  assert_eq!(Some("module=a"), uri.query());
}

#[test]
fn client_missing_files() {
  assert!(
    HttpClient::new(&HttpClientConfig {
      bearer_token_file: Some("/does/not/exist".into()),
      ..Default::default()
    })
    .is_err()
  );
}

#[test]
fn report_and_offset() {
  let target = make_target(1234, BTreeMap::new());
  let scraper = TargetScraper::new(
    target.clone(),
    HttpClient::new(&HttpClientConfig::default()).unwrap(),
    Arc::new(BufferPool::default()),
  );

  scraper.report(OffsetDateTime::now_utc(), 1.seconds(), None);
  assert_eq!(TargetHealth::Up, target.health());
  scraper.report(OffsetDateTime::now_utc(), 1.seconds(), Some("boom".into()));
  assert_eq!(TargetHealth::Down, target.health());

  let offset = scraper.offset(10.seconds(), 0);
  assert!(offset > Duration::ZERO && offset <= 10.seconds());
}
