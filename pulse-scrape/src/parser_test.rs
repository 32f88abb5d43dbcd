// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

fn parse_all<'a>(input: &'a str, content_type: &str) -> Result<Vec<Entry<'a>>, ParseError> {
  Parser::new(input.as_bytes(), content_type).collect()
}

#[test]
fn text_format() {
  let input = r#"# HELP http_requests_total The total number of requests.
# TYPE http_requests_total counter
http_requests_total{method="post",code="200"} 1027 1395066363000
http_requests_total{method="post",code="400"}    3 1395066363000

# A normal comment
metric_without_timestamp_and_labels 12.47
something_weird{problem="division by zero"} +Inf -3982045
"#;
  assert_eq!(
    vec![
      Entry::Help {
        name: "http_requests_total",
        help: "The total number of requests.",
      },
      Entry::Type {
        name: "http_requests_total",
        metric_type: MetricType::Counter,
      },
      Entry::Series {
        series: r#"http_requests_total{method="post",code="200"}"#,
        timestamp: Some(1_395_066_363_000),
        value: 1027.0,
      },
      Entry::Series {
        series: r#"http_requests_total{method="post",code="400"}"#,
        timestamp: Some(1_395_066_363_000),
        value: 3.0,
      },
      Entry::Series {
        series: "metric_without_timestamp_and_labels",
        timestamp: None,
        value: 12.47,
      },
      Entry::Series {
        series: r#"something_weird{problem="division by zero"}"#,
        timestamp: Some(-3_982_045),
        value: f64::INFINITY,
      },
    ],
    parse_all(input, "text/plain; version=0.0.4").unwrap()
  );
}

#[test]
fn open_metrics() {
  let input = r#"# TYPE foo_seconds counter
# UNIT foo_seconds seconds
foo_seconds_total{a="1"} 17.0 1520879607.789 # {trace_id="abc"} 1.0
foo_seconds_created 1520430000.123
# EOF
ignored 1
"#;
  assert_eq!(
    vec![
      Entry::Type {
        name: "foo_seconds",
        metric_type: MetricType::Counter,
      },
      Entry::Unit {
        name: "foo_seconds",
        unit: "seconds",
      },
      Entry::Series {
        series: r#"foo_seconds_total{a="1"}"#,
        timestamp: Some(1_520_879_607_789),
        value: 17.0,
      },
      Entry::Series {
        series: "foo_seconds_created",
        timestamp: None,
        value: 1_520_430_000.123,
      },
    ],
    parse_all(input, "application/openmetrics-text; version=1.0.0").unwrap()
  );
}

#[test]
fn unit_ignored_in_text_format() {
  assert_eq!(
    Vec::<Entry<'_>>::new(),
    parse_all("# UNIT foo seconds\n", "text/plain").unwrap()
  );
}

#[test]
fn label_values_with_braces_and_escapes() {
  let entries = parse_all(
    "foo{path=\"/a}b\",msg=\"say \\\"hi\\\"\"} 1\n",
    "text/plain",
  )
  .unwrap();
  let Entry::Series { series, .. } = entries[0] else {
    panic!("expected series");
  };
  assert_eq!("foo{path=\"/a}b\",msg=\"say \\\"hi\\\"\"}", series);
  assert_eq!(
    Labels::from_pairs(&[
      ("__name__", "foo"),
      ("msg", "say \"hi\""),
      ("path", "/a}b"),
    ]),
    parse_series(series).unwrap()
  );
}

#[test]
fn nan_value() {
  let entries = parse_all("foo NaN\n", "").unwrap();
  assert_matches!(entries[0], Entry::Series { value, .. } if value.is_nan());
}

#[test]
fn errors_end_the_stream() {
  let mut parser = Parser::new(b"foo 1\nbar{a=\"1\" 2\nbaz 3\n", "text/plain");
  assert_matches!(parser.next(), Some(Ok(Entry::Series { .. })));
  assert_matches!(parser.next(), Some(Err(ParseError::Invalid { line: 2, .. })));
  assert_matches!(parser.next(), None);
}

#[test]
fn invalid_lines() {
  assert!(parse_all("foo\n", "").is_err());
  assert!(parse_all("foo bar\n", "").is_err());
  assert!(parse_all("foo 1 2 3\n", "").is_err());
  assert!(parse_all("1foo 1\n", "").is_err());
  assert!(parse_all("# TYPE foo bogus\n", "").is_err());
  assert_matches!(
    Parser::new(b"foo{a=\"\xff\"} 1\n", "").next(),
    Some(Err(ParseError::Utf8(1)))
  );
}

#[test]
fn parse_series_variants() {
  assert_eq!(
    Labels::from_pairs(&[("__name__", "up")]),
    parse_series("up").unwrap()
  );
  assert_eq!(
    Labels::from_pairs(&[("__name__", "up"), ("a", "1")]),
    parse_series(r#"up{a="1",b="",}"#).unwrap()
  );
  assert_eq!(
    parse_series("up").unwrap().stable_hash(),
    parse_series(r#"up{b=""}"#).unwrap().stable_hash()
  );
  assert_eq!(
    Labels::from_pairs(&[("__name__", "up")]),
    parse_series("up{}").unwrap()
  );
  assert!(parse_series(r#"up{a="1",a="2"}"#).is_err());
  assert!(parse_series(r#"up{a=1}"#).is_err());
  assert!(parse_series(r#"up{a="1" b="2"}"#).is_err());
}
