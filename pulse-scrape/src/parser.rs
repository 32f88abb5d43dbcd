// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./parser_test.rs"]
mod parser_test;

use crate::labels::{Label, Labels, METRIC_NAME_LABEL};
use memchr::memchr;
use std::str::FromStr;

pub const OPEN_METRICS_CONTENT_TYPE: &str = "application/openmetrics-text";

//
// MetricType
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MetricType {
  Counter,
  Gauge,
  Histogram,
  GaugeHistogram,
  Summary,
  Info,
  StateSet,
  #[default]
  Unknown,
}

impl FromStr for MetricType {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "counter" => Self::Counter,
      "gauge" => Self::Gauge,
      "histogram" => Self::Histogram,
      "gaugehistogram" => Self::GaugeHistogram,
      "summary" => Self::Summary,
      "info" => Self::Info,
      "stateset" => Self::StateSet,
      "untyped" | "unknown" => Self::Unknown,
      _ => return Err(()),
    })
  }
}

//
// Entry
//

/// A single parsed exposition entry. Strings borrow from the scrape buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry<'a> {
  Type {
    name: &'a str,
    metric_type: MetricType,
  },
  Help {
    name: &'a str,
    help: &'a str,
  },
  Unit {
    name: &'a str,
    unit: &'a str,
  },
  /// `series` is the raw `name{labels}` text, used as the cache key. `timestamp` is in
  /// milliseconds.
  Series {
    series: &'a str,
    timestamp: Option<i64>,
    value: f64,
  },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  #[error("line {line}: {reason}")]
  Invalid { line: usize, reason: &'static str },
  #[error("line {0}: invalid utf-8")]
  Utf8(usize),
  #[error("invalid series {0:?}: {1}")]
  Series(String, &'static str),
}

//
// Parser
//

/// Streaming parser over a Prometheus text format or OpenMetrics payload. Entries are produced
/// lazily line by line and the first error ends the stream.
pub struct Parser<'a> {
  input: &'a [u8],
  pos: usize,
  line: usize,
  open_metrics: bool,
  done: bool,
}

impl<'a> Parser<'a> {
  #[must_use]
  pub fn new(input: &'a [u8], content_type: &str) -> Self {
    Self {
      input,
      pos: 0,
      line: 0,
      open_metrics: content_type.starts_with(OPEN_METRICS_CONTENT_TYPE),
      done: false,
    }
  }

  #[must_use]
  pub const fn is_open_metrics(&self) -> bool {
    self.open_metrics
  }

  fn invalid(&self, reason: &'static str) -> ParseError {
    ParseError::Invalid {
      line: self.line,
      reason,
    }
  }

  fn next_line(&mut self) -> Option<&'a [u8]> {
    if self.pos >= self.input.len() {
      return None;
    }
    let rest = &self.input[self.pos ..];
    let (line, advance) = match memchr(b'\n', rest) {
      Some(end) => (&rest[.. end], end + 1),
      None => (rest, rest.len()),
    };
    self.pos += advance;
    self.line += 1;
    Some(line.strip_suffix(b"\r").unwrap_or(line))
  }

  fn parse_comment(&self, line: &'a str) -> Result<Option<Entry<'a>>, ParseError> {
    let body = line[1 ..].trim_start_matches(' ');
    let (keyword, rest) = body.split_once(' ').unwrap_or((body, ""));
    if !matches!(keyword, "HELP" | "TYPE" | "UNIT") {
      return Ok(None);
    }
    if keyword == "UNIT" && !self.open_metrics {
      return Ok(None);
    }

    let rest = rest.trim_start_matches(' ');
    let (name, text) = rest.split_once(' ').unwrap_or((rest, ""));
    if name.is_empty() {
      return Err(self.invalid("missing metric name in metadata line"));
    }

    Ok(Some(match keyword {
      "HELP" => Entry::Help { name, help: text },
      "UNIT" => Entry::Unit {
        name,
        unit: text.trim(),
      },
      _ => Entry::Type {
        name,
        metric_type: text
          .trim()
          .parse()
          .map_err(|()| self.invalid("unknown metric type"))?,
      },
    }))
  }

  fn parse_sample(&self, line: &'a str) -> Result<Entry<'a>, ParseError> {
    let series_end = series_end(line).map_err(|reason| self.invalid(reason))?;
    let series = &line[.. series_end];

    let mut fields = line[series_end ..].split_ascii_whitespace();
    let value = fields
      .next()
      .ok_or_else(|| self.invalid("missing value"))
      .and_then(|value| parse_value(value).ok_or_else(|| self.invalid("invalid value")))?;

    let mut timestamp = None;
    match fields.next() {
      None => {},
      // OpenMetrics exemplars follow a '#'.
      Some("#") if self.open_metrics => {},
      Some(field) => {
        timestamp = Some(
          self
            .parse_timestamp(field)
            .ok_or_else(|| self.invalid("invalid timestamp"))?,
        );
        match fields.next() {
          None => {},
          Some("#") if self.open_metrics => {},
          Some(_) => return Err(self.invalid("unexpected trailing data")),
        }
      },
    }

    Ok(Entry::Series {
      series,
      timestamp,
      value,
    })
  }

  #[allow(clippy::cast_possible_truncation)]
  fn parse_timestamp(&self, timestamp: &str) -> Option<i64> {
    if self.open_metrics {
      // OpenMetrics timestamps are float seconds.
      let seconds: f64 = timestamp.parse().ok()?;
      seconds
        .is_finite()
        .then(|| (seconds * 1000.0).round() as i64)
    } else {
      timestamp.parse().ok()
    }
  }
}

impl<'a> Iterator for Parser<'a> {
  type Item = Result<Entry<'a>, ParseError>;

  fn next(&mut self) -> Option<Self::Item> {
    while !self.done {
      let line = self.next_line()?;
      let Ok(line) = std::str::from_utf8(line) else {
        self.done = true;
        return Some(Err(ParseError::Utf8(self.line)));
      };

      if line.trim().is_empty() {
        continue;
      }

      let result = if line.starts_with('#') {
        if self.open_metrics && line == "# EOF" {
          self.done = true;
          return None;
        }
        match self.parse_comment(line) {
          Ok(None) => continue,
          Ok(Some(entry)) => Ok(entry),
          Err(e) => Err(e),
        }
      } else {
        self.parse_sample(line)
      };

      if result.is_err() {
        self.done = true;
      }
      return Some(result);
    }

    None
  }
}

fn parse_value(value: &str) -> Option<f64> {
  match value {
    "+Inf" | "Inf" => Some(f64::INFINITY),
    "-Inf" => Some(f64::NEG_INFINITY),
    "NaN" => Some(f64::NAN),
    _ => value.parse().ok(),
  }
}

fn is_name_start(c: u8) -> bool {
  c.is_ascii_alphabetic() || c == b'_' || c == b':'
}

fn is_name_char(c: u8) -> bool {
  c.is_ascii_alphanumeric() || c == b'_' || c == b':'
}

// Returns the offset one past the series identifier (`name` or `name{...}`).
fn series_end(line: &str) -> Result<usize, &'static str> {
  let bytes = line.as_bytes();
  if !bytes.first().copied().is_some_and(is_name_start) {
    return Err("invalid metric name");
  }
  let mut pos = 1;
  while pos < bytes.len() && is_name_char(bytes[pos]) {
    pos += 1;
  }
  if pos == bytes.len() || bytes[pos] != b'{' {
    return Ok(pos);
  }

  // Walk the label block honoring quoted values and escapes.
  let mut in_quotes = false;
  let mut escaped = false;
  for (offset, &c) in bytes[pos ..].iter().enumerate() {
    if in_quotes {
      if escaped {
        escaped = false;
      } else if c == b'\\' {
        escaped = true;
      } else if c == b'"' {
        in_quotes = false;
      }
    } else if c == b'"' {
      in_quotes = true;
    } else if c == b'}' {
      return Ok(pos + offset + 1);
    }
  }

  Err("unterminated label set")
}

/// Fully parses a raw series identifier into a label set, including the metric name label.
pub fn parse_series(series: &str) -> Result<Labels, ParseError> {
  let invalid = |reason| ParseError::Series(series.to_string(), reason);
  let bytes = series.as_bytes();

  let name_end = bytes
    .iter()
    .position(|&c| c == b'{')
    .unwrap_or(bytes.len());
  let name = &series[.. name_end];
  if !crate::labels::is_valid_metric_name(name) {
    return Err(invalid("invalid metric name"));
  }

  let mut labels = vec![Label::new(METRIC_NAME_LABEL, name)];
  if name_end == bytes.len() {
    return Ok(Labels::new(labels));
  }

  let body = series[name_end + 1 ..]
    .strip_suffix('}')
    .ok_or_else(|| invalid("unterminated label set"))?;
  let mut rest = body.trim_start();
  while !rest.is_empty() {
    let (label_name, after_name) = rest
      .split_once('=')
      .ok_or_else(|| invalid("missing '=' in label"))?;
    let label_name = label_name.trim();
    if !crate::labels::is_valid_label_name(label_name) {
      return Err(invalid("invalid label name"));
    }

    let after_name = after_name
      .trim_start()
      .strip_prefix('"')
      .ok_or_else(|| invalid("label value must be quoted"))?;
    let (value, consumed) =
      unescape_label_value(after_name).ok_or_else(|| invalid("bad label value"))?;
    if labels.iter().any(|l| l.name == label_name) {
      return Err(invalid("duplicate label name"));
    }
    // An empty value is the same as the label being absent.
    if !value.is_empty() {
      labels.push(Label::new(label_name, value));
    }

    rest = after_name[consumed ..].trim_start();
    match rest.strip_prefix(',') {
      Some(after_comma) => rest = after_comma.trim_start(),
      None if rest.is_empty() => {},
      None => return Err(invalid("expected ',' between labels")),
    }
  }

  Ok(Labels::new(labels))
}

// Unescapes a label value starting just after the opening quote. Returns the value and the number
// of bytes consumed including the closing quote.
fn unescape_label_value(input: &str) -> Option<(String, usize)> {
  let mut value = String::new();
  let mut chars = input.char_indices();
  while let Some((index, c)) = chars.next() {
    match c {
      '"' => return Some((value, index + 1)),
      '\\' => match chars.next()?.1 {
        'n' => value.push('\n'),
        '\\' => value.push('\\'),
        '"' => value.push('"'),
        other => {
          value.push('\\');
          value.push(other);
        },
      },
      c => value.push(c),
    }
  }
  None
}
