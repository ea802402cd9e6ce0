//! Wavefront data format serialization for metrics, distributions and spans.

use super::SenderError;
use std::fmt::Write;
use uuid::Uuid;

pub const DELTA_PREFIX: char = '\u{2206}';
const DELTA_PREFIX_ALT: char = '\u{0394}';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistogramGranularity {
    Minute,
    Hour,
    Day,
}

impl HistogramGranularity {
    fn identifier(&self) -> &'static str {
        match self {
            HistogramGranularity::Minute => "!M",
            HistogramGranularity::Hour => "!H",
            HistogramGranularity::Day => "!D",
        }
    }
}

/// A finished span in Wavefront terms.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanRecord {
    pub name: String,
    pub start_millis: i64,
    pub duration_millis: i64,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parents: Vec<Uuid>,
    pub follows_from: Vec<Uuid>,
    pub tags: Vec<(String, String)>,
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `-` and quotes the result.
/// A leading `~` or delta prefix is kept.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for (i, c) in name.trim().chars().enumerate() {
        let leading = i == 0 && (c == '~' || c == DELTA_PREFIX || c == DELTA_PREFIX_ALT);
        if leading || c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    out.push('"');
    out
}

pub fn sanitize_value(value: &str) -> String {
    format!(
        "\"{}\"",
        value.trim().replace('"', "\\\"").replace('\n', "\\n")
    )
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

fn append_tags(out: &mut String, tags: &[(String, String)]) -> Result<(), SenderError> {
    for (key, value) in tags {
        if is_blank(key) {
            return Err(SenderError::InvalidData("tag key cannot be blank".into()));
        }
        if is_blank(value) {
            return Err(SenderError::InvalidData(format!(
                "tag value for '{}' cannot be blank",
                key
            )));
        }
        let _ = write!(out, " {}={}", sanitize(key), sanitize_value(value));
    }
    Ok(())
}

fn check_name_and_source(name: &str, source: &str) -> Result<(), SenderError> {
    if is_blank(name) {
        return Err(SenderError::InvalidData("name cannot be blank".into()));
    }
    if is_blank(source) {
        return Err(SenderError::InvalidData("source cannot be blank".into()));
    }
    Ok(())
}

pub fn metric_line(
    name: &str,
    value: f64,
    timestamp: Option<i64>,
    source: &str,
    tags: &[(String, String)],
) -> Result<String, SenderError> {
    check_name_and_source(name, source)?;
    let mut out = sanitize(name);
    let _ = write!(out, " {}", value);
    if let Some(timestamp) = timestamp {
        let _ = write!(out, " {}", timestamp);
    }
    let _ = write!(out, " source={}", sanitize_value(source));
    append_tags(&mut out, tags)?;
    Ok(out)
}

pub fn histogram_line(
    name: &str,
    centroids: &[(f64, u64)],
    granularity: HistogramGranularity,
    timestamp: Option<i64>,
    source: &str,
    tags: &[(String, String)],
) -> Result<String, SenderError> {
    check_name_and_source(name, source)?;
    if centroids.is_empty() {
        return Err(SenderError::InvalidData(
            "a distribution should have at least one centroid".into(),
        ));
    }
    let mut out = granularity.identifier().to_string();
    if let Some(timestamp) = timestamp {
        let _ = write!(out, " {}", timestamp);
    }
    for (value, count) in centroids {
        let _ = write!(out, " #{} {}", count, value);
    }
    let _ = write!(out, " {} source={}", sanitize(name), sanitize_value(source));
    append_tags(&mut out, tags)?;
    Ok(out)
}

pub fn span_line(span: &SpanRecord, source: &str) -> Result<String, SenderError> {
    check_name_and_source(&span.name, source)?;
    let mut out = sanitize_value(&span.name);
    let _ = write!(
        out,
        " source={} traceId={} spanId={}",
        sanitize_value(source),
        span.trace_id.hyphenated(),
        span.span_id.hyphenated()
    );
    for parent in &span.parents {
        let _ = write!(out, " parent={}", parent.hyphenated());
    }
    for follows_from in &span.follows_from {
        let _ = write!(out, " followsFrom={}", follows_from.hyphenated());
    }
    append_tags(&mut out, &span.tags)?;
    let _ = write!(out, " {} {}", span.start_millis, span.duration_millis);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("http.server duration"), "\"http.server-duration\"");
        assert_eq!(sanitize("~component.heartbeat"), "\"~component.heartbeat\"");
        assert_eq!(sanitize("a~b/c"), "\"a-b-c\"");
        assert_eq!(sanitize("\u{2206}requests"), "\"\u{2206}requests\"");
    }

    #[test]
    fn test_sanitize_value_escapes() {
        assert_eq!(sanitize_value("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(sanitize_value("a\nb"), "\"a\\nb\"");
    }

    #[test]
    fn test_metric_line() {
        let line = metric_line(
            "new-york.power.usage",
            42422.0,
            Some(1493773500),
            "localhost",
            &tags(&[("datacenter", "dc1")]),
        )
        .unwrap();
        assert_eq!(
            line,
            "\"new-york.power.usage\" 42422 1493773500 source=\"localhost\" \"datacenter\"=\"dc1\""
        );
    }

    #[test]
    fn test_metric_line_without_timestamp() {
        let line = metric_line("requests", 1.5, None, "host", &[]).unwrap();
        assert_eq!(line, "\"requests\" 1.5 source=\"host\"");
    }

    #[test]
    fn test_metric_line_rejects_blank() {
        assert!(matches!(
            metric_line(" ", 1.0, None, "host", &[]),
            Err(SenderError::InvalidData(_))
        ));
        assert!(matches!(
            metric_line("requests", 1.0, None, "", &[]),
            Err(SenderError::InvalidData(_))
        ));
        assert!(matches!(
            metric_line("requests", 1.0, None, "host", &tags(&[("env", "")])),
            Err(SenderError::InvalidData(_))
        ));
    }

    #[test]
    fn test_histogram_line() {
        let line = histogram_line(
            "request.latency",
            &[(30.0, 20), (5.1, 10)],
            HistogramGranularity::Minute,
            Some(1493773500),
            "appServer1",
            &tags(&[("region", "us-west")]),
        )
        .unwrap();
        assert_eq!(
            line,
            "!M 1493773500 #20 30 #10 5.1 \"request.latency\" source=\"appServer1\" \"region\"=\"us-west\""
        );
    }

    #[test]
    fn test_histogram_line_requires_centroids() {
        let result = histogram_line(
            "request.latency",
            &[],
            HistogramGranularity::Hour,
            None,
            "host",
            &[],
        );
        assert!(matches!(result, Err(SenderError::InvalidData(_))));
    }

    #[test]
    fn test_span_line() {
        let span = SpanRecord {
            name: "getAllUsers".to_string(),
            start_millis: 1552949776000,
            duration_millis: 343,
            trace_id: Uuid::from_u128(0x7b3bf470_9456_11e8_9eb6_529269fb1459),
            span_id: Uuid::from_u64_pair(0, 0x0313bafe_9457_11e8),
            parents: vec![Uuid::from_u64_pair(0, 1)],
            follows_from: vec![],
            tags: tags(&[("application", "Wavefront"), ("http.method", "GET")]),
        };
        let line = span_line(&span, "localhost").unwrap();
        assert_eq!(
            line,
            "\"getAllUsers\" source=\"localhost\" \
             traceId=7b3bf470-9456-11e8-9eb6-529269fb1459 \
             spanId=00000000-0000-0000-0313-bafe945711e8 \
             parent=00000000-0000-0000-0000-000000000001 \
             \"application\"=\"Wavefront\" \"http.method\"=\"GET\" 1552949776000 343"
        );
    }
}
