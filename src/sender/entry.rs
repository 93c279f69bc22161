use log::error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AgentError, Result};

/// Tag set of an entry, kept in key order
pub type Tags = BTreeMap<String, String>;

/// A structured metric record as delivered to the time-series database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: Tags,
}

/// Turns raw collector lines into [`MetricEntry`] values
///
/// Per-line tags are overlaid on a copy of the global tags. When the result
/// would exceed `max_tags`, per-line tags that are not also global are
/// dropped, last key first, and the dropped keys are logged.
#[derive(Debug, Clone)]
pub struct LineParser {
    global_tags: Tags,
    max_tags: usize,
}

impl LineParser {
    pub fn new(global_tags: Tags, max_tags: usize) -> Self {
        Self {
            global_tags,
            max_tags,
        }
    }

    /// Tags added to every entry
    pub fn global_tags(&self) -> &Tags {
        &self.global_tags
    }

    pub fn max_tags(&self) -> usize {
        self.max_tags
    }

    /// Parse `<metric> <timestamp> <value> [tag=val ...]`
    pub fn parse(&self, line: &str) -> Result<MetricEntry> {
        let malformed = |reason: &str| AgentError::Metric(format!("{}: {:?}", reason, line));

        let (metric, rest) = next_field(line).ok_or_else(|| malformed("empty line"))?;
        let (timestamp, rest) = next_field(rest).ok_or_else(|| malformed("missing timestamp"))?;
        let (value, rest) = next_field(rest).ok_or_else(|| malformed("missing value"))?;

        let timestamp = timestamp
            .parse::<i64>()
            .map_err(|_| malformed("timestamp is not an integer"))?;
        let value = value
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| malformed("value is not a finite number"))?;

        let line_tags = parse_tags(rest.trim())?;
        let tags = self.merge_tags(metric, line_tags);

        Ok(MetricEntry {
            metric: metric.to_string(),
            timestamp,
            value,
            tags,
        })
    }

    fn merge_tags(&self, metric: &str, line_tags: Tags) -> Tags {
        let mut tags = self.global_tags.clone();
        let mut dropped = Vec::new();

        for (key, value) in line_tags {
            if tags.contains_key(&key) || tags.len() < self.max_tags {
                tags.insert(key, value);
            } else {
                dropped.push(key);
            }
        }

        if !dropped.is_empty() {
            error!(
                "Exceeding maximum permitted metric tags - removing {:?} for metric {}",
                dropped, metric
            );
        }

        tags
    }
}

/// Parse space-separated `key=value` tokens
pub fn parse_tags(raw: &str) -> Result<Tags> {
    let mut tags = Tags::new();
    for token in raw.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                tags.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(AgentError::Metric(format!("invalid tag {:?}", token)).into());
            }
        }
    }
    Ok(tags)
}

/// Split off the next whitespace-delimited field
fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(end) => Some((&s[..end], &s[end..])),
        None => Some((s, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_with_global_tags() {
        let parser = LineParser::new(tags(&[("dc", "east")]), 8);
        let entry = parser.parse("sys.cpu 1610000000 42 host=a").unwrap();

        assert_eq!(
            entry,
            MetricEntry {
                metric: "sys.cpu".to_string(),
                timestamp: 1610000000,
                value: 42.0,
                tags: tags(&[("dc", "east"), ("host", "a")]),
            }
        );
    }

    #[test]
    fn test_parse_without_tags_and_extra_whitespace() {
        let parser = LineParser::new(Tags::new(), 8);
        let entry = parser.parse("  a.b   100\t1.5  ").unwrap();

        assert_eq!(entry.metric, "a.b");
        assert_eq!(entry.timestamp, 100);
        assert_eq!(entry.value, 1.5);
        assert!(entry.tags.is_empty());
    }

    #[test]
    fn test_line_tag_overrides_global_value() {
        let parser = LineParser::new(tags(&[("host", "agent")]), 1);
        let entry = parser.parse("a.b 100 1 host=other").unwrap();

        assert_eq!(entry.tags, tags(&[("host", "other")]));
    }

    #[test]
    fn test_tag_cap_keeps_global_tags() {
        let parser = LineParser::new(tags(&[("dc", "east")]), 8);
        let line_tags: Vec<String> = (0..10).map(|i| format!("k{}=v{}", i, i)).collect();
        let line = format!("sys.mem 1610000000 7 {}", line_tags.join(" "));

        let entry = parser.parse(&line).unwrap();

        assert_eq!(entry.tags.len(), 8);
        assert_eq!(entry.tags.get("dc").map(String::as_str), Some("east"));
        // Keys sorting last are the ones dropped
        assert!(entry.tags.contains_key("k0"));
        assert!(!entry.tags.contains_key("k9"));
    }

    #[test]
    fn test_malformed_lines() {
        let parser = LineParser::new(Tags::new(), 8);

        assert!(parser.parse("").is_err());
        assert!(parser.parse("a.b").is_err());
        assert!(parser.parse("a.b 100").is_err());
        assert!(parser.parse("a.b soon 1").is_err());
        assert!(parser.parse("a.b 100.5 1").is_err());
        assert!(parser.parse("a.b 100 many").is_err());
        assert!(parser.parse("a.b 100 NaN").is_err());
        assert!(parser.parse("a.b 100 1 novalue").is_err());
        assert!(parser.parse("a.b 100 1 =x").is_err());
    }

    #[test]
    fn test_parse_tags_last_duplicate_wins() {
        let parsed = parse_tags("a=1 b=2 a=3").unwrap();
        assert_eq!(parsed, tags(&[("a", "3"), ("b", "2")]));
    }

    #[test]
    fn test_value_keeps_equals_sign() {
        let parsed = parse_tags("query=a=b").unwrap();
        assert_eq!(parsed.get("query").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = MetricEntry {
            metric: "sys.cpu".to_string(),
            timestamp: 1610000000,
            value: 42.0,
            tags: tags(&[("dc", "east")]),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "metric": "sys.cpu",
                "timestamp": 1610000000,
                "value": 42.0,
                "tags": {"dc": "east"}
            })
        );
    }
}
