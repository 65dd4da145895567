//! MQTT-style topic patterns for wildcard subscriptions.

use super::BrokerError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `+`: exactly one non-empty level
    Single,
    /// `#`: every remaining level, at least one
    Multi,
}

/// A parsed wildcard pattern. Construction validates the pattern so matching
/// never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, BrokerError> {
        let invalid = |reason: &str| BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "+" => Segment::Single,
                "#" if i == last => Segment::Multi,
                "#" => return Err(invalid("'#' must be the last segment")),
                p if p.contains('+') || p.contains('#') => {
                    return Err(invalid("wildcards must occupy a whole segment"))
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        for segment in &self.segments {
            match segment {
                Segment::Multi => return levels.next().is_some(),
                Segment::Single => match levels.next() {
                    Some(level) if !level.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(lit) => match levels.next() {
                    Some(level) if level == lit => {}
                    _ => return false,
                },
            }
        }
        levels.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
