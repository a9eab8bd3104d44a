// This file is part of gglite, a lightweight IoT edge agent runtime
// Copyright (C) 2023 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::fmt;

use crate::error::{Error, ErrorKind};
use crate::object::Buffer;

/// Upper bound for topic and topic filter lengths in bytes.
///
/// Matches the upstream broker limit for topics that can be subscribed to.
pub const MAX_TOPIC_LEN: usize = 256;

/// A validated MQTT topic filter.
///
/// `+` matches exactly one level, `#` matches all remaining levels and is
/// only legal as the final level. Everything else matches level-wise by
/// byte equality. Invalid filters are rejected at construction, so a stored
/// filter never needs re-checking on the match path.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TopicFilter(Buffer);

impl TopicFilter {
    pub fn new(filter: impl Into<Buffer>) -> Result<Self, Error> {
        let filter = filter.into();

        if filter.is_empty() {
            return Err(Error::new(ErrorKind::Invalid, "empty topic filter"));
        }

        if filter.len() > MAX_TOPIC_LEN {
            return Err(Error::new(
                ErrorKind::Range,
                format!("topic filter exceeds {} bytes", MAX_TOPIC_LEN),
            ));
        }

        let levels: Vec<&[u8]> = filter.as_bytes().split(|b| *b == b'/').collect();

        for (index, level) in levels.iter().enumerate() {
            let last = index == levels.len() - 1;

            match *level {
                [b'#'] if !last => {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        format!("'#' before the final level in {:?}", filter),
                    ));
                }
                [b'#'] | [b'+'] => {}
                level if level.contains(&b'#') || level.contains(&b'+') => {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        format!("wildcard mixed with other bytes in {:?}", filter),
                    ));
                }
                _ => {}
            }
        }

        Ok(TopicFilter(filter))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_buffer(&self) -> &Buffer {
        &self.0
    }

    /// Match a topic against this filter.
    ///
    /// Deterministic and independent of any dispatcher state.
    pub fn matches(&self, topic: &[u8]) -> bool {
        if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
            return false;
        }

        let mut filter_levels = self.0.as_bytes().split(|b| *b == b'/');
        let mut topic_levels = topic.split(|b| *b == b'/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some(b"#"), _) => return true,
                (Some(b"+"), Some(_)) => {}
                (Some(filter_level), Some(topic_level)) => {
                    if filter_level != topic_level {
                        return false;
                    }
                }
                (None, None) => return true,
                // One side has levels left over. The only exception, a
                // trailing "#" matching zero levels, is handled above.
                (Some(_), None) | (None, Some(_)) => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::{TopicFilter, MAX_TOPIC_LEN};
    use crate::error::ErrorKind;

    fn matches(filter: &str, topic: &str) -> bool {
        TopicFilter::new(filter).unwrap().matches(topic.as_bytes())
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/d"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(!matches("a/+", "a"));
        assert!(matches("+", "a"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("a/#", "a/b/c/d"));
        assert!(matches("a/#", "a"));
        assert!(matches("#", "a/b"));
        assert!(!matches("a/#", "b/a"));
    }

    #[test]
    fn literal_levels() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(matches("a//b", "a//b"));
    }

    #[test]
    fn invalid_filters_rejected() {
        assert_eq!(
            TopicFilter::new("#/a").unwrap_err().kind(),
            ErrorKind::Invalid
        );
        assert_eq!(
            TopicFilter::new("a/b#").unwrap_err().kind(),
            ErrorKind::Invalid
        );
        assert_eq!(
            TopicFilter::new("a/+b/c").unwrap_err().kind(),
            ErrorKind::Invalid
        );
        assert_eq!(TopicFilter::new("").unwrap_err().kind(), ErrorKind::Invalid);
    }

    #[test]
    fn length_ceiling() {
        let at_limit = "a".repeat(MAX_TOPIC_LEN);
        assert!(TopicFilter::new(at_limit.as_str()).is_ok());

        let over = "a".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(
            TopicFilter::new(over.as_str()).unwrap_err().kind(),
            ErrorKind::Range
        );

        let filter = TopicFilter::new("#").unwrap();
        assert!(!filter.matches(over.as_bytes()));
    }
}
