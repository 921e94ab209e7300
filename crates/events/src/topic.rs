//! Glob-style topic patterns matched against channel names.
//!
//! Channel names are dot-separated segments (`orders.created`). In a pattern, `*`
//! matches any run of characters inside one segment; every other character is literal.
//! The pattern is anchored at both ends, so `orders.*` matches `orders.created` but
//! neither `orders` nor `order.created`.

use regex::Regex;

const SEGMENT_WILDCARD: &str = "[^.]*";

#[derive(Debug, Clone)]
pub struct TopicPattern {
    raw: String,
    regex: Regex,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, regex::Error> {
        let raw = pattern.into();
        let body = raw
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(SEGMENT_WILDCARD);
        let regex = Regex::new(&format!("^{body}$"))?;
        Ok(Self { raw, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.regex.is_match(channel)
    }

    /// Names from `channels` that match, preserving input order.
    pub fn filter<'a>(&self, channels: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        channels.into_iter().filter(|c| self.matches(c)).collect()
    }
}
