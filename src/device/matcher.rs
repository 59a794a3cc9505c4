//! Regex table over a streamed receive buffer.

use super::{CommandId, Reply};
use crate::error::{AvError, AvResult};
use bytes::{Buf, BytesMut};
use regex::bytes::{Captures, Regex};
use std::fmt;

/// Converts one match into a reply. `None` drops the match.
pub type Matcher<C> = fn(&Captures<'_>) -> Option<Reply<C>>;

/// Ordered list of reply patterns.
///
/// Each scan applies the patterns in registration order, removing every
/// match from the buffer. Bytes before the last match are junk and dropped;
/// when nothing matched the buffer is capped at its newest `max_buffer`
/// bytes.
pub struct MatchTable<C> {
    entries: Vec<(Regex, Matcher<C>)>,
    max_buffer: usize,
}

impl<C: CommandId> MatchTable<C> {
    #[must_use]
    pub fn new(max_buffer: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_buffer,
        }
    }

    /// Register a pattern. Registering the same pattern twice keeps the
    /// first matcher.
    pub fn add(&mut self, pattern: &str, matcher: Matcher<C>) -> AvResult<()> {
        if self.entries.iter().any(|(regex, _)| regex.as_str() == pattern) {
            return Ok(());
        }
        let regex = Regex::new(pattern)
            .map_err(|err| AvError::Configuration(format!("bad reply pattern {pattern}: {err}")))?;
        self.entries.push((regex, matcher));
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Extract every reply currently in `buffer`.
    pub fn scan(&self, buffer: &mut BytesMut) -> Vec<Reply<C>> {
        let mut replies = Vec::new();
        let mut index = 0;

        for (regex, matcher) in &self.entries {
            loop {
                let found = regex.captures(&buffer[..]).map(|caps| {
                    // Group 0 always exists for a successful match.
                    let whole = caps.get(0).map_or(0..0, |m| m.range());
                    (whole, matcher(&caps))
                });
                let Some((range, reply)) = found else {
                    break;
                };
                index = range.start;
                replies.extend(reply);

                let tail = buffer.split_off(range.end);
                buffer.truncate(range.start);
                buffer.unsplit(tail);
                if range.is_empty() {
                    break;
                }
            }
        }

        if index > 0 {
            buffer.advance(index.min(buffer.len()));
        } else if buffer.len() > self.max_buffer {
            let excess = buffer.len() - self.max_buffer;
            buffer.advance(excess);
        }
        replies
    }
}

impl<C> fmt::Debug for MatchTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchTable")
            .field("patterns", &self.entries.len())
            .field("max_buffer", &self.max_buffer)
            .finish()
    }
}
