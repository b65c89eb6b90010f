//! `@event::<name>::@end` markers in container output.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const MARKER_START: &str = "@event::";
/// Longest unterminated marker kept across chunks.
const MAX_PENDING: usize = 4096;

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@event::(.+?)::@end").unwrap_or_else(|_| unreachable!()))
}

/// Every event name in `text`, in order.
pub fn extract_events(text: &str) -> Vec<String> {
    marker_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_owned()))
        .collect()
}

/// Finds markers in a chunked stream, including markers split across chunks.
#[derive(Debug, Default)]
pub struct EventScanner {
    pending: String,
}

impl EventScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        for captures in marker_regex().captures_iter(&self.pending) {
            if let (Some(all), Some(name)) = (captures.get(0), captures.get(1)) {
                events.push(name.as_str().to_owned());
                consumed = all.end();
            }
        }
        let rest = &self.pending[consumed..];

        let keep_from = match rest.rfind(MARKER_START) {
            Some(pos) if rest.len() - pos <= MAX_PENDING => pos,
            Some(_) => rest.len(),
            // A marker prefix may be cut at the chunk boundary.
            None => rest
                .char_indices()
                .rev()
                .take(MARKER_START.len() - 1)
                .last()
                .map_or(rest.len(), |(i, _)| i),
        };
        self.pending = rest[keep_from..].to_owned();
        events
    }
}

/// Actions the core can run in response to a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHandler {
    /// Send SIGHUP to the reverse proxy container so it rereads its config.
    ReloadProxy,
}

impl StreamHandler {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "reloadNginx" => Some(StreamHandler::ReloadProxy),
            _ => None,
        }
    }
}

/// Handler for `event` under a type's `streamEvents` mapping.
pub fn resolve_handler(
    stream_events: &BTreeMap<String, String>,
    event: &str,
) -> Option<StreamHandler> {
    stream_events
        .get(event)
        .and_then(|name| StreamHandler::from_name(name))
}
