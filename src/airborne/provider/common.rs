//! Shared HTTP client and SSE parsing helpers reused by every concrete provider adapter.
//!
//! Grounded on the teacher's `clients/common.rs`: one pooled [`reqwest::Client`] behind a
//! `lazy_static`, plus the audit-capture style of returning the raw request/response JSON
//! alongside the parsed result so adapters can fill [`GenerateResult::raw_request`] /
//! `raw_response`.

use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling, reused by every adapter so TLS
    /// sessions and DNS lookups stay warm across concurrent calls to the same upstream.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build shared HTTP client");
}

/// Borrow the lazily initialized shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// One decoded Server-Sent-Events frame: the event name (if present) and its data payload
/// (already stripped of the `data: ` prefix, newline-joined if the frame spanned multiple
/// `data:` lines).
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame accumulator: feed raw bytes from a `bytes_stream()` chunk and drain
/// completed frames (terminated by a blank line) as they become available.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        SseDecoder::default()
    }

    /// Feed a raw byte chunk and return any complete frames now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event_name: Option<String> = None;
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event_name,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame_split_across_feeds() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":1}").is_empty());
        let events = decoder.feed(b"\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn decodes_multiple_frames_in_one_feed() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: one\n\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn captures_event_name() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: completion\ndata: done\n\n");
        assert_eq!(events[0].event.as_deref(), Some("completion"));
    }

    #[test]
    fn ignores_frames_without_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": heartbeat\n\n");
        assert!(events.is_empty());
    }
}
