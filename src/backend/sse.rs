//! SSE (Server-Sent Events) frame decoder for upstream streaming APIs.
//!
//! Handles `data: ` payload lines, the `data: [DONE]` terminator, `event:`
//! tags (Anthropic), comment keep-alives, and frames split across TCP chunk
//! boundaries.

use serde_json::Value;

/// One decoded SSE frame: the JSON payload plus the preceding `event:` tag
/// when the upstream sent one.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: Value,
}

/// Buffering SSE decoder.
///
/// Feed raw network chunks with [`feed`](Self::feed); complete frames come
/// back in order. The `[DONE]` sentinel flips [`done`](Self::done) instead
/// of producing a frame.
///
/// # Example
///
/// ```
/// use llm_gateway::backend::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// let frames = decoder.feed(b"data: {\"delta\":\"hi\"}\n\ndata: [DONE]\n\n");
/// assert_eq!(frames.len(), 1);
/// assert!(decoder.done());
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the upstream sent the `[DONE]` terminator.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes; returns every frame completed by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();

            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(event) = line.strip_prefix("event:") {
                self.pending_event = Some(event.trim().to_string());
                continue;
            }

            let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                self.done = true;
                self.pending_event = None;
                continue;
            }

            if let Ok(value) = serde_json::from_str::<Value>(data) {
                frames.push(SseFrame {
                    event: self.pending_event.take(),
                    data: value,
                });
            } else {
                self.pending_event = None;
            }
        }
        frames
    }

    /// Drain any trailing frame not terminated by a newline.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let remaining = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();
        for line in remaining.lines() {
            let line = line.trim();
            if let Some(data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            {
                let data = data.trim();
                if data == "[DONE]" {
                    self.done = true;
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    frames.push(SseFrame {
                        event: None,
                        data: value,
                    });
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"delta\":\"hello\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["delta"], "hello");
        assert!(frames[0].event.is_none());
        assert!(!decoder.done());
    }

    #[test]
    fn test_done_sets_flag_without_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 1);
        assert!(decoder.done());
    }

    #[test]
    fn test_event_tag_attached_to_next_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\"}\n\n",
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("content_block_delta"));
    }

    #[test]
    fn test_event_tag_not_leaked_across_frames() {
        let mut decoder = SseDecoder::new();
        let frames =
            decoder.feed(b"event: message_start\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert!(frames[1].event.is_none());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"del").is_empty());
        let frames = decoder.feed(b"ta\":\"hi\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["delta"], "hi");
    }

    #[test]
    fn test_comment_keepalives_ignored() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": heartbeat\n\ndata: {\"x\":1}\n\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_multiple_frames_one_chunk() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"i\":1}\n\ndata: {\"i\":2}\n\ndata: {\"i\":3}\n\n");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].data["i"], 3);
    }

    #[test]
    fn test_finish_recovers_trailing_frame() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: {\"tail\":true}");
        let frames = decoder.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["tail"], serde_json::json!(true));
    }

    #[test]
    fn test_invalid_json_skipped() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: not json\n\ndata: {\"ok\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["ok"], 1);
    }
}
