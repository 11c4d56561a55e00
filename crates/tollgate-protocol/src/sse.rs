use bytes::Bytes;
use serde::Serialize;

/// Terminal sentinel of an OpenAI-style event stream.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Input is buffered as raw bytes until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]).into_owned();
            start = end + 1;
            self.accept_line(line, &mut frames);
        }
        self.pending.drain(..start);

        frames
    }

    /// Flushes a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
            self.accept_line(line, &mut frames);
        }
        self.flush(&mut frames);
        frames
    }

    fn accept_line(&mut self, mut line: String, frames: &mut Vec<SseFrame>) {
        if line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() {
            self.flush(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

pub fn encode_data(data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 8);
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let text = serde_json::to_string(value)?;
    Ok(encode_data(&text))
}

pub fn encode_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

pub fn encode_keep_alive() -> Bytes {
    Bytes::from_static(b": keep-alive\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: message_start\nda").is_empty());
        let frames = decoder.push(b"ta: {\"a\":1}\n\n: ping\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert!(frames[1].is_done());
    }

    #[test]
    fn keeps_multibyte_characters_intact() {
        let text = "data: héllo\n\n".as_bytes();
        let (left, right) = text.split_at(8);
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(left).is_empty());
        let frames = decoder.push(right);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn joins_multiline_data_and_handles_crlf() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: one\r\ndata: two\r\n\r\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        let frames = decoder.finish();
        assert_eq!(frames[0].data, "tail");
    }

    #[test]
    fn encodes_multiline_payloads() {
        assert_eq!(&encode_data("a\nb")[..], b"data: a\ndata: b\n\n");
        assert_eq!(&encode_done()[..], b"data: [DONE]\n\n");
    }
}
