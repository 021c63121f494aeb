//! Incremental frame decoders for the two backend stream protocols.
//!
//! Both are push-based: feed raw bytes as they arrive, get back zero or more
//! decoded events. Chunk boundaries may fall anywhere (mid-line, mid-JSON);
//! incomplete trailing input is carried over to the next feed. Emitted deltas
//! concatenate to the backend's full response and are never reordered.

use serde::Deserialize;

/// One decoded event from a chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A non-empty content fragment.
    Delta(String),
    /// Terminal event carrying the full accumulated content.
    Done { content: String },
}

/// Decoder for the local server protocol: newline-delimited JSON objects
/// shaped `{"message":{"content":...},"done":bool}`.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    content: String,
    finished: bool,
}

#[derive(Debug, Deserialize)]
struct NdjsonLine {
    #[serde(default)]
    message: Option<NdjsonMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct NdjsonMessage {
    #[serde(default)]
    content: String,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated content so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// True once the `done` line has been seen; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(chunk);
        while let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..i).collect();
            self.buffer.drain(..1);
            let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
            if line.is_empty() {
                continue;
            }
            let event: NdjsonLine = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(_) => continue,
            };
            let fragment = event.message.map(|m| m.content).unwrap_or_default();
            if !fragment.is_empty() {
                self.content.push_str(&fragment);
                out.push(StreamEvent::Delta(fragment));
            }
            if event.done {
                self.finished = true;
                // An empty final fragment with no prior content ends the
                // sequence silently: a spurious empty message would knock out
                // the thinking indicator.
                if !self.content.is_empty() {
                    out.push(StreamEvent::Done {
                        content: self.content.clone(),
                    });
                }
                break;
            }
        }
        out
    }
}

/// Decoder for the gateway protocol: Server-Sent-Events `data: ` lines with
/// OpenAI-style `choices[0].delta.content` payloads, terminated by
/// `data: [DONE]`.
///
/// A complete `data:` line whose JSON fails to parse is held and re-prefixed
/// onto the next chunk instead of being dropped. This treats "parse failed"
/// as "fragment not yet complete", which is best-effort: a genuinely
/// malformed line is indistinguishable from a truncated one and stays merged
/// into the carry buffer.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    content: String,
    finished: bool,
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Option<Vec<SseChoice>>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: Option<SseDelta>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated content so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// True once `data: [DONE]` has been seen; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(i) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=i).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                self.finished = true;
                out.push(StreamEvent::Done {
                    content: self.content.clone(),
                });
                break;
            }
            match serde_json::from_str::<SseChunk>(data) {
                Ok(ev) => {
                    let delta = ev
                        .choices
                        .and_then(|c| c.into_iter().next())
                        .and_then(|c| c.delta)
                        .and_then(|d| d.content);
                    // Lines that parse but carry no delta content (role
                    // announcements, finish_reason chunks) are skipped.
                    if let Some(delta) = delta {
                        if !delta.is_empty() {
                            self.content.push_str(&delta);
                            out.push(StreamEvent::Delta(delta));
                        }
                    }
                }
                Err(_) => {
                    // Incomplete fragment: hold the line and wait for the
                    // rest to arrive in a later chunk.
                    let held = format!("data: {}", data);
                    self.buffer.insert_str(0, &held);
                    break;
                }
            }
        }
        out
    }
}
