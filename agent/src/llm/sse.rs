//! Server-sent-event decoding for streamed model responses.
//!
//! [`SseDecoder`] turns raw body chunks into `data:` payloads; the
//! [`ResponseAssembler`] folds the provider's event sequence into a complete
//! [`ModelResponse`], emitting [`StreamEvent`]s along the way.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::types::{ContentBlock, ModelResponse, StopReason, Usage};
use crate::llm::StreamEvent;
use crate::llm::error::LlmError;

/// Line-buffered SSE frame splitter.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a body chunk; returns the `data:` payloads completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    message: String,
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
    Finished(ContentBlock),
    Ignored,
}

/// Folds stream events into a [`ModelResponse`].
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    id: String,
    blocks: BTreeMap<usize, PartialBlock>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    stopped: bool,
}

impl ResponseAssembler {
    /// Apply one `data:` payload.
    pub fn apply(&mut self, payload: &str) -> Result<Vec<StreamEvent>, LlmError> {
        let event: WireEvent = serde_json::from_str(payload)
            .map_err(|err| LlmError::Decode(format!("stream event: {err}")))?;
        let mut events = Vec::new();
        match event {
            WireEvent::MessageStart { message } => {
                self.id = message.id;
                if let Some(usage) = message.usage {
                    self.merge_usage(&usage);
                }
            }
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    WireBlock::Text { text } => {
                        if !text.is_empty() {
                            events.push(StreamEvent::TextDelta(text.clone()));
                        }
                        PartialBlock::Text(text)
                    }
                    WireBlock::ToolUse { id, name } => {
                        events.push(StreamEvent::ToolUseStart {
                            id: id.clone(),
                            name: name.clone(),
                        });
                        PartialBlock::ToolUse {
                            id,
                            name,
                            json: String::new(),
                        }
                    }
                    WireBlock::Other => PartialBlock::Ignored,
                };
                self.blocks.insert(index, block);
            }
            WireEvent::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(&index), delta) {
                    (Some(PartialBlock::Text(text)), WireDelta::TextDelta { text: chunk }) => {
                        text.push_str(&chunk);
                        events.push(StreamEvent::TextDelta(chunk));
                    }
                    (
                        Some(PartialBlock::ToolUse { json, .. }),
                        WireDelta::InputJsonDelta { partial_json },
                    ) => json.push_str(&partial_json),
                    (None, _) => {
                        return Err(LlmError::Stream(format!(
                            "delta for unknown content block {index}"
                        )));
                    }
                    _ => {}
                }
            }
            WireEvent::ContentBlockStop { index } => {
                if let Some(block) = self.blocks.remove(&index) {
                    let finished = finish_block(block)?;
                    if let PartialBlock::Finished(ContentBlock::ToolUse { id, name, input }) =
                        &finished
                    {
                        events.push(StreamEvent::ToolUseComplete {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    self.blocks.insert(index, finished);
                }
            }
            WireEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(StopReason::parse(&reason));
                }
                if let Some(usage) = usage {
                    self.merge_usage(&usage);
                }
            }
            WireEvent::MessageStop => {
                self.stopped = true;
                events.push(StreamEvent::MessageComplete {
                    stop_reason: self.stop_reason.clone(),
                    usage: self.usage,
                });
            }
            WireEvent::Error { error } => {
                return Err(LlmError::Stream(format!("{}: {}", error.kind, error.message)));
            }
            WireEvent::Ping | WireEvent::Unknown => {}
        }
        Ok(events)
    }

    fn merge_usage(&mut self, usage: &WireUsage) {
        if let Some(input) = usage.input_tokens {
            self.usage.input_tokens = input;
        }
        if let Some(output) = usage.output_tokens {
            self.usage.output_tokens = output;
        }
    }

    /// Complete the response. A stream that never reached `message_stop`
    /// is an error; partial content is not returned.
    pub fn finish(self) -> Result<ModelResponse, LlmError> {
        if !self.stopped {
            return Err(LlmError::Stream(
                "stream ended before message_stop".to_string(),
            ));
        }
        let mut content = Vec::with_capacity(self.blocks.len());
        for (_, block) in self.blocks {
            if let PartialBlock::Finished(block) = finish_block(block)? {
                content.push(block);
            }
        }
        Ok(ModelResponse {
            id: self.id,
            content,
            stop_reason: self.stop_reason,
            usage: self.usage,
        })
    }
}

fn finish_block(block: PartialBlock) -> Result<PartialBlock, LlmError> {
    Ok(match block {
        PartialBlock::Text(text) => PartialBlock::Finished(ContentBlock::Text { text }),
        PartialBlock::ToolUse { id, name, json } => {
            let input = parse_tool_input(&json)?;
            PartialBlock::Finished(ContentBlock::ToolUse { id, name, input })
        }
        other => other,
    })
}

/// Empty or literal-null input becomes `{}`.
pub fn parse_tool_input(raw: &str) -> Result<Value, LlmError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => Ok(Value::Object(Map::new())),
        Ok(value) => Ok(value),
        Err(err) => Err(LlmError::Decode(format!("tool input json: {err}"))),
    }
}
