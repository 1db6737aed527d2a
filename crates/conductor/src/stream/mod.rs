//! Streaming reconstruction.
//!
//! Agents stream content as `{start, delta, stop}` events keyed by a block
//! index. [`StreamAssembler`] rebuilds complete [`ContentBlock`]s from those
//! events; [`TurnTranslator`] drives it from the full native message
//! protocol. Every backend uses the same pair, so a turn looks identical no
//! matter where the agent ran.

mod translate;

pub use translate::TurnTranslator;

use std::collections::BTreeMap;

use conductor_protocol::{
    ASK_USER_TOOL, BlockDelta, BlockKind, ContentBlock, EventPayload, NativeBlock, QuestionItem,
    Role,
};
use log::{debug, warn};
use serde_json::Value;

/// Rebuilds content blocks for one assistant turn.
#[derive(Debug)]
pub struct StreamAssembler {
    /// Open and finalized blocks of the current turn, by index.
    blocks: BTreeMap<usize, ContentBlock>,
    /// Index of the most recently opened block.
    last_opened: Option<usize>,
    /// Emit a question event when an ask-user tool block is finalized.
    emit_questions: bool,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            last_opened: None,
            emit_questions: true,
        }
    }

    /// Disable question events, for runtimes that surface ask-user through
    /// a separate channel.
    pub fn without_question_events(mut self) -> Self {
        self.emit_questions = false;
        self
    }

    /// Whether any block has been opened this turn.
    pub fn has_blocks(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Open a block. Unknown block types are ignored.
    pub fn start(&mut self, index: usize, native: &NativeBlock) {
        let Some(mut block) = block_from_native(index, native) else {
            debug!("ignoring content block of unknown type at index {}", index);
            return;
        };
        block.streaming = true;

        if self.blocks.insert(index, block).is_some() {
            debug!("content block {} restarted", index);
        }
        self.last_opened = Some(index);
    }

    /// Append a delta. A delta for an unknown index goes to the most recently
    /// opened block; with no open block it is dropped.
    pub fn delta(&mut self, index: usize, delta: &BlockDelta) {
        let fragment = match delta {
            BlockDelta::TextDelta { text } => text,
            BlockDelta::ThinkingDelta { thinking } => thinking,
            BlockDelta::InputJsonDelta { partial_json } => partial_json,
            BlockDelta::Unknown => return,
        };

        let target = if self.blocks.contains_key(&index) {
            Some(index)
        } else {
            self.last_opened
        };

        match target.and_then(|i| self.blocks.get_mut(&i)) {
            Some(block) if block.streaming => block.text.push_str(fragment),
            Some(block) => debug!("dropping delta for finalized block {}", block.index),
            None => debug!("dropping delta for index {} with no open block", index),
        }
    }

    /// Finalize a block, yielding its content-block event (and a question
    /// event for ask-user invocations).
    pub fn stop(&mut self, index: usize) -> Vec<EventPayload> {
        match self.blocks.get(&index) {
            Some(block) if block.streaming => self.finalize(index),
            Some(_) => Vec::new(),
            None => {
                debug!("stop for unknown content block {}", index);
                Vec::new()
            }
        }
    }

    /// Close the turn: finalize blocks still streaming, then emit every
    /// block as one assistant message and reset.
    pub fn complete_turn(&mut self) -> Vec<EventPayload> {
        let streaming: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.streaming)
            .map(|(i, _)| *i)
            .collect();

        let mut events = Vec::new();
        for index in streaming {
            events.extend(self.finalize(index));
        }

        let content: Vec<ContentBlock> = std::mem::take(&mut self.blocks).into_values().collect();
        self.last_opened = None;

        if !content.is_empty() {
            events.push(EventPayload::Message {
                role: Role::Assistant,
                content,
            });
        }
        events
    }

    /// Feed a complete (non-streamed) assistant message through the same
    /// start/stop path, then close the turn.
    pub fn complete_turn_from(&mut self, content: &[NativeBlock]) -> Vec<EventPayload> {
        let mut events = Vec::new();
        let base = self.blocks.keys().next_back().map(|i| i + 1).unwrap_or(0);
        for (offset, native) in content.iter().enumerate() {
            let index = base + offset;
            self.start(index, native);
            events.extend(self.stop(index));
        }
        events.extend(self.complete_turn());
        events
    }

    /// Discard all state without emitting anything.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.last_opened = None;
    }

    fn finalize(&mut self, index: usize) -> Vec<EventPayload> {
        let Some(block) = self.blocks.get_mut(&index) else {
            return Vec::new();
        };
        block.streaming = false;

        if block.kind == BlockKind::ToolUse {
            if !block.text.trim().is_empty() {
                match serde_json::from_str::<Value>(&block.text) {
                    Ok(input) => block.input = Some(input),
                    Err(e) => {
                        warn!(
                            "dropping tool_use block {} ({:?}): malformed input JSON: {}",
                            index, block.tool_name, e
                        );
                        self.blocks.remove(&index);
                        return Vec::new();
                    }
                }
            } else if block.input.is_none() {
                block.input = Some(Value::Object(Default::default()));
            }
        }

        let block = block.clone();
        let mut events = Vec::new();
        let question = if self.emit_questions {
            question_from_block(&block)
        } else {
            None
        };
        events.push(EventPayload::ContentBlock { block });
        if let Some(question) = question {
            events.push(question);
        }
        events
    }
}

/// Map a native block to a content block. `None` for unknown types.
pub fn block_from_native(index: usize, native: &NativeBlock) -> Option<ContentBlock> {
    let block = match native {
        NativeBlock::Text { text } => {
            let mut b = ContentBlock::new(BlockKind::Text, index);
            b.text = text.clone();
            b
        }
        NativeBlock::Thinking { thinking } => {
            let mut b = ContentBlock::new(BlockKind::Thinking, index);
            b.text = thinking.clone();
            b
        }
        NativeBlock::ToolUse { id, name, input } => {
            let mut b = ContentBlock::new(BlockKind::ToolUse, index);
            b.tool_name = Some(name.clone());
            b.tool_use_id = Some(id.clone());
            // Streamed tool_use starts with `{}` and fills via deltas; a
            // complete message carries the real input here.
            if input.as_object().is_some_and(|o| !o.is_empty()) {
                b.text = input.to_string();
            }
            b
        }
        NativeBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut b = ContentBlock::new(BlockKind::ToolResult, index);
            b.tool_use_id = Some(tool_use_id.clone());
            b.text = content_text(content);
            b.success = Some(!is_error.unwrap_or(false));
            b
        }
        NativeBlock::Unknown => return None,
    };
    Some(block)
}

/// Flatten tool result content (string or list of text parts) to text.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.clone()),
                other => other.get("text").and_then(Value::as_str).map(str::to_string),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Question event for a finalized ask-user tool block.
fn question_from_block(block: &ContentBlock) -> Option<EventPayload> {
    if block.kind != BlockKind::ToolUse || block.tool_name.as_deref() != Some(ASK_USER_TOOL) {
        return None;
    }

    let tool_use_id = block.tool_use_id.clone()?;
    question_event(tool_use_id, block.input.as_ref()?)
}

/// Question event from an ask-user tool input (`{"questions": [...]}`).
pub fn question_event(tool_use_id: String, input: &Value) -> Option<EventPayload> {
    let raw = input.get("questions")?.clone();
    match serde_json::from_value::<Vec<QuestionItem>>(raw) {
        Ok(questions) => Some(EventPayload::Question {
            tool_use_id,
            questions,
        }),
        Err(e) => {
            warn!("ask-user input for {} has no usable questions: {}", tool_use_id, e);
            None
        }
    }
}
