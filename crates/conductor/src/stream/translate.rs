//! Native message protocol to caller events.

use conductor_protocol::{
    AgentMessage, BlockKind, EventPayload, NativeBlock, ResultMessage, Role, StreamEvent,
    TurnResult,
};
use log::debug;

use super::{StreamAssembler, block_from_native};

/// Translates the agent's message stream into caller events.
///
/// Stateful across a session: it holds the current turn's assembler and the
/// latest conversation id the agent reported.
#[derive(Debug, Default)]
pub struct TurnTranslator {
    assembler: StreamAssembler,
    conversation_id: Option<String>,
    /// A block was streamed since the last assistant message. The echoed
    /// full message is then a duplicate, even if every block got dropped.
    streamed: bool,
}

impl TurnTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured assembler (e.g. with question events disabled).
    pub fn with_assembler(assembler: StreamAssembler) -> Self {
        Self {
            assembler,
            conversation_id: None,
            streamed: false,
        }
    }

    /// Conversation id from the most recent `system`/`result` message.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Translate one native message into zero or more events.
    pub fn translate(&mut self, message: &AgentMessage) -> Vec<EventPayload> {
        match message {
            AgentMessage::System { subtype, session_id } => {
                if subtype == "init"
                    && let Some(id) = session_id
                {
                    self.conversation_id = Some(id.clone());
                }
                Vec::new()
            }
            AgentMessage::StreamEvent { event, .. } => self.on_stream_event(event),
            AgentMessage::Assistant { message, .. } => {
                if std::mem::take(&mut self.streamed) {
                    self.assembler.complete_turn()
                } else {
                    self.assembler.complete_turn_from(&message.content)
                }
            }
            AgentMessage::User { message, .. } => on_tool_results(&message.content),
            AgentMessage::Result(result) => self.on_result(result),
            AgentMessage::ControlRequest { .. }
            | AgentMessage::ControlResponse { .. }
            | AgentMessage::Unknown => Vec::new(),
        }
    }

    fn on_stream_event(&mut self, event: &StreamEvent) -> Vec<EventPayload> {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.streamed = true;
                self.assembler.start(*index, content_block);
                Vec::new()
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.assembler.delta(*index, delta);
                Vec::new()
            }
            StreamEvent::ContentBlockStop { index } => self.assembler.stop(*index),
            StreamEvent::MessageStart { .. }
            | StreamEvent::MessageDelta { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Unknown => Vec::new(),
        }
    }

    fn on_result(&mut self, result: &ResultMessage) -> Vec<EventPayload> {
        // A result without a preceding assistant message still flushes what
        // was streamed.
        let streamed = std::mem::take(&mut self.streamed);
        let mut events = if streamed || self.assembler.has_blocks() {
            self.assembler.complete_turn()
        } else {
            Vec::new()
        };

        if let Some(ref id) = result.session_id {
            self.conversation_id = Some(id.clone());
        }
        debug!(
            "turn finished: subtype={} is_error={} conversation={:?}",
            result.subtype, result.is_error, self.conversation_id
        );

        events.push(EventPayload::Result(TurnResult {
            cost_usd: result.total_cost_usd,
            duration_ms: result.duration_ms,
            num_turns: result.num_turns,
            usage: result.usage.clone(),
            conversation_id: self.conversation_id.clone(),
            is_error: result.is_error,
        }));
        events
    }
}

/// Tool results echoed back in a user message.
fn on_tool_results(content: &[NativeBlock]) -> Vec<EventPayload> {
    let blocks: Vec<_> = content
        .iter()
        .enumerate()
        .filter_map(|(i, native)| block_from_native(i, native))
        .filter(|b| b.kind == BlockKind::ToolResult)
        .map(|mut b| {
            b.streaming = false;
            b
        })
        .collect();

    if blocks.is_empty() {
        return Vec::new();
    }

    let mut events: Vec<EventPayload> = blocks
        .iter()
        .cloned()
        .map(|block| EventPayload::ContentBlock { block })
        .collect();
    events.push(EventPayload::Message {
        role: Role::User,
        content: blocks,
    });
    events
}
