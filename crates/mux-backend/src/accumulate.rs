//! Accumulates streamed deltas into the final [`AssistantMessage`].

use std::collections::BTreeMap;

use mux_protocol::{AssistantMessage, ContentBlock, StopReason, StreamEvent, Usage};

/// Partial state of one streamed tool call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct PendingToolCall {
    id: String,
    name: String,
    args: String,
}

/// Reassembles tool calls whose fragments arrive keyed by position.
///
/// Some vendors only send the id and name on the first fragment of a call,
/// so everything is keyed by index until the stream completes.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment into the call at `index`.
    ///
    /// Emits `ToolUseStart` the first time a name is seen for the index and
    /// `ToolUseDelta` for every non-empty argument fragment.
    pub fn apply(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
    ) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let call = self.calls.entry(index).or_default();

        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if call.id.is_empty() {
                call.id = id.to_string();
            }
        }

        if let Some(name) = name.filter(|name| !name.is_empty()) {
            if call.name.is_empty() {
                call.name = name.to_string();
                events.push(StreamEvent::ToolUseStart {
                    index,
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
            }
        }

        if let Some(args) = args.filter(|args| !args.is_empty()) {
            call.args.push_str(args);
            events.push(StreamEvent::ToolUseDelta {
                index,
                partial_json: args.to_string(),
            });
        }

        events
    }

    /// The next unused index, for vendors that send whole calls without one.
    pub fn next_index(&self) -> usize {
        self.calls.keys().next_back().map_or(0, |last| last + 1)
    }

    /// Index for a fragment that arrived without one. A new id opens a new
    /// call; anything else continues the latest call.
    pub fn index_for_id(&self, id: Option<&str>) -> usize {
        let id = id.filter(|id| !id.is_empty());
        match (self.calls.last_key_value(), id) {
            (None, _) => 0,
            (Some((&index, _)), None) => index,
            (Some((&index, call)), Some(id)) if call.id == id => index,
            (Some(_), Some(_)) => self.next_index(),
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.calls.contains_key(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Turn every pending call into a tool-use block, keyed by index.
    fn finalize(self) -> BTreeMap<usize, ContentBlock> {
        self.calls
            .into_iter()
            .map(|(index, call)| {
                let block = ContentBlock::ToolUse {
                    id: if call.id.is_empty() {
                        generate_tool_call_id()
                    } else {
                        call.id
                    },
                    name: call.name,
                    input_json: if call.args.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        call.args
                    },
                };
                (index, block)
            })
            .collect()
    }
}

pub(crate) fn generate_tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// A position in the final content: a finished block, or the tool call
/// that will be finalized into this spot.
#[derive(Debug)]
enum Slot {
    Block(ContentBlock),
    Tool(usize),
}

/// Builds the final message for one streaming call.
#[derive(Debug)]
pub struct MessageAccumulator {
    message: AssistantMessage,
    slots: Vec<Slot>,
    tools: ToolCallAccumulator,
    stop_reason: Option<StopReason>,
}

impl MessageAccumulator {
    pub fn new(api: &str, model: &str) -> Self {
        Self {
            message: AssistantMessage::new(api, model),
            slots: Vec::new(),
            tools: ToolCallAccumulator::new(),
            stop_reason: None,
        }
    }

    /// Append streamed text, extending the current text block if there is
    /// one since the last tool call.
    pub fn push_text(&mut self, text: &str) -> Option<StreamEvent> {
        if text.is_empty() {
            return None;
        }
        let open_block = self
            .slots
            .iter_mut()
            .rev()
            .take_while(|slot| !matches!(slot, Slot::Tool(_)))
            .find_map(|slot| match slot {
                Slot::Block(ContentBlock::Text { text }) => Some(text),
                _ => None,
            });
        match open_block {
            Some(existing) => existing.push_str(text),
            None => self.slots.push(Slot::Block(ContentBlock::Text {
                text: text.to_string(),
            })),
        }
        Some(StreamEvent::content(text))
    }

    pub fn push_thinking(&mut self, text: &str) -> Option<StreamEvent> {
        if text.is_empty() {
            return None;
        }
        let open_block = self
            .slots
            .iter_mut()
            .rev()
            .take_while(|slot| !matches!(slot, Slot::Tool(_)))
            .find_map(|slot| match slot {
                Slot::Block(ContentBlock::Thinking { thinking }) => Some(thinking),
                _ => None,
            });
        match open_block {
            Some(existing) => existing.push_str(text),
            None => self.slots.push(Slot::Block(ContentBlock::Thinking {
                thinking: text.to_string(),
            })),
        }
        Some(StreamEvent::thinking(text))
    }

    pub fn tools(&self) -> &ToolCallAccumulator {
        &self.tools
    }

    /// Fold one tool-call fragment in. The first fragment for an index fixes
    /// where the call sits relative to the text around it.
    pub fn apply_tool(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
    ) -> Vec<StreamEvent> {
        if !self.tools.contains(index) {
            self.slots.push(Slot::Tool(index));
        }
        self.tools.apply(index, id, name, args)
    }

    pub fn usage(&self) -> Usage {
        self.message.usage
    }

    pub fn usage_mut(&mut self) -> &mut Usage {
        &mut self.message.usage
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.message.usage = usage;
    }

    pub fn set_model(&mut self, model: &str) {
        if !model.is_empty() {
            self.message.model = model.to_string();
        }
    }

    pub fn set_stop_reason(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Finalize pending tool calls and produce the closing events and the
    /// final message.
    pub fn finish(mut self) -> (AssistantMessage, Vec<StreamEvent>) {
        let had_tools = !self.tools.is_empty();
        let mut tool_blocks = std::mem::take(&mut self.tools).finalize();
        let mut events = Vec::new();

        for slot in std::mem::take(&mut self.slots) {
            let block = match slot {
                Slot::Block(block) => block,
                Slot::Tool(index) => match tool_blocks.remove(&index) {
                    Some(block) => block,
                    None => continue,
                },
            };
            match &block {
                ContentBlock::Text { text } => {
                    events.push(StreamEvent::ContentDone { text: text.clone() });
                }
                ContentBlock::ToolUse {
                    id,
                    name,
                    input_json,
                } => events.push(StreamEvent::ToolUseDone {
                    id: id.clone(),
                    name: name.clone(),
                    input_json: input_json.clone(),
                }),
                _ => {}
            }
            self.message.content.push(block);
        }

        // Some OpenAI-compatible servers report "stop" even after tool calls.
        let stop_reason = match self.stop_reason {
            Some(StopReason::EndTurn) | None if had_tools => StopReason::ToolUse,
            Some(reason) => reason,
            None => StopReason::EndTurn,
        };
        self.message.stop_reason = stop_reason;
        events.push(StreamEvent::MessageDone {
            stop_reason,
            usage: self.message.usage,
        });

        (self.message, events)
    }
}
