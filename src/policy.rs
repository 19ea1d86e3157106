use crate::types::ToolCall;

/// At most this many tool calls are executed per model round-trip.
pub const MAX_TOOL_CALLS_PER_TURN: usize = 1;
pub const DEFAULT_MAX_TURNS: usize = 25;

/// Limits applied to every run of the turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnPolicy {
    pub max_tool_calls_per_turn: usize,
    /// Model calls allowed before the job is failed.
    pub max_turns: usize,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            max_tool_calls_per_turn: MAX_TOOL_CALLS_PER_TURN,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }
}

impl TurnPolicy {
    pub fn with_max_turns(max_turns: usize) -> Self {
        Self {
            max_turns,
            ..Self::default()
        }
    }

    /// Keep the first `max_tool_calls_per_turn` calls in their original order.
    /// Returns how many were dropped.
    pub fn enforce(&self, calls: &mut Vec<ToolCall>) -> usize {
        let dropped = calls.len().saturating_sub(self.max_tool_calls_per_turn);
        calls.truncate(self.max_tool_calls_per_turn);
        dropped
    }

    pub fn turn_allowed(&self, turns_taken: usize) -> bool {
        turns_taken < self.max_turns
    }
}
