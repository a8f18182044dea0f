//! Conversation history.
//!
//! A [`Transcript`] is the ordered list of turns shown to the user and replayed
//! to the model as context. It lives only in memory and can be bounded to a
//! number of user/assistant pairs, in which case the oldest turns are dropped
//! first.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// The speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One utterance in the conversation.
///
/// The role is fixed at construction. Content can only be replaced through
/// [`Transcript::update_last`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: VecDeque<Turn>,
    max_pairs: Option<usize>,
}

impl Transcript {
    /// An unbounded transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transcript that keeps at most `max_pairs` user/assistant pairs.
    /// `None` or `Some(0)` means unbounded.
    pub fn with_retention(max_pairs: Option<usize>) -> Self {
        Self {
            turns: VecDeque::new(),
            max_pairs: max_pairs.filter(|n| *n > 0),
        }
    }

    pub fn max_turns(&self) -> Option<usize> {
        self.max_pairs.map(|pairs| pairs * 2)
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push_back(Turn::new(role, content));
        if let Some(limit) = self.max_turns() {
            while self.turns.len() > limit {
                self.turns.pop_front();
            }
        }
    }

    /// Replace the content of the trailing assistant turn.
    pub fn update_last(&mut self, content: impl Into<String>) -> Result<(), ChatError> {
        match self.turns.back_mut() {
            None => Err(ChatError::InvalidState("update_last on an empty transcript")),
            Some(turn) if turn.role != Role::Assistant => Err(ChatError::InvalidState(
                "update_last when the last turn is not from the assistant",
            )),
            Some(turn) => {
                turn.content = content.into();
                Ok(())
            }
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_order() {
        let mut transcript = Transcript::new();
        transcript.append(Role::User, "Hi");
        transcript.append(Role::Assistant, "Hello");

        let turns = transcript.snapshot();
        assert_eq!(turns, vec![Turn::user("Hi"), Turn::assistant("Hello")]);
    }

    #[test]
    fn test_retention_keeps_most_recent_turns() {
        let mut transcript = Transcript::with_retention(Some(2));
        for i in 0..9 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            transcript.append(role, format!("turn {}", i));
            assert!(transcript.len() <= 4);
        }

        let contents: Vec<String> = transcript
            .iter()
            .map(|turn| turn.content().to_string())
            .collect();
        assert_eq!(contents, vec!["turn 5", "turn 6", "turn 7", "turn 8"]);
    }

    #[test]
    fn test_zero_retention_is_unbounded() {
        let mut transcript = Transcript::with_retention(Some(0));
        for _ in 0..50 {
            transcript.append(Role::User, "again");
        }
        assert_eq!(transcript.len(), 50);
        assert_eq!(transcript.max_turns(), None);
    }

    #[test]
    fn test_update_last_on_empty_fails() {
        let mut transcript = Transcript::new();
        let result = transcript.update_last("text");
        assert!(matches!(result, Err(ChatError::InvalidState(_))));
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_update_last_requires_assistant_turn() {
        let mut transcript = Transcript::new();
        transcript.append(Role::User, "question");

        let result = transcript.update_last("overwritten");
        assert!(matches!(result, Err(ChatError::InvalidState(_))));
        assert_eq!(transcript.snapshot(), vec![Turn::user("question")]);
    }

    #[test]
    fn test_update_last_fills_placeholder() {
        let mut transcript = Transcript::new();
        transcript.append(Role::User, "question");
        transcript.append(Role::Assistant, "");

        transcript.update_last("answer").unwrap();
        assert_eq!(transcript.last(), Some(&Turn::assistant("answer")));
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn test_clear_empties_everything() {
        let mut transcript = Transcript::with_retention(Some(3));
        transcript.append(Role::User, "a");
        transcript.append(Role::Assistant, "b");
        transcript.clear();

        assert!(transcript.snapshot().is_empty());
        assert_eq!(transcript.max_turns(), Some(6));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Turn::assistant("ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"ok"}"#);
    }
}
