//! Dialogue history for one session.
//!
//! The context is owned by the session controller; every other stage works
//! from a [`Context::snapshot`], never a live reference.

use parley_types::{Message, Role};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("the system message is seeded once and cannot be appended")]
    DuplicateSystem,

    #[error("a {0} message cannot follow another {0} message")]
    OutOfOrder(Role),
}

/// Position in a context, used to abandon a turn as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextMark(usize);

/// Ordered conversation history. The system message is always first.
#[derive(Debug, Clone)]
pub struct Context {
    messages: Vec<Message>,
}

impl Context {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    /// Appends a message. Roles must alternate after the system message.
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> Result<(), ContextError> {
        if role == Role::System {
            return Err(ContextError::DuplicateSystem);
        }
        if self.messages.last().map(|m| m.role) == Some(role) {
            return Err(ContextError::OutOfOrder(role));
        }
        self.messages.push(Message::new(role, content));
        Ok(())
    }

    /// An owned copy of the full history, in order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn mark(&self) -> ContextMark {
        ContextMark(self.messages.len())
    }

    /// Removes every message appended after `mark`. The system message is
    /// never removed. Returns the number of messages discarded.
    pub fn discard_since(&mut self, mark: ContextMark) -> usize {
        let keep = mark.0.max(1);
        let removed = self.messages.len().saturating_sub(keep);
        self.messages.truncate(keep);
        removed
    }
}
