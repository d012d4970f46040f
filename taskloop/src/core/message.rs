//! Conversation messages exchanged with the completion service.

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in the conversation: a role plus ordered text segments.
///
/// Messages are append-only; once pushed into a session history they are
/// never edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<String>,
}

impl Message {
    pub fn new(role: Role, content: Vec<String>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![text.into()])
    }

    pub fn user(segments: Vec<String>) -> Self {
        Self::new(Role::User, segments)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![text.into()])
    }

    /// All segments joined by blank lines.
    pub fn text(&self) -> String {
        self.content.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_joins_segments_in_order() {
        let msg = Message::user(vec!["[read_file] Result:".to_string(), "body".to_string()]);
        assert_eq!(msg.text(), "[read_file] Result:\n\nbody");
        assert_eq!(msg.role.as_str(), "user");
    }
}
