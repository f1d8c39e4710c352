//! Conversation model: messages, roles, multimodal content, and cost accounting.

use serde::{Deserialize, Serialize};

/// Fixed cost charged for each image part when measuring context size.
pub const IMAGE_PART_COST: usize = 765;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Context cost of the content alone: characters of text, plus
    /// [`IMAGE_PART_COST`] per image part.
    pub fn cost(&self) -> usize {
        match self {
            Content::Text(text) => text.chars().count(),
            Content::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ImageUrl { .. } => IMAGE_PART_COST,
                })
                .sum(),
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A conversation entry plus the bookkeeping flags the context window uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    /// Eligible for eviction under perishable-budget pressure.
    #[serde(default)]
    pub perishable: bool,
    /// Remaining completed cycles before automatic removal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<i32>,
    #[serde(default)]
    pub image: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(content.into()),
            perishable: false,
            expire: None,
            image: false,
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

    pub fn perishable(mut self) -> Self {
        self.perishable = true;
        self
    }

    pub fn expiring(mut self, cycles: i32) -> Self {
        self.expire = Some(cycles);
        self
    }

    /// Cost of the message: content cost plus the length of the role tag.
    pub fn cost(&self) -> usize {
        self.content.cost() + self.role.as_str().len()
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// The wire shape sent to the model: role and content only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
}

/// Ordered message history whose index 0 is always the system message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    /// Rebuild a conversation from stored messages.
    ///
    /// Returns `None` unless the first message exists and has role `system`.
    pub fn from_messages(messages: Vec<Message>) -> Option<Self> {
        match messages.first() {
            Some(first) if first.role == Role::System => Some(Self { messages }),
            _ => None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system(&self) -> &Message {
        &self.messages[0]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// Insert messages directly after the system message, preserving their order.
    pub fn insert_after_system(&mut self, messages: impl IntoIterator<Item = Message>) {
        let tail = self.messages.split_off(1);
        self.messages.extend(messages);
        self.messages.extend(tail);
    }

    /// Remove the message at `index`. Index 0 is never removed.
    pub fn remove(&mut self, index: usize) -> Option<Message> {
        if index == 0 || index >= self.messages.len() {
            return None;
        }
        Some(self.messages.remove(index))
    }

    /// Keep only the messages after index 0 for which `keep` returns true.
    pub fn retain_after_system<F: FnMut(&mut Message) -> bool>(&mut self, mut keep: F) {
        let mut index = 0;
        self.messages.retain_mut(|message| {
            let first = index == 0;
            index += 1;
            first || keep(message)
        });
    }

    /// Drop everything except the system message.
    pub fn reset(&mut self) {
        self.messages.truncate(1);
    }

    /// Summed cost of the messages matching `filter`.
    pub fn cost_where<F: Fn(&Message) -> bool>(&self, filter: F) -> usize {
        self.messages
            .iter()
            .filter(|message| filter(message))
            .map(Message::cost)
            .sum()
    }

    pub fn total_cost(&self) -> usize {
        self.cost_where(|_| true)
    }

    pub fn to_chat(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_chat).collect()
    }
}
