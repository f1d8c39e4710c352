//! Context-window policies: perishable-budget pruning, image cap, expiry,
//! and middle-omission cropping of oversized text.
//!
//! All three only ever remove messages after index 0, so the system message
//! survives every policy.

use tracing::debug;

use crate::core::conversation::{Conversation, Message};

/// Evict the earliest perishable message while the summed cost of perishable
/// messages exceeds `budget`. Returns the number of messages removed.
pub fn prune_perishable(conversation: &mut Conversation, budget: usize) -> usize {
    let mut removed = 0;
    loop {
        let cost = conversation.cost_where(|message| message.perishable);
        if cost <= budget {
            break;
        }
        let Some(index) = first_index(conversation, |message| message.perishable) else {
            break;
        };
        if let Some(dropped) = conversation.remove(index) {
            debug!(
                dropped_cost = dropped.cost(),
                perishable_cost = cost,
                budget,
                "dropped perishable message"
            );
            removed += 1;
        }
    }
    removed
}

/// Delete the oldest image messages until at most `max_images` remain.
pub fn cap_images(conversation: &mut Conversation, max_images: usize) -> usize {
    let count = conversation
        .messages()
        .iter()
        .skip(1)
        .filter(|message| message.image)
        .count();
    let mut excess = count.saturating_sub(max_images);
    let removed = excess;
    conversation.retain_after_system(|message| {
        if excess > 0 && message.image {
            excess -= 1;
            return false;
        }
        true
    });
    if removed > 0 {
        debug!(removed, max_images, "evicted excess image messages");
    }
    removed
}

/// Decrement every expire counter; remove messages whose counter reaches zero.
pub fn expire(conversation: &mut Conversation) -> usize {
    let before = conversation.len();
    conversation.retain_after_system(|message| match message.expire.as_mut() {
        Some(remaining) => {
            *remaining -= 1;
            *remaining > 0
        }
        None => true,
    });
    before - conversation.len()
}

/// Keep the first and last `limit / 2` chars of `text`, joined by `notice`,
/// when `text` is longer than `limit` chars.
pub fn crop_middle(text: &str, limit: usize, notice: &str) -> String {
    let len = text.chars().count();
    if len <= limit {
        return text.to_string();
    }
    let half = limit / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(len - half).collect();
    format!("{head}\n\n\n\n{notice}\n\n\n\n{tail}")
}

/// Crop execution output to `limit` chars.
pub fn crop_output(output: &str, limit: usize) -> String {
    crop_middle(
        output,
        limit,
        &format!("[CAUTION: MIDDLE OF OUTPUT OMITTED DUE TO THE SIZE LIMIT OF {limit} CHARS]"),
    )
}

fn first_index<F: Fn(&Message) -> bool>(conversation: &Conversation, filter: F) -> Option<usize> {
    conversation
        .messages()
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, message)| filter(message))
        .map(|(index, _)| index)
}
