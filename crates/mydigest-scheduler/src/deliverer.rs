//! Chunked digest delivery.
//!
//! Telegram caps a message at 4096 bytes of text. Long digests are cut into
//! contiguous slices, preferring boundaries where no HTML span is open, then
//! prefixed with `(i/n)` and sent in order.

use std::sync::Arc;
use std::time::Duration;

use mydigest_core::{DeliveryTransport, DigestError, Result, SendOutcome, UserId};

/// Bytes kept free in each chunk for the `(i/n)\n` part marker.
pub const PART_PREFIX_RESERVE: usize = 16;

pub struct DigestDeliverer {
    transport: Arc<dyn DeliveryTransport>,
    max_len: usize,
    pacing: Duration,
}

impl DigestDeliverer {
    pub fn new(transport: Arc<dyn DeliveryTransport>, max_len: usize, pacing: Duration) -> Self {
        Self {
            transport,
            max_len: max_len.max(PART_PREFIX_RESERVE + 1),
            pacing,
        }
    }

    /// Send `text` to `user_id`, returning the number of messages sent.
    ///
    /// A recipient that is gone for good yields
    /// [`DigestError::RecipientUnreachable`]; any other refusal stops the
    /// remaining chunks and yields [`DigestError::Delivery`].
    pub async fn deliver(&self, user_id: UserId, text: &str) -> Result<usize> {
        if text.trim().is_empty() {
            tracing::debug!(user_id, "Empty digest, nothing to deliver");
            return Ok(0);
        }

        let chunks = split_digest(text, self.max_len);
        let total = chunks.len();
        for (idx, chunk) in chunks.iter().enumerate() {
            if idx > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            let body = if total > 1 {
                format!("({}/{})\n{}", idx + 1, total, chunk)
            } else {
                (*chunk).to_string()
            };

            match self.transport.send(user_id, &body).await? {
                SendOutcome::Sent => {}
                SendOutcome::Unreachable(reason) => {
                    return Err(DigestError::RecipientUnreachable { user_id, reason });
                }
                SendOutcome::Failed(reason) => {
                    return Err(DigestError::Delivery(format!(
                        "part {}/{} via {}: {reason}",
                        idx + 1,
                        total,
                        self.transport.name()
                    )));
                }
            }
        }

        tracing::info!(user_id, parts = total, "📨 Digest delivered");
        Ok(total)
    }
}

/// Cut `text` into slices that each fit in one message.
///
/// Concatenating the result gives back `text` byte for byte.
pub fn split_digest(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }
    let budget = max_len.saturating_sub(PART_PREFIX_RESERVE).max(1);

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > budget {
        let cut = cut_point(rest, budget);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Byte offset in `1..=budget` at which to end the next chunk.
fn cut_point(text: &str, budget: usize) -> usize {
    let hard = floor_boundary(text, budget);
    let window = &text[..hard];

    let mut in_tag = false;
    let mut closing = false;
    let mut depth = 0usize;
    let mut prev = '\0';

    let mut structural = None;
    let mut whitespace = None;
    let mut outside_tag = None;

    for (i, c) in window.char_indices() {
        if !in_tag && i > 0 {
            outside_tag = Some(i);
        }
        let end = i + c.len_utf8();
        match c {
            '<' if !in_tag => {
                in_tag = true;
                closing = window[end..].starts_with('/');
            }
            '>' if in_tag => {
                in_tag = false;
                if closing {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        structural = Some(end);
                    }
                } else if prev != '/' {
                    depth += 1;
                }
            }
            '\n' if !in_tag && depth == 0 => structural = Some(end),
            c if c.is_whitespace() && !in_tag && depth == 0 => whitespace = Some(end),
            _ => {}
        }
        prev = c;
    }
    if !in_tag {
        outside_tag = Some(hard);
    }

    structural
        .or(whitespace)
        .or(outside_tag)
        .filter(|&cut| cut > 0)
        .unwrap_or_else(|| hard.max(first_char_len(text)))
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn first_char_len(text: &str) -> usize {
    text.chars().next().map_or(text.len(), char::len_utf8)
}
