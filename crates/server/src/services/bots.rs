//! Round-robin bot selection.
//!
//! Each `(operation, user)` pair keeps its own counter so streams and uploads
//! rotate independently. With `stream.shared_bot_counter` the counter lives in
//! the metadata store and every instance sharing the database rotates through
//! the same sequence; otherwise a process-local map is used.

use crate::error::ApiResult;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use teldrive_metadata::MetadataStore;

/// Work a bot is selected for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BotOp {
    Stream,
    Upload,
}

impl BotOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotOp::Stream => "stream",
            BotOp::Upload => "upload",
        }
    }
}

impl fmt::Display for BotOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Counter {
    Local(Mutex<HashMap<(BotOp, i64), usize>>),
    Shared(Arc<dyn MetadataStore>),
}

/// Picks the next bot token for an operation.
pub struct BotSelector {
    counter: Counter,
}

impl BotSelector {
    pub fn local() -> Self {
        Self {
            counter: Counter::Local(Mutex::new(HashMap::new())),
        }
    }

    pub fn shared(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            counter: Counter::Shared(metadata),
        }
    }

    /// Next `(token, index)` for `op`. `tokens` must not be empty.
    pub async fn next(
        &self,
        op: BotOp,
        user_id: i64,
        tokens: &[String],
    ) -> ApiResult<(String, usize)> {
        if tokens.is_empty() {
            return Err(crate::error::ApiError::Internal(
                "bot selection with no tokens".to_string(),
            ));
        }
        let index = match &self.counter {
            Counter::Local(map) => {
                let mut map = map.lock().unwrap_or_else(|p| p.into_inner());
                let slot = map.entry((op, user_id)).or_insert(0);
                let index = *slot % tokens.len();
                *slot = slot.wrapping_add(1);
                index
            }
            Counter::Shared(metadata) => {
                let value = metadata
                    .next_counter(&format!("{op}:{user_id}"))
                    .await?;
                // The stored counter starts at 1.
                (value.saturating_sub(1).max(0) as usize) % tokens.len()
            }
        };
        Ok((tokens[index].clone(), index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}:secret", 100 + i)).collect()
    }

    #[tokio::test]
    async fn test_local_round_robin() {
        let selector = BotSelector::local();
        let tokens = tokens(3);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(selector.next(BotOp::Stream, 1, &tokens).await.unwrap().1);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_operations_rotate_independently() {
        let selector = BotSelector::local();
        let tokens = tokens(2);
        assert_eq!(selector.next(BotOp::Stream, 1, &tokens).await.unwrap().1, 0);
        assert_eq!(selector.next(BotOp::Stream, 1, &tokens).await.unwrap().1, 1);
        assert_eq!(selector.next(BotOp::Upload, 1, &tokens).await.unwrap().1, 0);
        assert_eq!(selector.next(BotOp::Stream, 2, &tokens).await.unwrap().1, 0);
    }

    #[tokio::test]
    async fn test_fairness_over_window() {
        let selector = BotSelector::local();
        let tokens = tokens(3);
        let mut counts = [0usize; 3];
        for _ in 0..100 {
            counts[selector.next(BotOp::Stream, 9, &tokens).await.unwrap().1] += 1;
        }
        let bound = 100usize.div_ceil(3) + 1;
        assert!(counts.iter().all(|c| *c <= bound), "{counts:?}");
    }

    #[tokio::test]
    async fn test_empty_tokens_is_an_error() {
        let selector = BotSelector::local();
        assert!(selector.next(BotOp::Stream, 1, &[]).await.is_err());
    }
}
