//! Storage channels and bot credentials.

use serde::{Deserialize, Serialize};

/// A storage channel owned by a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: i64,
    pub channel_name: String,
    pub user_id: i64,
    /// At most one channel per user is selected for new uploads.
    pub selected: bool,
}

/// A worker credential assigned to a user's channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bot {
    pub token: String,
    pub user_id: i64,
    pub bot_id: i64,
    pub channel_id: i64,
}

/// Extract the numeric bot id from a `"<botId>:<secret>"` token.
pub fn bot_id_from_token(token: &str) -> Option<i64> {
    let (id, secret) = token.split_once(':')?;
    if secret.is_empty() {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_id_from_token() {
        assert_eq!(bot_id_from_token("12345:abc"), Some(12345));
        assert_eq!(bot_id_from_token("12345:"), None);
        assert_eq!(bot_id_from_token("nope"), None);
        assert_eq!(bot_id_from_token("x:abc"), None);
    }
}
