use anyhow::Result;

/// Enforcement and messaging primitives of the chat platform. The concrete
/// client lives outside this crate; everything here is specified only at the
/// interface boundary.
pub trait ChatClient: Send + Sync {
    /// Sends a message, returning its id.
    fn send_message(&self, chat_id: i64, text: &str) -> Result<i64>;

    fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    /// Forwards a message to another chat (evidence logging), returning the
    /// forwarded message's id.
    fn forward_message(&self, from_chat_id: i64, to_chat_id: i64, message_id: i64) -> Result<i64>;

    /// Restricts a user in a group until the given timestamp.
    fn restrict_user(&self, chat_id: i64, user_id: i64, until: i64) -> Result<()>;

    fn ban_user(&self, chat_id: i64, user_id: i64) -> Result<()>;
}

/// Client that only logs what it would do. Used by the demo runner and as a
/// stand-in wherever no platform is attached.
pub struct LogClient;

impl ChatClient for LogClient {
    fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        log::info!("[send -> {chat_id}] {text}");
        Ok(0)
    }

    fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        log::info!("[delete] message {message_id} in {chat_id}");
        Ok(())
    }

    fn forward_message(&self, from_chat_id: i64, to_chat_id: i64, message_id: i64) -> Result<i64> {
        log::info!("[forward] message {message_id} from {from_chat_id} to {to_chat_id}");
        Ok(0)
    }

    fn restrict_user(&self, chat_id: i64, user_id: i64, until: i64) -> Result<()> {
        log::info!("[restrict] user {user_id} in {chat_id} until {until}");
        Ok(())
    }

    fn ban_user(&self, chat_id: i64, user_id: i64) -> Result<()> {
        log::info!("[ban] user {user_id} in {chat_id}");
        Ok(())
    }
}
