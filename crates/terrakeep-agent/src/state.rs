use std::sync::{Mutex, PoisonError, RwLock};

use terrakeep_process::{ChatMessage, ServerMetadata};

use crate::{command_queue::CommandQueue, console::ConsoleBuffer, players::PlayerRegistry};

/// State derived from the server's output. The output reader is the only
/// writer; everything else reads through the locks.
#[derive(Debug)]
pub struct ServerShared {
    pub players: PlayerRegistry,
    pub queue: CommandQueue,
    chat: RwLock<Vec<ChatMessage>>,
    metadata: RwLock<ServerMetadata>,
    console: Mutex<ConsoleBuffer>,
}

pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ServerShared {
    pub fn new(max_commands: usize, console_max_lines: usize) -> Self {
        Self {
            players: PlayerRegistry::default(),
            queue: CommandQueue::new(max_commands),
            chat: RwLock::new(Vec::new()),
            metadata: RwLock::new(ServerMetadata::default()),
            console: Mutex::new(ConsoleBuffer::new(console_max_lines)),
        }
    }

    pub fn push_chat(&self, author: &str, text: &str) {
        let msg = ChatMessage {
            author: author.to_string(),
            text: text.to_string(),
            at_unix_ms: unix_ms(),
        };
        self.chat
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg);
    }

    pub fn chat(&self) -> Vec<ChatMessage> {
        self.chat
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_metadata(&self, f: impl FnOnce(&mut ServerMetadata)) {
        f(&mut self.metadata.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn metadata(&self) -> ServerMetadata {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn record_console(&self, line: impl Into<String>) -> u64 {
        self.console
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_line(line)
    }

    pub fn tail_console(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.console
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tail_after(cursor, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_is_append_only_and_ordered() {
        let s = ServerShared::new(10, 100);
        s.push_chat("Steve", "hi");
        s.push_chat("Alex", "hello");
        let chat = s.chat();
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].author, "Steve");
        assert_eq!(chat[1].text, "hello");
    }

    #[test]
    fn metadata_fields_are_set_independently() {
        let s = ServerShared::new(10, 100);
        s.update_metadata(|m| m.seed = Some("123".to_string()));
        s.update_metadata(|m| m.motd = Some("hi".to_string()));
        let m = s.metadata();
        assert_eq!(m.seed.as_deref(), Some("123"));
        assert_eq!(m.motd.as_deref(), Some("hi"));
        assert_eq!(m.version, None);
    }
}
