//! Bounded buffer of recently dispatched messages
//!
//! The bus keeps one of these so that consumers joining with the replay
//! option can be caught up on recent history. Old entries fall off the front
//! once capacity is reached.

use std::collections::VecDeque;

use weft_message::Message;

pub(crate) struct MsgBuffer {
    capacity: usize,
    entries: VecDeque<Message>,
}

impl MsgBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, msg: Message) {
        if self.capacity == 0 {
            return;
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }

        self.entries.push_back(msg);
    }

    /// Buffered messages, oldest first
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
