use gantry_core::message::Message;
use indexmap::IndexMap;
use uuid::Uuid;

/// Ordered message history the loop reads and appends. Messages produced in
/// one iteration are appended before the next iteration snapshots history.
pub trait Thread: Send {
    fn append(&mut self, message: Message);

    /// Ordered message list at the current point.
    fn snapshot(&self) -> Vec<Message>;

    /// Save a branch point covering messages `0..=after_index`.
    fn create_checkpoint(&mut self, after_index: usize) -> String;
}

/// In-memory thread with checkpoints and branches.
pub struct InMemoryThread {
    messages: Vec<Message>,
    /// checkpoint id → number of messages captured
    checkpoints: IndexMap<String, usize>,
}

impl InMemoryThread {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            checkpoints: IndexMap::new(),
        }
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            checkpoints: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Start a new thread from a saved checkpoint. The branch carries the
    /// checkpointed prefix and no checkpoints of its own.
    pub fn branch(&self, checkpoint_id: &str) -> Option<InMemoryThread> {
        let &count = self.checkpoints.get(checkpoint_id)?;
        Some(InMemoryThread::with_messages(
            self.messages[..count].to_vec(),
        ))
    }
}

impl Default for InMemoryThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Thread for InMemoryThread {
    fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    fn create_checkpoint(&mut self, after_index: usize) -> String {
        let count = (after_index + 1).min(self.messages.len());
        let id = Uuid::new_v4().to_string();
        self.checkpoints.insert(id.clone(), count);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_snapshot() {
        let mut thread = InMemoryThread::new();
        thread.append(Message::user("one"));
        thread.append(Message::user("two"));

        let snapshot = thread.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].text(), "one");
        assert_eq!(snapshot[1].text(), "two");
    }

    #[test]
    fn branch_carries_the_checkpointed_prefix() {
        let mut thread = InMemoryThread::new();
        thread.append(Message::user("one"));
        thread.append(Message::user("two"));
        let checkpoint = thread.create_checkpoint(0);
        thread.append(Message::user("three"));

        let branch = thread.branch(&checkpoint).unwrap();
        assert_eq!(branch.len(), 1);
        assert_eq!(branch.messages()[0].text(), "one");
        // The original is untouched.
        assert_eq!(thread.len(), 3);
    }

    #[test]
    fn unknown_checkpoint_yields_no_branch() {
        let thread = InMemoryThread::new();
        assert!(thread.branch("nope").is_none());
    }

    #[test]
    fn checkpoint_index_is_clamped() {
        let mut thread = InMemoryThread::new();
        thread.append(Message::user("only"));
        let checkpoint = thread.create_checkpoint(99);
        assert_eq!(thread.branch(&checkpoint).unwrap().len(), 1);
    }
}
