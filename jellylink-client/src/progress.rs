//! FIFO of long-running operations; the head is what a busy indicator shows.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    pub ticket: ProgressTicket,
    pub label: String,
}

#[derive(Debug, Default)]
struct Queue {
    next_id: u64,
    entries: VecDeque<ProgressEntry>,
}

#[derive(Debug, Clone)]
pub struct ProgressQueue {
    queue: Arc<Mutex<Queue>>,
    current: Arc<watch::Sender<Option<ProgressEntry>>>,
}

impl Default for ProgressQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressQueue {
    #[must_use]
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            queue: Arc::new(Mutex::new(Queue::default())),
            current: Arc::new(current),
        }
    }

    pub fn enqueue(&self, label: impl Into<String>) -> ProgressTicket {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = ProgressTicket(queue.next_id);
        queue.next_id += 1;
        queue.entries.push_back(ProgressEntry {
            ticket,
            label: label.into(),
        });
        self.publish_head(&queue);
        ticket
    }

    pub fn done(&self, ticket: ProgressTicket) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.entries.retain(|entry| entry.ticket != ticket);
        self.publish_head(&queue);
    }

    #[must_use]
    pub fn current(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|entry| entry.label.clone())
    }

    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Notified only when the head of the queue changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressEntry>> {
        self.current.subscribe()
    }

    fn publish_head(&self, queue: &Queue) {
        let head = queue.entries.front().cloned();
        self.current.send_if_modified(|current| {
            if *current == head {
                false
            } else {
                *current = head;
                true
            }
        });
    }
}
