// Fallback typewriter state: characters waiting to be revealed without audio.

use std::collections::VecDeque;
use tokio::task::AbortHandle;

#[derive(Debug, Default)]
pub(crate) struct Typewriter {
    queue: VecDeque<char>,
    running: bool,
    task: Option<AbortHandle>,
}

impl Typewriter {
    /// Queue `text`; returns true when the caller must start the timer.
    pub fn push(&mut self, text: &str) -> bool {
        self.queue.extend(text.chars());
        if self.running || self.queue.is_empty() {
            return false;
        }
        self.running = true;
        true
    }

    /// Next character to reveal. The timer goes idle once the queue drains.
    pub fn pop(&mut self) -> Option<char> {
        let next = self.queue.pop_front();
        if self.queue.is_empty() {
            self.running = false;
            self.task = None;
        }
        next
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_idle(&self) -> bool {
        !self.running && self.queue.is_empty()
    }

    pub fn set_task(&mut self, task: AbortHandle) {
        self.task = Some(task);
    }

    /// Drop queued characters and cancel the timer.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.running = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
