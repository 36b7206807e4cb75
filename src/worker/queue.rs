use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::device::CommandArgs;

/// A command waiting to be executed exactly once by the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub name: String,
    pub args: CommandArgs,
    pub enqueued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: CommandArgs) -> Self {
        Self {
            name: name.into(),
            args,
            enqueued_at: Utc::now(),
        }
    }
}

/// Bounded FIFO with drop-on-full backpressure.
#[derive(Debug)]
pub struct CommandQueue {
    items: VecDeque<Command>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a command, handing it back if the queue is full.
    pub fn push(&mut self, command: Command) -> Result<(), Command> {
        if self.items.len() >= self.capacity {
            return Err(command);
        }
        self.items.push_back(command);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.items.pop_front()
    }

    /// Drop every pending command, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
