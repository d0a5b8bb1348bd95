use std::collections::VecDeque;
use std::hash::Hash;
use rustc_hash::FxHashSet;

/// FIFO queue that holds each element at most once. Pushing an element that is already queued
///  leaves its position unchanged.
#[derive(Debug)]
pub struct UniqueQueue<T> {
    queue: VecDeque<T>,
    members: FxHashSet<T>,
}

impl<T: Hash + Eq + Clone> Default for UniqueQueue<T> {
    fn default() -> Self {
        UniqueQueue::new()
    }
}

impl<T: Hash + Eq + Clone> UniqueQueue<T> {
    pub fn new() -> UniqueQueue<T> {
        UniqueQueue {
            queue: VecDeque::new(),
            members: FxHashSet::default(),
        }
    }

    /// returns false if the element was queued already
    pub fn push_back(&mut self, value: T) -> bool {
        if !self.members.insert(value.clone()) {
            return false;
        }
        self.queue.push_back(value);
        true
    }

    pub fn front(&self) -> Option<&T> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let result = self.queue.pop_front()?;
        self.members.remove(&result);
        Some(result)
    }

    #[cfg(test)]
    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
