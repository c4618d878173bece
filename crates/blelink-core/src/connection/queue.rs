use std::collections::VecDeque;

use crate::request::{Request, RequestKind};

/// Pending requests, highest priority first, FIFO within a priority.
#[derive(Debug, Default)]
pub(super) struct RequestQueue {
    entries: VecDeque<Request>,
}

impl RequestQueue {
    /// Insert after every entry with priority greater than or equal to
    /// `request`'s.
    pub(super) fn push(&mut self, request: Request) {
        let position = self
            .entries
            .iter()
            .position(|queued| queued.priority() < request.priority())
            .unwrap_or(self.entries.len());
        self.entries.insert(position, request);
    }

    /// Put a request back at the head, ahead of everything.
    pub(super) fn push_front(&mut self, request: Request) {
        self.entries.push_front(request);
    }

    pub(super) fn pop(&mut self) -> Option<Request> {
        self.entries.pop_front()
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn drain(&mut self) -> Vec<Request> {
        self.entries.drain(..).collect()
    }

    /// Remove every request of `kind`, or all of them for `None`.
    pub(super) fn remove(&mut self, kind: Option<RequestKind>) -> Vec<Request> {
        let Some(kind) = kind else {
            return self.drain();
        };
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|r| r.kind() == kind);
        self.entries = kept.into();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestBuilder;

    fn tagged(tag: &str, priority: i32) -> Request {
        RequestBuilder::read_rssi()
            .tag(tag)
            .priority(priority)
            .build()
            .unwrap()
    }

    fn tags(queue: &mut RequestQueue) -> Vec<String> {
        queue
            .drain()
            .iter()
            .map(|r| r.tag().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let mut queue = RequestQueue::default();
        queue.push(tagged("a", 0));
        queue.push(tagged("b", 0));
        queue.push(tagged("c", 0));
        assert_eq!(tags(&mut queue), ["a", "b", "c"]);
    }

    #[test]
    fn test_higher_priority_jumps_ahead() {
        let mut queue = RequestQueue::default();
        queue.push(tagged("app-1", 0));
        queue.push(tagged("app-2", 0));
        queue.push(tagged("boot-1", i32::MAX));
        queue.push(tagged("boot-2", i32::MAX));
        queue.push(tagged("mid", 5));
        assert_eq!(tags(&mut queue), ["boot-1", "boot-2", "mid", "app-1", "app-2"]);
    }

    #[test]
    fn test_push_front_and_pop() {
        let mut queue = RequestQueue::default();
        queue.push(tagged("a", 10));
        queue.push_front(tagged("retry", 0));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().tag(), Some("retry"));
        assert_eq!(queue.pop().unwrap().tag(), Some("a"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_remove_by_kind() {
        let mut queue = RequestQueue::default();
        queue.push(tagged("rssi", 0));
        queue.push(RequestBuilder::change_mtu(247).tag("mtu").build().unwrap());
        queue.push(tagged("rssi-2", 0));

        let removed = queue.remove(Some(RequestKind::ReadRssi));
        assert_eq!(removed.len(), 2);
        assert_eq!(tags(&mut queue), ["mtu"]);
    }
}
