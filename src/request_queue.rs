/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! FIFO of pending client payloads. Payloads are opaque byte strings; the
//! queue never inspects them. The leader's request monitor drains it in
//! batches, and the whole queue is persisted at the persist-all level so a
//! crashed leader does not silently drop accepted requests.

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
pub struct RequestQueue(Mutex<VecDeque<Vec<u8>>>);

impl RequestQueue {
    pub fn new() -> RequestQueue {
        RequestQueue::default()
    }

    pub fn append(&self, request: Vec<u8>) {
        self.0.lock().unwrap().push_back(request);
    }

    pub fn append_batch(&self, requests: Vec<Vec<u8>>) {
        let mut queue = self.0.lock().unwrap();
        for request in requests {
            queue.push_back(request);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Atomically takes up to `max_len` requests off the front of the queue.
    pub fn grab_with_max_len_and_clear(&self, max_len: usize) -> Vec<Vec<u8>> {
        let mut queue = self.0.lock().unwrap();
        let take = max_len.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Snapshot for persistence: the queue is stored as a plain vector of
    /// payloads.
    pub fn to_vec(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().iter().cloned().collect()
    }

    pub fn restore(&self, requests: Vec<Vec<u8>>) {
        *self.0.lock().unwrap() = requests.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_takes_at_most_max_len_in_order() {
        let queue = RequestQueue::new();
        queue.append(b"r1".to_vec());
        queue.append_batch(vec![b"r2".to_vec(), b"r3".to_vec()]);

        let batch = queue.grab_with_max_len_and_clear(2);
        assert_eq!(batch, vec![b"r1".to_vec(), b"r2".to_vec()]);
        assert_eq!(queue.len(), 1);

        let rest = queue.grab_with_max_len_and_clear(10);
        assert_eq!(rest, vec![b"r3".to_vec()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let queue = RequestQueue::new();
        queue.append(b"a".to_vec());
        queue.append(b"b".to_vec());

        let restored = RequestQueue::new();
        restored.restore(queue.to_vec());
        assert_eq!(restored.to_vec(), queue.to_vec());
        assert_eq!(restored.len(), 2);
    }
}
