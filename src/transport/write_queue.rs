use std::collections::VecDeque;

/// Outbound fragments of a connection with at most one write in flight.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    pending: VecDeque<Vec<u8>>,
    in_flight: bool,
}

impl WriteQueue {
    /// Splits `payload` into fragments and returns the one to write right away, if any.
    ///
    /// The first fragment bypasses the queue only when nothing is in flight, nothing is
    /// queued and the profile allows a write. Every other fragment is queued in order.
    pub(crate) fn submit(
        &mut self,
        payload: &[u8],
        payload_size: usize,
        can_write: bool,
    ) -> Option<Vec<u8>> {
        let mut fragments = fragment(payload, payload_size);
        let first = fragments.next()?;
        let immediate = if !self.in_flight && self.pending.is_empty() && can_write {
            self.in_flight = true;
            Some(first.to_vec())
        } else {
            self.pending.push_back(first.to_vec());
            None
        };
        self.pending.extend(fragments.map(<[u8]>::to_vec));
        immediate
    }

    /// Marks the in-flight write as complete and releases the next fragment.
    pub(crate) fn complete(&mut self, can_write: bool) -> Option<Vec<u8>> {
        if can_write && let Some(next) = self.pending.pop_front() {
            self.in_flight = true;
            return Some(next);
        }
        self.in_flight = false;
        None
    }

    /// Restarts an idle queue after the profile regained permission to write.
    pub(crate) fn resume(&mut self, can_write: bool) -> Option<Vec<u8>> {
        if self.in_flight || self.pending.is_empty() {
            return None;
        }
        self.complete(can_write)
    }

    /// Drops every queued fragment.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = false;
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Splits a payload into chunks of at most `payload_size` bytes.
pub(crate) fn fragment(payload: &[u8], payload_size: usize) -> std::slice::Chunks<'_, u8> {
    payload.chunks(payload_size.max(1))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[test]
    fn submit_sends_first_fragment_and_queues_the_rest() {
        let mut queue = WriteQueue::default();

        let first = queue.submit(b"AT\r\n", 3, true);

        assert_eq!(Some(b"AT\r".to_vec()), first);
        assert!(queue.is_in_flight());
        assert_eq!(1, queue.pending_len());
        assert_eq!(Some(b"\n".to_vec()), queue.complete(true));
        assert_eq!(None, queue.complete(true));
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn submit_while_in_flight_queues_everything() {
        let mut queue = WriteQueue::default();
        queue.submit(b"ab", 20, true);

        assert_eq!(None, queue.submit(b"cd", 20, true));
        assert_eq!(Some(b"cd".to_vec()), queue.complete(true));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn empty_payload_is_ignored(#[case] can_write: bool) {
        let mut queue = WriteQueue::default();

        assert_eq!(None, queue.submit(b"", 20, can_write));
        assert_eq!(0, queue.pending_len());
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn blocked_queue_waits_for_resume() {
        let mut queue = WriteQueue::default();

        assert_eq!(None, queue.submit(b"hello", 2, false));
        assert_eq!(3, queue.pending_len());
        assert_eq!(None, queue.resume(false));
        assert_eq!(Some(b"he".to_vec()), queue.resume(true));
        assert_eq!(None, queue.resume(true));
    }

    #[test]
    fn complete_without_permission_goes_idle() {
        let mut queue = WriteQueue::default();
        queue.submit(b"abcd", 2, true);

        assert_eq!(None, queue.complete(false));
        assert!(!queue.is_in_flight());
        assert_eq!(1, queue.pending_len());
    }

    #[test]
    fn clear_drops_pending_fragments() {
        let mut queue = WriteQueue::default();
        queue.submit(b"abcdef", 2, true);

        queue.clear();

        assert_eq!(0, queue.pending_len());
        assert_eq!(None, queue.complete(true));
    }

    proptest! {
        #[test]
        fn fragments_reassemble_in_order(
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            payload_size in 1usize..64,
        ) {
            let fragments: Vec<&[u8]> = fragment(&payload, payload_size).collect();

            prop_assert!(fragments.iter().all(|chunk| !chunk.is_empty() && chunk.len() <= payload_size));
            prop_assert_eq!(payload.clone(), fragments.concat());
        }

        #[test]
        fn queue_delivers_submitted_bytes_in_order(
            writes in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 1..8),
            payload_size in 1usize..16,
        ) {
            let mut queue = WriteQueue::default();
            let mut delivered = Vec::new();
            for write in &writes {
                if let Some(chunk) = queue.submit(write, payload_size, true) {
                    delivered.push(chunk);
                }
            }
            if !queue.is_in_flight() {
                prop_assert_eq!(0, queue.pending_len());
            }
            while queue.is_in_flight() {
                if let Some(chunk) = queue.complete(true) {
                    delivered.push(chunk);
                }
            }

            prop_assert_eq!(writes.concat(), delivered.concat());
        }
    }
}
