//! Stream id bookkeeping of a single connection.
//!
//! Every stream id in `0..max_streams` owns one slot of a fixed arena. A slot
//! moves `Free -> InFlight -> Free` when a response arrives, or
//! `Free -> InFlight -> TimedOutAwaitingDrain -> Free` when the requester gave
//! up before the response came. A draining id is not handed out again until
//! the server answers on it or the connection is torn down, so a late
//! response is never attributed to a newer request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub(crate) type RequestId = u64;

/// Protocol v4 stream ids are non-negative `i16`s.
pub(crate) const MAX_STREAMS_LIMIT: usize = i16::MAX as usize + 1;

enum Slot<H> {
    Free,
    InFlight { request_id: RequestId, handler: H },
    TimedOutAwaitingDrain { since: Instant },
}

/// Outcome of receiving a frame on a given stream.
#[derive(Debug)]
pub(crate) enum StreamLookup<H> {
    /// The stream was in flight; here is whoever waits for the response.
    Handler(H),
    /// The requester had timed out. The stream is free again.
    Drained,
    /// Nothing was sent on this stream. The server violated the protocol.
    Missing,
}

pub(crate) struct StreamTable<H> {
    slots: Box<[Slot<H>]>,
    free_list: Vec<i16>,
    // Orphan notifications carry request ids, not stream ids.
    request_to_stream: HashMap<RequestId, i16>,
    draining: usize,
    draining_gauge: Arc<AtomicUsize>,
}

impl<H> StreamTable<H> {
    pub(crate) fn new(max_streams: usize, draining_gauge: Arc<AtomicUsize>) -> Self {
        let max_streams = max_streams.clamp(1, MAX_STREAMS_LIMIT);
        let slots = (0..max_streams).map(|_| Slot::Free).collect();
        // Lowest ids are handed out first.
        let free_list = (0..max_streams).rev().map(|id| id as i16).collect();
        Self {
            slots,
            free_list,
            request_to_stream: HashMap::new(),
            draining: 0,
            draining_gauge,
        }
    }

    /// Takes a free stream id for `request_id`, or hands the handler back if none is left.
    pub(crate) fn allocate(&mut self, request_id: RequestId, handler: H) -> Result<i16, H> {
        let Some(stream) = self.free_list.pop() else {
            return Err(handler);
        };
        let slot = &mut self.slots[stream as usize];
        debug_assert!(matches!(slot, Slot::Free));
        *slot = Slot::InFlight {
            request_id,
            handler,
        };
        self.request_to_stream.insert(request_id, stream);
        Ok(stream)
    }

    /// Resolves a frame received on `stream`.
    pub(crate) fn complete(&mut self, stream: i16) -> StreamLookup<H> {
        let Some(slot) = usize::try_from(stream)
            .ok()
            .and_then(|idx| self.slots.get_mut(idx))
        else {
            return StreamLookup::Missing;
        };

        match std::mem::replace(slot, Slot::Free) {
            Slot::Free => StreamLookup::Missing,
            Slot::InFlight {
                request_id,
                handler,
            } => {
                self.request_to_stream.remove(&request_id);
                self.free_list.push(stream);
                StreamLookup::Handler(handler)
            }
            Slot::TimedOutAwaitingDrain { .. } => {
                self.draining -= 1;
                self.publish_draining();
                self.free_list.push(stream);
                StreamLookup::Drained
            }
        }
    }

    /// Marks the stream of `request_id` as abandoned by its requester.
    ///
    /// Its handler is dropped, but the id stays reserved until the server answers on it.
    pub(crate) fn orphan(&mut self, request_id: RequestId, now: Instant) {
        let Some(stream) = self.request_to_stream.remove(&request_id) else {
            // Already answered.
            return;
        };
        debug!(
            "Orphaning stream_id = {} associated with request_id = {}",
            stream, request_id
        );
        self.slots[stream as usize] = Slot::TimedOutAwaitingDrain { since: now };
        self.draining += 1;
        self.publish_draining();
    }

    /// Number of draining streams abandoned at least `age` ago.
    pub(crate) fn old_orphans(&self, now: Instant, age: Duration) -> usize {
        if self.draining == 0 {
            return 0;
        }
        self.slots
            .iter()
            .filter(|slot| match slot {
                Slot::TimedOutAwaitingDrain { since } => now.saturating_duration_since(*since) >= age,
                _ => false,
            })
            .count()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.request_to_stream.len()
    }

    pub(crate) fn draining(&self) -> usize {
        self.draining
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Consumes the table after the connection broke. Draining slots need no
    /// handling since no further frame can arrive for them.
    pub(crate) fn into_handlers(self) -> impl Iterator<Item = H> {
        self.draining_gauge.store(0, Ordering::Relaxed);
        self.slots.into_vec().into_iter().filter_map(|slot| match slot {
            Slot::InFlight { handler, .. } => Some(handler),
            _ => None,
        })
    }

    fn publish_draining(&self) {
        self.draining_gauge.store(self.draining, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;

    use super::*;

    fn table(max_streams: usize) -> StreamTable<&'static str> {
        StreamTable::new(max_streams, Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn ids_are_unique_until_exhausted() {
        let mut table = table(8);
        let ids: HashSet<i16> = (0..8)
            .map(|i| table.allocate(i, "h").ok().unwrap())
            .collect();
        assert_eq!(ids.len(), 8);
        assert!(ids.iter().all(|id| (0..8).contains(id)));
        assert_matches!(table.allocate(100, "rejected"), Err("rejected"));
        assert_eq!(table.in_flight(), 8);
    }

    #[test]
    fn completed_id_is_reused() {
        let mut table = table(2);
        let a = table.allocate(1, "a").ok().unwrap();
        let _b = table.allocate(2, "b").ok().unwrap();
        assert_matches!(table.complete(a), StreamLookup::Handler("a"));
        assert_eq!(table.allocate(3, "c").ok(), Some(a));
    }

    #[test]
    fn draining_id_is_not_reused_until_drained() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let mut table = StreamTable::new(2, gauge.clone());
        let now = Instant::now();

        let a = table.allocate(1, "a").ok().unwrap();
        table.orphan(1, now);
        assert_eq!(table.draining(), 1);
        assert_eq!(gauge.load(Ordering::Relaxed), 1);

        let b = table.allocate(2, "b").ok().unwrap();
        assert_ne!(a, b);
        // Only the draining slot is left, and it must not be handed out.
        assert_matches!(table.allocate(3, "c"), Err("c"));

        // The late response frees it.
        assert_matches!(table.complete(a), StreamLookup::Drained);
        assert_eq!(gauge.load(Ordering::Relaxed), 0);
        assert_eq!(table.allocate(4, "d").ok(), Some(a));
    }

    #[test]
    fn frame_for_free_stream_is_missing() {
        let mut table = table(4);
        assert_matches!(table.complete(0), StreamLookup::Missing);
        assert_matches!(table.complete(-5), StreamLookup::Missing);
        assert_matches!(table.complete(1000), StreamLookup::Missing);

        let a = table.allocate(1, "a").ok().unwrap();
        assert_matches!(table.complete(a), StreamLookup::Handler("a"));
        // A duplicated response is a violation too.
        assert_matches!(table.complete(a), StreamLookup::Missing);
    }

    #[test]
    fn late_orphan_notification_is_ignored() {
        let mut table = table(4);
        let a = table.allocate(7, "a").ok().unwrap();
        assert_matches!(table.complete(a), StreamLookup::Handler("a"));
        table.orphan(7, Instant::now());
        assert_eq!(table.draining(), 0);
        assert_matches!(table.complete(a), StreamLookup::Missing);
    }

    #[test]
    fn old_orphans_are_counted_by_age() {
        let mut table = table(8);
        let start = Instant::now();
        for request_id in 0..3 {
            table.allocate(request_id, "x").ok().unwrap();
        }
        table.orphan(0, start);
        table.orphan(1, start + Duration::from_millis(500));
        table.orphan(2, start + Duration::from_secs(2));

        let now = start + Duration::from_secs(2);
        assert_eq!(table.old_orphans(now, Duration::from_secs(1)), 2);
        assert_eq!(table.old_orphans(now, Duration::ZERO), 3);
        assert_eq!(table.old_orphans(start, Duration::from_secs(1)), 0);
    }

    #[test]
    fn teardown_returns_only_in_flight_handlers() {
        let mut table = table(4);
        table.allocate(1, "a").ok().unwrap();
        table.allocate(2, "b").ok().unwrap();
        table.allocate(3, "c").ok().unwrap();
        table.orphan(2, Instant::now());

        let mut handlers: Vec<_> = table.into_handlers().collect();
        handlers.sort_unstable();
        assert_eq!(handlers, vec!["a", "c"]);
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(table(0).capacity(), 1);
        assert_eq!(table(1 << 20).capacity(), MAX_STREAMS_LIMIT);
    }
}
