use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use super::{EngineError, require_capacity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    Delivered,
    /// No room in the stream. Counted, never escalated.
    Dropped,
}

/// Bounded lossy channel of completed measurements.
///
/// Producers never wait: a full stream drops the new record. Records from
/// one producer arrive in submission order; records from different producers
/// interleave arbitrarily, so consumers that need global order sort by the
/// embedded timestamps.
pub struct EventStream<T> {
    queue: Arc<ArrayQueue<T>>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            delivered: Arc::clone(&self.delivered),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> EventStream<T> {
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        require_capacity("event stream", capacity)?;
        Ok(Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            delivered: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn emit(&self, record: T) -> Emit {
        match self.queue.push(record) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Emit::Delivered
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Emit::Dropped
            }
        }
    }

    pub fn try_next(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Moves up to `max` records into `out`, returning how many moved.
    pub fn drain_into(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            let Some(record) = self.queue.pop() else {
                break;
            };
            out.push(record);
            moved += 1;
        }
        moved
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifth_emit_into_four_slots_drops() {
        let stream = EventStream::new(4).unwrap();
        let results: Vec<Emit> = (0..5).map(|i| stream.emit(i)).collect();
        assert_eq!(&results[..4], &[Emit::Delivered; 4]);
        assert_eq!(results[4], Emit::Dropped);
        assert_eq!(stream.dropped(), 1);
        assert_eq!(stream.delivered(), 4);

        let mut out = Vec::new();
        assert_eq!(stream.drain_into(&mut out, 16), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn draining_makes_room_again() {
        let stream = EventStream::new(1).unwrap();
        assert_eq!(stream.emit("a"), Emit::Delivered);
        assert_eq!(stream.emit("b"), Emit::Dropped);
        assert_eq!(stream.try_next(), Some("a"));
        assert_eq!(stream.emit("c"), Emit::Delivered);
        assert_eq!(stream.try_next(), Some("c"));
        assert!(stream.is_empty());
    }

    #[test]
    fn per_producer_order_is_kept() {
        let stream = EventStream::new(4096).unwrap();
        std::thread::scope(|s| {
            for producer in 0..4u64 {
                let stream = stream.clone();
                s.spawn(move || {
                    for seq in 0..500u64 {
                        stream.emit((producer, seq));
                    }
                });
            }
        });
        let mut last = [None::<u64>; 4];
        while let Some((producer, seq)) = stream.try_next() {
            let prev = &mut last[producer as usize];
            assert!(prev.is_none_or(|p| p < seq));
            *prev = Some(seq);
        }
        assert!(last.iter().all(|s| *s == Some(499)));
    }

    #[test]
    fn zero_capacity_is_an_error() {
        assert!(EventStream::<u8>::new(0).is_err());
    }
}
