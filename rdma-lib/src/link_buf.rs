//! Lock-free tracking of a contiguous frontier over out-of-order completions.
//!
//! Producers publish directed links `from -> to` over a monotonic position
//! space. A single consumer walks the chain starting at the tail and moves the
//! tail past every contiguous link, reclaiming the slots it walked over.

use std::{
    fmt::Debug,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

/// Position types a [`LinkBuffer`] can track.
pub trait LinkPosition: Copy + Ord + Debug + Send + Sync {
    fn to_u64(self) -> u64;
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_link_position {
    ($($ty:ty),*) => {
        $(impl LinkPosition for $ty {
            fn to_u64(self) -> u64 {
                self as u64
            }

            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        })*
    };
}

impl_link_position!(u32, u64, usize);

pub struct LinkBuffer<P: LinkPosition> {
    /// Distance to the next position, zero when the slot is empty.
    links: Box<[AtomicU64]>,
    mask: u64,
    tail: AtomicU64,
    _position: PhantomData<P>,
}

impl<P: LinkPosition> LinkBuffer<P> {
    /// Creates a buffer of `capacity` slots with the tail at `start`.
    ///
    /// A zero capacity yields a buffer on which every operation is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is neither zero nor a power of two.
    pub fn new(capacity: usize, start: P) -> Self {
        assert!(
            capacity == 0 || capacity.is_power_of_two(),
            "LinkBuffer capacity must be a power of two, got {capacity}"
        );
        let links = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            links,
            mask: (capacity as u64).wrapping_sub(1),
            tail: AtomicU64::new(start.to_u64()),
            _position: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    pub fn tail(&self) -> P {
        P::from_u64(self.tail.load(Ordering::Acquire))
    }

    /// Moves the tail without walking. Not safe to race with producers.
    pub fn set_tail(&self, position: P) {
        self.tail.store(position.to_u64(), Ordering::Release);
    }

    /// True iff `position` lies less than one capacity ahead of the tail.
    pub fn has_space(&self, position: P) -> bool {
        self.tail.load(Ordering::Acquire) + self.capacity() as u64 > position.to_u64()
    }

    /// Publishes the link `from -> to`.
    ///
    /// The caller must have checked [`LinkBuffer::has_space`] for `to`.
    ///
    /// # Panics
    ///
    /// Panics if `to <= from` or the slot of `from` still holds a link.
    pub fn add_link(&self, from: P, to: P) {
        if self.links.is_empty() {
            return;
        }
        assert!(to > from, "LinkBuffer link must move forward: {from:?} -> {to:?}");
        let distance = to.to_u64() - from.to_u64();
        let slot = &self.links[self.slot(from.to_u64())];
        if let Err(existing) =
            slot.compare_exchange(0, distance, Ordering::Release, Ordering::Relaxed)
        {
            panic!("LinkBuffer slot for {from:?} already links {existing} ahead");
        }
    }

    /// Advances the tail along contiguous links until a missing link or until
    /// `stop(current, next)` is true. Returns whether the tail moved.
    ///
    /// Single consumer only.
    pub fn advance_tail_until(&self, mut stop: impl FnMut(P, P) -> bool) -> bool {
        if self.links.is_empty() {
            return false;
        }
        let begin = self.tail.load(Ordering::Relaxed);
        let mut current = begin;
        loop {
            let slot = &self.links[self.slot(current)];
            let distance = slot.load(Ordering::Acquire);
            if distance == 0 {
                break;
            }
            let next = current + distance;
            if stop(P::from_u64(current), P::from_u64(next)) {
                break;
            }
            slot.store(0, Ordering::Relaxed);
            current = next;
        }
        if current == begin {
            return false;
        }
        self.tail.store(current, Ordering::Release);
        true
    }

    pub fn advance_tail(&self) -> bool {
        self.advance_tail_until(|current, next| next == current)
    }

    /// Asserts that no position in `begin..end` holds a link.
    pub fn validate_no_links_in(&self, begin: P, end: P) {
        let (begin, end) = (begin.to_u64(), end.to_u64());
        let span = end.saturating_sub(begin).min(self.capacity() as u64);
        for position in begin..begin + span {
            let distance = self.links[self.slot(position)].load(Ordering::Acquire);
            assert_eq!(distance, 0, "LinkBuffer position {position} still links {distance} ahead");
        }
    }

    pub fn validate_no_links(&self) {
        for (slot, link) in self.links.iter().enumerate() {
            let distance = link.load(Ordering::Acquire);
            assert_eq!(distance, 0, "LinkBuffer slot {slot} still links {distance} ahead");
        }
    }

    /// Drops every link and moves the tail back to zero. Not safe to race
    /// with producers or the consumer.
    pub fn clear_links(&self) {
        for link in self.links.iter() {
            link.store(0, Ordering::Relaxed);
        }
        self.tail.store(0, Ordering::Release);
    }

    fn slot(&self, position: u64) -> usize {
        (position & self.mask) as usize
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_contiguous_chain_in_any_order() {
        let orders: [[(u64, u64); 3]; 3] = [
            [(0, 2), (2, 5), (5, 8)],
            [(5, 8), (0, 2), (2, 5)],
            [(2, 5), (5, 8), (0, 2)],
        ];
        for order in orders {
            let buf = LinkBuffer::new(8, 0u64);
            for (from, to) in order {
                buf.add_link(from, to);
            }
            assert!(buf.advance_tail());
            assert_eq!(buf.tail(), 8);
            assert!(!buf.advance_tail());
            buf.validate_no_links_in(0, 8);
            buf.validate_no_links();
        }
    }

    #[test]
    fn test_gap_blocks_tail() {
        let buf = LinkBuffer::new(8, 0u32);
        buf.add_link(0, 2);
        buf.add_link(5, 8);
        assert!(buf.advance_tail());
        assert_eq!(buf.tail(), 2);
        assert!(!buf.advance_tail());
        assert!(!buf.advance_tail());
        assert_eq!(buf.tail(), 2);

        buf.add_link(2, 5);
        assert!(buf.advance_tail());
        assert_eq!(buf.tail(), 8);
        buf.validate_no_links();
    }

    #[test]
    fn test_stop_condition() {
        let buf = LinkBuffer::new(16, 0usize);
        buf.add_link(0, 4);
        buf.add_link(4, 6);
        buf.add_link(6, 12);
        assert!(buf.advance_tail_until(|_, next| next > 6));
        assert_eq!(buf.tail(), 6);
        buf.validate_no_links_in(0, 6);
        assert!(buf.advance_tail());
        assert_eq!(buf.tail(), 12);
    }

    #[test]
    fn test_wraparound_reuses_slots() {
        let buf = LinkBuffer::new(8, 0u64);
        for round in 0..10u64 {
            let base = round * 4;
            assert!(buf.has_space(base + 4));
            assert!(buf.has_space(base + 7));
            assert!(!buf.has_space(base + 8));
            buf.add_link(base + 2, base + 4);
            buf.add_link(base, base + 2);
            assert!(buf.advance_tail());
            assert_eq!(buf.tail(), base + 4);
        }
    }

    #[test]
    fn test_clear_and_set_tail() {
        let buf = LinkBuffer::new(8, 0u64);
        buf.add_link(0, 2);
        buf.add_link(2, 5);
        assert!(buf.advance_tail());
        assert_eq!(buf.tail(), 5);
        buf.add_link(6, 7);

        buf.clear_links();
        assert_eq!(buf.tail(), 0);
        buf.validate_no_links();
        assert!(!buf.advance_tail());

        buf.set_tail(3);
        assert!(!buf.advance_tail());
        assert_eq!(buf.tail(), 3);
        buf.add_link(3, 4);
        assert!(buf.advance_tail());
        assert_eq!(buf.tail(), 4);
    }

    #[test]
    fn test_zero_capacity_is_noop() {
        let buf = LinkBuffer::new(0, 0u64);
        buf.add_link(0, 1);
        assert!(!buf.advance_tail());
        buf.validate_no_links();
        assert_eq!(buf.tail(), 0);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        let _ = LinkBuffer::new(6, 0u64);
    }

    #[test]
    #[should_panic(expected = "already links")]
    fn test_duplicate_link_panics() {
        let buf = LinkBuffer::new(8, 0u64);
        buf.add_link(1, 2);
        buf.add_link(1, 3);
    }

    #[test]
    #[should_panic(expected = "still links")]
    fn test_validate_detects_link() {
        let buf = LinkBuffer::new(8, 0u64);
        buf.add_link(4, 6);
        buf.validate_no_links_in(0, 8);
    }

    #[test]
    fn test_concurrent_producers_single_consumer() {
        const PRODUCERS: u64 = 4;
        const SEGMENTS: u64 = 256;
        const SEGMENT: u64 = 2;
        let buf = Arc::new(LinkBuffer::new(1024, 0u64));
        let end = SEGMENTS * SEGMENT;

        let consumer = {
            let buf = buf.clone();
            thread::spawn(move || {
                while buf.tail() < end {
                    buf.advance_tail();
                    std::hint::spin_loop();
                }
            })
        };
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buf = buf.clone();
                thread::spawn(move || {
                    for segment in (p..SEGMENTS).step_by(PRODUCERS as usize) {
                        let from = segment * SEGMENT;
                        assert!(buf.has_space(from + SEGMENT));
                        buf.add_link(from, from + SEGMENT);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        consumer.join().unwrap();
        assert_eq!(buf.tail(), end);
        buf.validate_no_links();
    }
}
