//! Packed bit-set over the event space.
//!
//! Sets are sized once, at program-load time, to `ceil(num_events / 64)`
//! words and never grow afterward. The event space is fixed by the compiled
//! program. This is the "~10% of the core" utility the executor layers the
//! deferred-set and actions-set semantics on top of.

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-size, bit-packed subset of the event id space.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventSet {
    words: Vec<u64>,
    num_events: u32,
}

impl EventSet {
    /// Creates an empty set sized to hold ids in `0..num_events`.
    pub fn empty(num_events: u32) -> Self {
        let word_count = (num_events as usize).div_ceil(WORD_BITS);
        Self {
            words: vec![0u64; word_count],
            num_events,
        }
    }

    /// Builds a set from an explicit list of member event ids.
    pub fn from_events(num_events: u32, events: impl IntoIterator<Item = u32>) -> Self {
        let mut set = Self::empty(num_events);
        for event in events {
            set.insert(event);
        }
        set
    }

    pub fn num_events(&self) -> u32 {
        self.num_events
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    fn locate(event: u32) -> (usize, u32) {
        (event as usize / WORD_BITS, event % WORD_BITS as u32)
    }

    /// `O(1)` membership test.
    pub fn member(&self, event: u32) -> bool {
        let (word, bit) = Self::locate(event);
        match self.words.get(word) {
            Some(w) => (w >> bit) & 1 != 0,
            None => false,
        }
    }

    pub fn insert(&mut self, event: u32) {
        let (word, bit) = Self::locate(event);
        if let Some(w) = self.words.get_mut(word) {
            *w |= 1 << bit;
        }
    }

    /// Deep-clones the set; stack frames call this when snapshotting the
    /// inherited deferred/actions sets on push.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// `dst = a | b`, bitwise. Panics if the sets are not the same size,
    /// which can only happen across two different programs.
    pub fn union_into(dst: &mut Self, a: &Self, b: &Self) {
        assert_eq!(a.words.len(), b.words.len());
        dst.words.resize(a.words.len(), 0);
        dst.num_events = a.num_events;
        for i in 0..a.words.len() {
            dst.words[i] = a.words[i] | b.words[i];
        }
    }

    /// `dst = a & !b`, bitwise. Used to subtract the current state's own
    /// transition set out of the inherited actions set.
    pub fn difference_into(dst: &mut Self, a: &Self, b: &Self) {
        assert_eq!(a.words.len(), b.words.len());
        dst.words.resize(a.words.len(), 0);
        dst.num_events = a.num_events;
        for i in 0..a.words.len() {
            dst.words[i] = a.words[i] & !b.words[i];
        }
    }

    pub fn union(a: &Self, b: &Self) -> Self {
        let mut dst = Self::empty(a.num_events);
        Self::union_into(&mut dst, a, b);
        dst
    }

    pub fn difference(a: &Self, b: &Self) -> Self {
        let mut dst = Self::empty(a.num_events);
        Self::difference_into(&mut dst, a, b);
        dst
    }
}
