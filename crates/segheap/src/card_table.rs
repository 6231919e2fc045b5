//! Per-segment card table.
//!
//! A segment is divided into [`CARD_SIZE`]-byte cards. The write barrier
//! dirties the card holding a slot whenever an old generation slot may have
//! been made to point into the nursery, so a young collection only scans
//! dirty cards instead of the whole old generation.
//!
//! The table also records, for every card, the start of the object that
//! covers the card's first byte. Card scanning uses this to find where to
//! start walking objects in a dirty run.

/// Log2 of [`CARD_SIZE`].
pub const LOG_CARD_SIZE: usize = 9;

/// Bytes covered by one card.
pub const CARD_SIZE: usize = 1 << LOG_CARD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum CardStatus {
    Clean = 0,
    Dirty = 1,
}

/// Dirty bytes and object boundaries for one segment.
///
/// Addresses are plain integers here; the table never dereferences them.
pub struct CardTable {
    base: usize,
    cards: Box<[CardStatus]>,
    /// Start offset (from `base`) of the object covering each card's start.
    /// Valid below `boundary`.
    first_obj: Box<[u32]>,
    /// Index of the next card whose covering object is not yet recorded.
    boundary: usize,
}

impl CardTable {
    /// Create a clean table for `[base, base + size)`.
    #[must_use]
    pub fn new(base: usize, size: usize) -> Self {
        let num_cards = size.div_ceil(CARD_SIZE);
        Self {
            base,
            cards: vec![CardStatus::Clean; num_cards].into_boxed_slice(),
            first_obj: vec![0; num_cards].into_boxed_slice(),
            boundary: 0,
        }
    }

    /// Number of cards in the table.
    #[must_use]
    pub fn num_cards(&self) -> usize {
        self.cards.len()
    }

    #[inline]
    #[must_use]
    pub fn address_to_index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.base, "address below the covered segment");
        (addr - self.base) >> LOG_CARD_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn index_to_address(&self, index: usize) -> usize {
        self.base + (index << LOG_CARD_SIZE)
    }

    /// Write barrier entry point.
    #[inline]
    pub fn dirty_card_for_address(&mut self, addr: usize) {
        let index = self.address_to_index(addr);
        self.cards[index] = CardStatus::Dirty;
    }

    #[inline]
    #[must_use]
    pub fn is_card_for_address_dirty(&self, addr: usize) -> bool {
        self.is_card_for_index_dirty(self.address_to_index(addr))
    }

    #[inline]
    #[must_use]
    pub fn is_card_for_index_dirty(&self, index: usize) -> bool {
        self.cards[index] == CardStatus::Dirty
    }

    /// First dirty card in `[from, to)`.
    #[must_use]
    pub fn find_next_dirty_card(&self, from: usize, to: usize) -> Option<usize> {
        self.find_next_card_with_status(from, to, CardStatus::Dirty)
    }

    /// First clean card in `[from, to)`.
    #[must_use]
    pub fn find_next_clean_card(&self, from: usize, to: usize) -> Option<usize> {
        self.find_next_card_with_status(from, to, CardStatus::Clean)
    }

    fn find_next_card_with_status(
        &self,
        from: usize,
        to: usize,
        status: CardStatus,
    ) -> Option<usize> {
        let to = to.min(self.cards.len());
        if from >= to {
            return None;
        }
        self.cards[from..to]
            .iter()
            .position(|&c| c == status)
            .map(|i| from + i)
    }

    /// Mark every card clean.
    pub fn clear(&mut self) {
        self.cards.fill(CardStatus::Clean);
    }

    /// Dirty every card overlapping `[from, to)`. Used after compaction when
    /// the nursery still holds objects that old cells may point to.
    pub fn dirty_range(&mut self, from: usize, to: usize) {
        if from >= to {
            return;
        }
        let first = self.address_to_index(from);
        let last = self.address_to_index(to - 1);
        self.cards[first..=last].fill(CardStatus::Dirty);
    }

    /// Number of dirty cards.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|&&c| c == CardStatus::Dirty)
            .count()
    }

    /// Record `[obj_start, obj_end)` as the covering object of every card
    /// that starts inside it. Objects must be reported in address order.
    #[inline]
    pub fn update_boundaries(&mut self, obj_start: usize, obj_end: usize) {
        if obj_end <= self.next_boundary() {
            return;
        }
        debug_assert!(
            obj_start <= self.next_boundary(),
            "object boundaries reported out of order"
        );
        // Offsets fit in u32: segment sizes are validated against it.
        #[allow(clippy::cast_possible_truncation)]
        let offset = (obj_start - self.base) as u32;
        while self.boundary < self.cards.len() && self.next_boundary() < obj_end {
            self.first_obj[self.boundary] = offset;
            self.boundary += 1;
        }
    }

    /// Address of the first card whose covering object is unknown.
    #[inline]
    #[must_use]
    pub const fn next_boundary(&self) -> usize {
        self.index_to_address(self.boundary)
    }

    /// Index of the first card whose covering object is unknown.
    #[must_use]
    pub const fn boundary_index(&self) -> usize {
        self.boundary
    }

    /// Forget all recorded boundaries, before they are replayed after
    /// compaction or when the segment is reused.
    pub fn reset_boundaries(&mut self) {
        self.boundary = 0;
    }

    /// Start address of the object covering the first byte of card `index`.
    #[must_use]
    pub fn first_obj_for_card(&self, index: usize) -> usize {
        debug_assert!(index < self.boundary, "card {index} has no recorded object");
        self.base + self.first_obj[index] as usize
    }

    /// Check the boundary table against the actual object layout.
    ///
    /// `cells` yields `(start, end)` for every object in address order.
    ///
    /// # Panics
    ///
    /// Panics when a recorded boundary disagrees with the layout.
    pub fn verify_boundaries(&self, cells: impl IntoIterator<Item = (usize, usize)>) {
        let mut index = 0;
        let mut level = self.base;
        for (start, end) in cells {
            while index < self.boundary && self.index_to_address(index) < end {
                assert_eq!(
                    self.first_obj_for_card(index),
                    start,
                    "card {index} records the wrong covering object"
                );
                index += 1;
            }
            level = end;
        }
        assert!(
            self.boundary == self.cards.len() || self.next_boundary() >= level,
            "boundary lags behind the allocation level"
        );
    }
}

impl std::fmt::Debug for CardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardTable")
            .field("base", &format_args!("{:#x}", self.base))
            .field("num_cards", &self.cards.len())
            .field("dirty", &self.dirty_count())
            .field("boundary", &self.boundary)
            .finish()
    }
}
