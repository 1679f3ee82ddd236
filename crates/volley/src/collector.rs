use parking_lot::Mutex;

/// Input-indexed storage for the outputs of a batch.
///
/// Holds one slot per input. Workers write into the slot of the index they
/// claimed; since the [`IndexAllocator`](crate::IndexAllocator) hands out every
/// index exactly once, each slot sees at most one writer and the per-slot
/// locks are never contended.
///
/// Slots are written once. A second write to the same slot is ignored and
/// reported, so a result can never be overwritten after it landed.
#[derive(Debug)]
pub struct ResultCollector<T> {
    slots: Box<[Mutex<Option<T>>]>,
}

impl<T> ResultCollector<T> {
    /// Creates a collector with `len` empty slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Stores `value` in slot `index`.
    ///
    /// Returns `false` if the slot was already filled (the existing value is
    /// kept) or if `index` is out of range.
    pub fn write(&self, index: usize, value: T) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        let mut slot = slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the collector has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots that hold a value.
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|slot| slot.lock().is_some()).count()
    }

    /// Lowest index whose slot is still empty, if any.
    pub fn first_missing(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.lock().is_none())
    }

    /// Moves every value out, in index order.
    ///
    /// Succeeds only if every slot was filled. Otherwise the collector is left
    /// untouched and the lowest empty index is returned.
    pub fn take_ordered(&self) -> Result<Vec<T>, usize> {
        if let Some(missing) = self.first_missing() {
            return Err(missing);
        }
        Ok(self
            .slots
            .iter()
            .filter_map(|slot| slot.lock().take())
            .collect())
    }
}

impl<T: Clone> ResultCollector<T> {
    /// A copy of the value in slot `index`, if it was filled.
    pub fn get(&self, index: usize) -> Option<T> {
        self.slots.get(index).and_then(|slot| slot.lock().clone())
    }
}
