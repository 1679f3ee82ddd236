use portable_atomic::{AtomicUsize, Ordering};
#[cfg(feature = "tracing")]
use tracing::instrument;

/// A lock-free allocator of input slots for a single batch.
///
/// Every worker of a batch shares one [`IndexAllocator`] and calls
/// [`next_index`] to claim the next unclaimed input. Indices are handed out in
/// strictly increasing order starting at `0`, each exactly once, and the
/// allocator reports exhaustion once every index in `0..len` was issued.
///
/// ## Features
/// - ✅ Thread-safe
/// - ✅ Never blocks, O(1) per claim
/// - ✅ Never overshoots `len`, no matter how many callers race past the end
///
/// Enable the `cache-padded` feature to keep the counter on its own cache line
/// when many workers hammer it.
///
/// [`next_index`]: IndexAllocator::next_index
#[derive(Debug)]
pub struct IndexAllocator {
    #[cfg(feature = "cache-padded")]
    next: crossbeam_utils::CachePadded<AtomicUsize>,
    #[cfg(not(feature = "cache-padded"))]
    next: AtomicUsize,
    len: usize,
}

impl IndexAllocator {
    /// Creates an allocator over the index range `0..len`.
    pub fn new(len: usize) -> Self {
        Self {
            #[cfg(feature = "cache-padded")]
            next: crossbeam_utils::CachePadded::new(AtomicUsize::new(0)),
            #[cfg(not(feature = "cache-padded"))]
            next: AtomicUsize::new(0),
            len,
        }
    }

    /// Claims the next unclaimed index, or returns `None` once all indices
    /// have been issued.
    ///
    /// The counter only advances while it is below `len`, so exhausted calls
    /// leave the state untouched.
    ///
    /// # Example
    /// ```
    /// use volley::IndexAllocator;
    ///
    /// let allocator = IndexAllocator::new(2);
    /// assert_eq!(allocator.next_index(), Some(0));
    /// assert_eq!(allocator.next_index(), Some(1));
    /// assert_eq!(allocator.next_index(), None);
    /// ```
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self), fields(len = self.len)))]
    pub fn next_index(&self) -> Option<usize> {
        let len = self.len;
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < len).then_some(next + 1)
            })
            .ok()
    }

    /// Number of indices issued so far.
    pub fn issued(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    /// Returns `true` once every index has been claimed.
    pub fn is_exhausted(&self) -> bool {
        self.issued() >= self.len
    }

    /// Total number of indices this allocator hands out.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the allocator covers no indices at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
