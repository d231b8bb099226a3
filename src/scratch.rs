//! Scratch storage management for merging.
//!
//! This module handles the temporary buffer the merge routines stage the
//! shorter run in, similar to how `RawVec` works for `Vec` in the standard
//! library: it manages raw capacity but never tracks element count or runs
//! destructors — the merge routines move every staged element back out before
//! they finish.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use allocator_api2::alloc::{Allocator, Global, Layout};

use crate::access::Sequence;
use crate::SortError;

/// Storage for a sort call's first allocation. Merging two runs needs room
/// for the shorter one, so small inputs get half their length up front and
/// everything else starts here and grows on demand.
const INITIAL_CAPACITY: usize = 256;

/// Reusable scratch buffer for the merge phase of a sort.
///
/// A sort call allocates one of these internally, but callers that sort
/// repeatedly can create a `Workspace` once and pass it to
/// [`sort_by_with`](crate::sort_by_with) to reuse the allocation across
/// calls. The buffer only ever holds elements mid-merge; between calls (and
/// between merges) its contents are uninitialized.
pub struct Workspace<T, A: Allocator = Global> {
    ptr: NonNull<T>,
    cap: usize,
    alloc: A,
    _marker: PhantomData<T>,
}

impl<T> Workspace<T> {
    /// Creates an empty workspace. Does not allocate.
    #[inline]
    pub const fn new() -> Self {
        Self::new_in(Global)
    }

    /// Creates a workspace with room for `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if allocation fails.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut ws = Self::new();
        if capacity > 0 {
            if let Err(err) = ws.grow_to(capacity) {
                panic!("workspace allocation failed: {}", err);
            }
        }
        ws
    }
}

impl<T, A: Allocator> Workspace<T, A> {
    /// Creates an empty workspace using the given allocator.
    #[inline]
    pub const fn new_in(alloc: A) -> Self {
        Self {
            ptr: NonNull::dangling(),
            cap: 0,
            alloc,
            _marker: PhantomData,
        }
    }

    /// Number of elements the buffer can hold without reallocating.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Sizes the buffer for a sort over `total_len` elements: half the input
    /// for short inputs, [`INITIAL_CAPACITY`] otherwise. A buffer that is
    /// already large enough is kept as is.
    pub(crate) fn prepare(&mut self, total_len: usize) -> Result<(), SortError> {
        let want = if total_len < 2 * INITIAL_CAPACITY {
            total_len / 2
        } else {
            INITIAL_CAPACITY
        };
        if self.cap < want {
            self.grow_to(want)?;
        }
        Ok(())
    }

    /// Makes the buffer hold at least `min_capacity` elements and returns its
    /// base pointer. Growth goes to the next power of two of the demand,
    /// capped at half of `total_len`; the old contents are dead between
    /// merges, so nothing is copied over.
    pub(crate) fn ensure(
        &mut self,
        min_capacity: usize,
        total_len: usize,
    ) -> Result<*mut T, SortError> {
        // The smaller of two adjacent runs never exceeds half the span.
        debug_assert!(min_capacity <= total_len / 2);
        if self.cap < min_capacity {
            let target = min_capacity
                .checked_next_power_of_two()
                .map_or(min_capacity, |pow| pow.min(total_len / 2));
            self.grow_to(target)?;
        }
        Ok(self.ptr.as_ptr())
    }

    fn grow_to(&mut self, new_cap: usize) -> Result<(), SortError> {
        debug_assert!(new_cap > self.cap);
        let layout =
            Layout::array::<T>(new_cap).map_err(|_| SortError::capacity_overflow())?;
        if layout.size() == 0 {
            self.release();
            self.ptr = NonNull::dangling();
            self.cap = new_cap;
            return Ok(());
        }
        let ptr = self
            .alloc
            .allocate(layout)
            .map_err(|_| SortError::alloc_failure(layout))?;
        self.release();
        self.ptr = ptr.cast();
        self.cap = new_cap;
        Ok(())
    }

    fn release(&mut self) {
        if self.cap != 0 && mem::size_of::<T>() != 0 {
            // The layout was validated when the block was allocated.
            let layout = Layout::array::<T>(self.cap).expect("layout overflow");
            unsafe {
                self.alloc.deallocate(self.ptr.cast(), layout);
            }
        }
    }
}

impl<T> Default for Workspace<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: Allocator> Drop for Workspace<T, A> {
    fn drop(&mut self) {
        // Only frees memory; the merge routines never leave elements behind.
        self.release();
    }
}

// Safety: Workspace owns its allocation and holds no initialized elements
// between uses.
unsafe impl<T: Send, A: Allocator + Send> Send for Workspace<T, A> {}
unsafe impl<T: Sync, A: Allocator + Sync> Sync for Workspace<T, A> {}

/// Read-only view over the run staged in scratch storage, so the gallop
/// searches can walk scratch and sequence storage uniformly.
pub(crate) struct StagedRun<T> {
    base: *const T,
    len: usize,
}

impl<T> StagedRun<T> {
    /// # Safety
    ///
    /// `base..base + len` must stay initialized and unaliased by mutable
    /// access for the lifetime of the view.
    pub(crate) unsafe fn new(base: *const T, len: usize) -> Self {
        Self { base, len }
    }
}

unsafe impl<T> Sequence<T> for StagedRun<T> {
    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn get_ref(&self, index: usize) -> &T {
        debug_assert!(index < self.len);
        unsafe { &*self.base.add(index) }
    }

    #[inline]
    fn get_ptr(&self, index: usize) -> *const T {
        debug_assert!(index < self.len);
        unsafe { self.base.add(index) }
    }

    fn get_ptr_mut(&mut self, index: usize) -> *mut T {
        debug_assert!(index < self.len);
        unsafe { self.base.add(index) as *mut T }
    }

    fn swap(&mut self, a: usize, b: usize) {
        debug_assert!(a < self.len && b < self.len);
        if a != b {
            unsafe {
                ptr::swap(self.base.add(a) as *mut T, self.base.add(b) as *mut T);
            }
        }
    }
}
