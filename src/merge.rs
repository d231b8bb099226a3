//! Pending-run bookkeeping and the two galloping merge routines.
//!
//! A sort call owns one [`MergeState`]: the stack of runs awaiting merge and
//! the adaptive gallop threshold, both discarded when the call returns. The
//! merge routines stage the shorter run in the workspace and interleave it
//! with the longer run in place, switching between an element-at-a-time loop
//! and galloped bulk moves.

use std::ptr;

use allocator_api2::alloc::Allocator;

use crate::access::Sequence;
use crate::gallop::{gallop_left, gallop_right};
use crate::scratch::{StagedRun, Workspace};
use crate::SortError;

/// Consecutive wins one run needs before a merge tries galloping.
pub(crate) const MIN_GALLOP: usize = 7;

/// A pending run: `len` sorted elements starting at `base`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Run {
    pub(crate) base: usize,
    pub(crate) len: usize,
}

/// Upper bound on the pending-run stack for an input of `len` elements.
///
/// The balance invariants make run lengths grow at least as fast as the
/// Fibonacci numbers, so a small fixed depth covers each length band. The
/// cutoffs are tuned together with the collapse rules; both must change in
/// lockstep or the bound stops holding.
fn stack_capacity(len: usize) -> usize {
    if len < 120 {
        5
    } else if len < 1_542 {
        10
    } else if len < 119_151 {
        24
    } else {
        49
    }
}

/// Mutable context threaded through one sort invocation.
pub(crate) struct MergeState<'a, T, A: Allocator> {
    stack: Vec<Run>,
    max_height: usize,
    min_gallop: usize,
    scratch: &'a mut Workspace<T, A>,
    total_len: usize,
}

impl<'a, T, A: Allocator> MergeState<'a, T, A> {
    pub(crate) fn new(scratch: &'a mut Workspace<T, A>, total_len: usize) -> Self {
        let max_height = stack_capacity(total_len);
        Self {
            stack: Vec::with_capacity(max_height),
            max_height,
            min_gallop: MIN_GALLOP,
            scratch,
            total_len,
        }
    }

    pub(crate) fn height(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn top_run(&self) -> Option<Run> {
        self.stack.last().copied()
    }

    pub(crate) fn push_run(&mut self, base: usize, len: usize) -> Result<(), SortError> {
        if self.stack.len() == self.max_height {
            // The capacity table covers every reachable stack depth; a full
            // stack means the input length was misjudged.
            return Err(SortError::capacity_overflow());
        }
        self.stack.push(Run { base, len });
        Ok(())
    }

    /// Restores the stack invariants
    /// `len[n-3] > len[n-2] + len[n-1]` and `len[n-2] > len[n-1]`
    /// by merging, preferring the smaller pair when both violate.
    pub(crate) fn collapse<S, F>(&mut self, seq: &mut S, is_less: &mut F) -> Result<(), SortError>
    where
        S: Sequence<T> + ?Sized,
        F: FnMut(&T, &T) -> bool,
    {
        while self.stack.len() > 1 {
            let n = self.stack.len() - 2;
            if n > 0 && self.stack[n - 1].len <= self.stack[n].len + self.stack[n + 1].len {
                let at = if self.stack[n - 1].len < self.stack[n + 1].len {
                    n - 1
                } else {
                    n
                };
                self.merge_at(seq, is_less, at)?;
            } else if self.stack[n].len <= self.stack[n + 1].len {
                self.merge_at(seq, is_less, n)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Merges everything down to a single run, ignoring the invariants.
    pub(crate) fn force_collapse<S, F>(
        &mut self,
        seq: &mut S,
        is_less: &mut F,
    ) -> Result<(), SortError>
    where
        S: Sequence<T> + ?Sized,
        F: FnMut(&T, &T) -> bool,
    {
        while self.stack.len() > 1 {
            let mut n = self.stack.len() - 2;
            if n > 0 && self.stack[n - 1].len < self.stack[n + 1].len {
                n -= 1;
            }
            self.merge_at(seq, is_less, n)?;
        }
        Ok(())
    }

    /// Merges the adjacent runs at stack slots `i` and `i + 1`.
    ///
    /// The tails that are already in place are trimmed off first: elements of
    /// run 1 below run 2's head and elements of run 2 above run 1's tail need
    /// no work. Either trim consuming a whole run means the pair was already
    /// ordered.
    fn merge_at<S, F>(&mut self, seq: &mut S, is_less: &mut F, i: usize) -> Result<(), SortError>
    where
        S: Sequence<T> + ?Sized,
        F: FnMut(&T, &T) -> bool,
    {
        debug_assert!(self.stack.len() >= 2);
        debug_assert!(i == self.stack.len() - 2 || i == self.stack.len() - 3);

        let Run {
            base: mut base1,
            len: mut len1,
        } = self.stack[i];
        let Run { base: base2, len: len2 } = self.stack[i + 1];
        debug_assert!(len1 > 0 && len2 > 0);
        debug_assert_eq!(base1 + len1, base2);

        self.stack[i] = Run {
            base: base1,
            len: len1 + len2,
        };
        self.stack.remove(i + 1);

        let k = gallop_right(seq.get_ref(base2), &*seq, base1, len1, 0, is_less);
        base1 += k;
        len1 -= k;
        if len1 == 0 {
            return Ok(());
        }
        let len2 = gallop_left(
            seq.get_ref(base1 + len1 - 1),
            &*seq,
            base2,
            len2,
            len2 - 1,
            is_less,
        );
        if len2 == 0 {
            return Ok(());
        }

        // Staging the shorter run minimizes scratch traffic.
        if len1 <= len2 {
            self.merge_lo(seq, is_less, base1, len1, base2, len2)
        } else {
            self.merge_hi(seq, is_less, base1, len1, base2, len2)
        }
    }

    /// Merge where run 1 is the shorter: stage run 1 in scratch, then fill
    /// the vacated span left to right.
    fn merge_lo<S, F>(
        &mut self,
        seq: &mut S,
        is_less: &mut F,
        base1: usize,
        len1: usize,
        base2: usize,
        len2: usize,
    ) -> Result<(), SortError>
    where
        S: Sequence<T> + ?Sized,
        F: FnMut(&T, &T) -> bool,
    {
        debug_assert!(len1 > 0 && len2 > 0 && base1 + len1 == base2);
        let tmp = self.scratch.ensure(len1, self.total_len)?;
        unsafe {
            for i in 0..len1 {
                ptr::copy_nonoverlapping(seq.get_ptr(base1 + i), tmp.add(i), 1);
            }
        }

        // `m` owns the staged run. Whatever is left in scratch when it drops
        // is copied back into the hole, so an error return or a panicking
        // comparison leaves the sequence holding every element exactly once.
        let mut m = MergeLo {
            seq: &mut *seq,
            tmp,
            cursor1: 0,
            len1,
            dest: base1,
        };
        let mut cursor2 = base2;
        let mut len2 = len2;

        // Run 2's head is known to precede run 1's head after trimming.
        unsafe { m.take_seq(cursor2) };
        cursor2 += 1;
        len2 -= 1;
        if len2 == 0 {
            return Ok(());
        }
        if m.len1 == 1 {
            unsafe { m.seq.move_within(cursor2, m.dest, len2) };
            m.dest += len2;
            return Ok(());
        }

        let mut min_gallop = self.min_gallop;
        'merge: loop {
            let mut count1 = 0usize;
            let mut count2 = 0usize;

            // Element-at-a-time mode, tracking each run's win streak.
            loop {
                debug_assert!(m.len1 > 1 && len2 > 0);
                if is_less(m.seq.get_ref(cursor2), unsafe { &*m.tmp.add(m.cursor1) }) {
                    unsafe { m.take_seq(cursor2) };
                    cursor2 += 1;
                    len2 -= 1;
                    count2 += 1;
                    count1 = 0;
                    if len2 == 0 {
                        break 'merge;
                    }
                } else {
                    unsafe { m.take_tmp() };
                    count1 += 1;
                    count2 = 0;
                    if m.len1 == 1 {
                        break 'merge;
                    }
                }
                if (count1 | count2) >= min_gallop {
                    break;
                }
            }

            // Galloping mode: bulk-move whole winning streaks until neither
            // run sustains one.
            loop {
                debug_assert!(m.len1 > 1 && len2 > 0);
                count1 = {
                    let staged =
                        unsafe { StagedRun::new(m.tmp, m.cursor1 + m.len1) };
                    gallop_right(
                        m.seq.get_ref(cursor2),
                        &staged,
                        m.cursor1,
                        m.len1,
                        0,
                        is_less,
                    )
                };
                if count1 != 0 {
                    unsafe { m.bulk_tmp(count1) };
                    if m.len1 <= 1 {
                        break 'merge;
                    }
                }
                unsafe { m.take_seq(cursor2) };
                cursor2 += 1;
                len2 -= 1;
                if len2 == 0 {
                    break 'merge;
                }

                count2 = gallop_left(
                    unsafe { &*m.tmp.add(m.cursor1) },
                    &*m.seq,
                    cursor2,
                    len2,
                    0,
                    is_less,
                );
                if count2 != 0 {
                    unsafe { m.seq.move_within(cursor2, m.dest, count2) };
                    m.dest += count2;
                    cursor2 += count2;
                    len2 -= count2;
                    if len2 == 0 {
                        break 'merge;
                    }
                }
                unsafe { m.take_tmp() };
                if m.len1 == 1 {
                    break 'merge;
                }
                min_gallop = min_gallop.saturating_sub(1);
                if count1 < MIN_GALLOP && count2 < MIN_GALLOP {
                    break;
                }
            }
            // Leaving gallop mode raises the bar for the next entry.
            min_gallop += 2;
        }
        self.min_gallop = min_gallop.max(1);

        match m.len1 {
            1 => {
                debug_assert!(len2 > 0);
                unsafe { m.seq.move_within(cursor2, m.dest, len2) };
                // The last staged element lands past run 2's remainder when
                // `m` drops.
                m.dest += len2;
                Ok(())
            }
            // Run 1 exhausted with run 2 elements still unmerged: impossible
            // under a total order.
            0 => Err(SortError::comparator_violation()),
            _ => {
                debug_assert_eq!(len2, 0);
                Ok(())
            }
        }
    }

    /// Mirror of [`merge_lo`] for a shorter run 2: stage run 2 in scratch,
    /// then fill the vacated span right to left.
    fn merge_hi<S, F>(
        &mut self,
        seq: &mut S,
        is_less: &mut F,
        base1: usize,
        len1: usize,
        base2: usize,
        len2: usize,
    ) -> Result<(), SortError>
    where
        S: Sequence<T> + ?Sized,
        F: FnMut(&T, &T) -> bool,
    {
        debug_assert!(len1 > 0 && len2 > 0 && base1 + len1 == base2);
        let tmp = self.scratch.ensure(len2, self.total_len)?;
        unsafe {
            for i in 0..len2 {
                ptr::copy_nonoverlapping(seq.get_ptr(base2 + i), tmp.add(i), 1);
            }
        }

        // Descending cursors go one below `base1` when a run empties, so
        // they are signed.
        let mut m = MergeHi {
            seq: &mut *seq,
            tmp,
            cursor2: len2 as isize - 1,
            dest: (base2 + len2 - 1) as isize,
        };
        let mut cursor1 = (base1 + len1 - 1) as isize;
        let mut len1 = len1;
        let mut len2 = len2;

        // Run 1's tail is known to follow run 2's tail after trimming.
        unsafe { m.take_seq(cursor1 as usize) };
        cursor1 -= 1;
        len1 -= 1;
        if len1 == 0 {
            return Ok(());
        }
        if len2 == 1 {
            m.dest -= len1 as isize;
            cursor1 -= len1 as isize;
            unsafe {
                m.seq
                    .move_within((cursor1 + 1) as usize, (m.dest + 1) as usize, len1)
            };
            return Ok(());
        }

        let mut min_gallop = self.min_gallop;
        'merge: loop {
            let mut count1 = 0usize;
            let mut count2 = 0usize;

            loop {
                debug_assert!(len1 > 0 && len2 > 1);
                if is_less(unsafe { &*m.tmp.offset(m.cursor2) }, m.seq.get_ref(cursor1 as usize)) {
                    unsafe { m.take_seq(cursor1 as usize) };
                    cursor1 -= 1;
                    len1 -= 1;
                    count1 += 1;
                    count2 = 0;
                    if len1 == 0 {
                        break 'merge;
                    }
                } else {
                    unsafe { m.take_tmp() };
                    len2 -= 1;
                    count2 += 1;
                    count1 = 0;
                    if len2 == 1 {
                        break 'merge;
                    }
                }
                if (count1 | count2) >= min_gallop {
                    break;
                }
            }

            loop {
                debug_assert!(len1 > 0 && len2 > 1);
                count1 = len1
                    - gallop_right(
                        unsafe { &*m.tmp.offset(m.cursor2) },
                        &*m.seq,
                        base1,
                        len1,
                        len1 - 1,
                        is_less,
                    );
                if count1 != 0 {
                    m.dest -= count1 as isize;
                    cursor1 -= count1 as isize;
                    len1 -= count1;
                    unsafe {
                        m.seq.move_within(
                            (cursor1 + 1) as usize,
                            (m.dest + 1) as usize,
                            count1,
                        )
                    };
                    if len1 == 0 {
                        break 'merge;
                    }
                }
                unsafe { m.take_tmp() };
                len2 -= 1;
                if len2 == 1 {
                    break 'merge;
                }

                count2 = {
                    let staged = unsafe { StagedRun::new(m.tmp, len2) };
                    len2 - gallop_left(
                        m.seq.get_ref(cursor1 as usize),
                        &staged,
                        0,
                        len2,
                        len2 - 1,
                        is_less,
                    )
                };
                if count2 != 0 {
                    m.dest -= count2 as isize;
                    m.cursor2 -= count2 as isize;
                    len2 -= count2;
                    unsafe { m.bulk_tmp(count2) };
                    if len2 <= 1 {
                        break 'merge;
                    }
                }
                unsafe { m.take_seq(cursor1 as usize) };
                cursor1 -= 1;
                len1 -= 1;
                if len1 == 0 {
                    break 'merge;
                }
                min_gallop = min_gallop.saturating_sub(1);
                if count1 < MIN_GALLOP && count2 < MIN_GALLOP {
                    break;
                }
            }
            min_gallop += 2;
        }
        self.min_gallop = min_gallop.max(1);

        match len2 {
            1 => {
                debug_assert!(len1 > 0);
                m.dest -= len1 as isize;
                cursor1 -= len1 as isize;
                unsafe {
                    m.seq
                        .move_within((cursor1 + 1) as usize, (m.dest + 1) as usize, len1)
                };
                // The last staged element lands below run 1's remainder when
                // `m` drops.
                Ok(())
            }
            0 => Err(SortError::comparator_violation()),
            _ => {
                debug_assert_eq!(len1, 0);
                Ok(())
            }
        }
    }
}

/// Left-to-right merge cursor over a staged run 1.
///
/// The hole being filled is always `dest..dest + len1` positions wide within
/// the sequence; dropping the cursor flushes the unconsumed scratch elements
/// into it.
struct MergeLo<'s, T, S: Sequence<T> + ?Sized> {
    seq: &'s mut S,
    tmp: *mut T,
    cursor1: usize,
    len1: usize,
    dest: usize,
}

impl<'s, T, S: Sequence<T> + ?Sized> MergeLo<'s, T, S> {
    /// Moves `seq[src]` into the hole.
    #[inline]
    unsafe fn take_seq(&mut self, src: usize) {
        debug_assert!(self.dest < src);
        let value = ptr::read(self.seq.get_ptr(src));
        ptr::write(self.seq.get_ptr_mut(self.dest), value);
        self.dest += 1;
    }

    /// Moves the next staged element into the hole.
    #[inline]
    unsafe fn take_tmp(&mut self) {
        debug_assert!(self.len1 > 0);
        ptr::copy_nonoverlapping(self.tmp.add(self.cursor1), self.seq.get_ptr_mut(self.dest), 1);
        self.cursor1 += 1;
        self.dest += 1;
        self.len1 -= 1;
    }

    /// Moves the next `count` staged elements into the hole.
    unsafe fn bulk_tmp(&mut self, count: usize) {
        debug_assert!(count <= self.len1);
        for i in 0..count {
            ptr::copy_nonoverlapping(
                self.tmp.add(self.cursor1 + i),
                self.seq.get_ptr_mut(self.dest + i),
                1,
            );
        }
        self.cursor1 += count;
        self.dest += count;
        self.len1 -= count;
    }
}

impl<'s, T, S: Sequence<T> + ?Sized> Drop for MergeLo<'s, T, S> {
    fn drop(&mut self) {
        unsafe {
            for i in 0..self.len1 {
                ptr::copy_nonoverlapping(
                    self.tmp.add(self.cursor1 + i),
                    self.seq.get_ptr_mut(self.dest + i),
                    1,
                );
            }
        }
    }
}

/// Right-to-left merge cursor over a staged run 2.
///
/// The hole spans the `cursor2 + 1` positions ending at `dest`; dropping the
/// cursor flushes the unconsumed scratch elements into it.
struct MergeHi<'s, T, S: Sequence<T> + ?Sized> {
    seq: &'s mut S,
    tmp: *mut T,
    cursor2: isize,
    dest: isize,
}

impl<'s, T, S: Sequence<T> + ?Sized> MergeHi<'s, T, S> {
    /// Moves `seq[src]` into the hole.
    #[inline]
    unsafe fn take_seq(&mut self, src: usize) {
        debug_assert!(self.dest > src as isize);
        let value = ptr::read(self.seq.get_ptr(src));
        ptr::write(self.seq.get_ptr_mut(self.dest as usize), value);
        self.dest -= 1;
    }

    /// Moves the last unconsumed staged element into the hole.
    #[inline]
    unsafe fn take_tmp(&mut self) {
        debug_assert!(self.cursor2 >= 0);
        ptr::copy_nonoverlapping(
            self.tmp.offset(self.cursor2),
            self.seq.get_ptr_mut(self.dest as usize),
            1,
        );
        self.cursor2 -= 1;
        self.dest -= 1;
    }

    /// Moves `count` staged elements into the hole, preserving their order.
    /// The cursors must already have been moved below the span.
    unsafe fn bulk_tmp(&mut self, count: usize) {
        for i in 0..count {
            ptr::copy_nonoverlapping(
                self.tmp.offset(self.cursor2 + 1 + i as isize),
                self.seq.get_ptr_mut((self.dest + 1 + i as isize) as usize),
                1,
            );
        }
    }
}

impl<'s, T, S: Sequence<T> + ?Sized> Drop for MergeHi<'s, T, S> {
    fn drop(&mut self) {
        if self.cursor2 >= 0 {
            let count = (self.cursor2 + 1) as usize;
            let start = (self.dest + 1) as usize - count;
            unsafe {
                for i in 0..count {
                    ptr::copy_nonoverlapping(
                        self.tmp.add(i),
                        self.seq.get_ptr_mut(start + i),
                        1,
                    );
                }
            }
        }
    }
}
