//! Top-level sort driver.
//!
//! The driver scans the range left to right: detect the natural run at the
//! cursor, extend it by binary insertion when it falls short of the minimum
//! run length, push it on the run stack, and let the stack collapse while its
//! balance invariants are violated. Once the range is consumed the stack is
//! collapsed to a single run covering the whole range.

use allocator_api2::alloc::Allocator;

use crate::access::Sequence;
use crate::merge::MergeState;
use crate::run::{binary_insertion_sort, count_run, min_run_len, MIN_MERGE};
use crate::scratch::Workspace;
use crate::SortError;

pub(crate) fn drive<T, S, F, A>(
    seq: &mut S,
    lo: usize,
    hi: usize,
    is_less: &mut F,
    workspace: &mut Workspace<T, A>,
) -> Result<(), SortError>
where
    S: Sequence<T> + ?Sized,
    F: FnMut(&T, &T) -> bool,
    A: Allocator,
{
    let n = hi - lo;
    debug_assert!(n >= 2);

    if n < MIN_MERGE {
        // Too small to merge: one run detection plus binary insertion over
        // the rest, with no scratch allocation.
        let run_len = count_run(seq, lo, hi, is_less);
        binary_insertion_sort(seq, lo, hi, lo + run_len, is_less);
        return Ok(());
    }

    workspace.prepare(n)?;
    let mut state = MergeState::new(workspace, n);
    let min_run = min_run_len(n);

    let mut cursor = lo;
    let mut remaining = n;
    loop {
        let mut run_len = count_run(seq, cursor, hi, is_less);

        if run_len < min_run {
            let forced = remaining.min(min_run);
            binary_insertion_sort(seq, cursor, cursor + forced, cursor + run_len, is_less);
            run_len = forced;
        }

        state.push_run(cursor, run_len)?;
        state.collapse(seq, is_less)?;

        cursor += run_len;
        remaining -= run_len;
        if remaining == 0 {
            break;
        }
    }
    debug_assert_eq!(cursor, hi);

    state.force_collapse(seq, is_less)?;
    debug_assert_eq!(state.height(), 1);
    debug_assert!(state
        .top_run()
        .is_some_and(|run| run.base == lo && run.len == n));
    Ok(())
}
