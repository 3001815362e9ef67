//! Debug assertion macros for ring transport invariants.
//!
//! Active in debug builds only, so the release hot paths pay nothing.

/// Assert that a record length is representable, i.e. below the reserved
/// in-band marker values.
macro_rules! debug_assert_record_len {
    ($len:expr) => {
        debug_assert!(
            ($len) < crate::ring::MARKER_MIN as usize,
            "record length {} collides with the reserved marker range",
            $len
        )
    };
}

/// Assert that a cursor points inside the buffer it is supposed to be in.
macro_rules! debug_assert_in_buffer {
    ($ptr:expr, $base:expr, $cap:expr) => {
        debug_assert!(
            ($ptr) as usize >= ($base) as usize
                && (($ptr) as usize) <= ($base) as usize + ($cap),
            "cursor {:p} outside buffer [{:p}, {:p})",
            $ptr,
            $base,
            ($base as usize + $cap) as *const u8
        )
    };
}

/// Assert that the producer keeps strictly behind the reader while wrapped,
/// so cursor equality always and only means "empty".
macro_rules! debug_assert_writer_behind_reader {
    ($writer:expr, $reader:expr) => {
        debug_assert!(
            (($writer) as usize) < (($reader) as usize),
            "wrapped writer {:p} caught up with reader {:p}",
            $writer,
            $reader
        )
    };
}

pub(crate) use debug_assert_in_buffer;
pub(crate) use debug_assert_record_len;
pub(crate) use debug_assert_writer_behind_reader;
