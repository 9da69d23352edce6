//! Shared helpers for the end-to-end event tree tests.

pub mod test_util;
