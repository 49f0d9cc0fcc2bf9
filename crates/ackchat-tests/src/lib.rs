//! Integration test helpers: an in-process server on a random port and
//! clients that record every UI notification they receive.

pub mod harness;
