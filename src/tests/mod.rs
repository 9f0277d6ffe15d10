//! Cross-component tests
//!
//! `support` holds the scripted invoker shared with the in-file unit tests.

pub mod support;

mod end_to_end;
