//! Integration test entry point for meshcheck.
//!
//! Every test runs real in-process simulator clusters on ephemeral ports.
//! Run with: cargo test -p meshcheck --test integration

mod harness;
mod end_to_end;
mod failures;
mod verification;
