//! Integration test entry point for srpl-node.
//!
//! Run with: cargo test -p srpl-node --test integration

mod convergence;
mod harness;
