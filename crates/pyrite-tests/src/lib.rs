//! # pyrite-tests
//!
//! Integration tests for the Pyrite synchronization engine.
//!
//! This crate provides:
//! - An in-memory chain store and state database fake
//! - A deterministic chain-data builder with fork support
//! - Scripted peers serving chain data through the delivery interface
//! - End-to-end synchronization scenarios over a paused clock

pub mod harness;

#[cfg(test)]
mod sync_tests;

pub use harness::*;
