//! Integration test suite for Baton.
//!
//! These tests drive the public API end to end: plans are parsed from text,
//! scheduled, and executed by real `sh` workers against a temporary state
//! directory.
//!
//! # Test Categories
//!
//! - `scheduling`: multi-cycle batch selection over realistic plans
//! - `store_recovery`: status file durability, crash recovery, contention
//! - `coordinator`: full runs with retries, operator control and shutdown
//! - `commits`: serialized commits of task results into a git repository


mod coordinator;
mod scheduling;
mod store_recovery;
