//! Shared test utilities for vidsync integration tests.
//!
//! This module provides:
//! - `TestHarness`: an executing `App` over a temp-dir database
//! - `ScriptedScraper`: a scraping unit that replays a fixed list of steps
//! - `ConfigBuilder` for test configurations

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{ScriptedScraper, Step, TestHarness};
