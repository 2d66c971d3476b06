//! Configuration builders for tests that need a [`Configuration`] without a
//! config file: an in-memory setup, or a SQLite database and local artifact
//! directory under a temp dir. Timeouts default to milliseconds so that
//! cleaner scenarios run without real waiting.
//!
//! [`Configuration`]: crate::config::Configuration

mod config_builder;

pub use config_builder::TestConfigBuilder;
