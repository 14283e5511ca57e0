// src/core/tasks/mod.rs

//! Background tasks spawned per connection.

pub mod timeout_sweeper;

pub use timeout_sweeper::TimeoutSweeperTask;
