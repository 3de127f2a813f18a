//! Timeinstate - per-UID CPU time-in-state and concurrency accounting
//!
//! This library provides an event-driven accounting engine that charges the
//! time between context switches to the outgoing UID, bucketed by the CPU
//! frequency it ran at and by how many other CPUs were active, using
//! fixed-size lock-free counter tables.

pub mod active;
pub mod cli;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod freq_state;
pub mod replay;
pub mod report;
pub mod table;
pub mod topology;
