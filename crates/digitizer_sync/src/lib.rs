//! Synchronization primitives shared by the acquisition engine.
//!
//! This crate provides mechanisms whereby a driver/poll thread can hand data to a scheduler
//! thread without either side blocking for an unbounded amount of time. The chunk pool in
//! `digitizer_core` is built directly on [spsc_ring]; the streaming poll loop's watchdog is
//! built on [running_average].
pub mod running_average;
pub mod spsc_ring;
