// ABOUTME: Library crate for portmapper exposing the reconciliation engine for the binary and tests

pub mod config;
pub mod fsutil;
pub mod observer;
pub mod persist;
pub mod reconciler;
pub mod registry;
pub mod supervisor;
pub mod synth;
