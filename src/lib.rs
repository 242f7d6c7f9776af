//! Webmforge - WebM to MP4 conversion service
//!
//! This library crate exposes the conversion pipeline for the binary and
//! for integration testing.

pub mod accounts;
pub mod app;
pub mod artifacts;
pub mod config;
pub mod conversion;
pub mod events;
pub mod server;
