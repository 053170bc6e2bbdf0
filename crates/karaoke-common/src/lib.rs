//! # karaoke-common
//!
//! Shared configuration, error handling, identifiers, and validation used across the
//! karaoke crates. No audio or transport logic lives here.

pub mod config;
pub mod error;
pub mod id;
pub mod validation;
