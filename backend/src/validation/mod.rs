//! Validation framework for request payloads.
//!
//! This module provides reusable validation rules so every service applies
//! the same input checks.

pub mod rules;

pub use validator::Validate;
