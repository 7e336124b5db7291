//! Common utilities for tessera
//!
//! This crate provides the error type shared by the validation and ODM crates.

pub mod error;

pub use error::{Result, TesseraError};
