//! Common infrastructure shared by the Vantage crates.

#![forbid(unsafe_code)]

pub mod error;

pub use error::{Error, Result};
