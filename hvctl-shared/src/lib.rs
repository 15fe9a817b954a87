//! Types shared between the hvctl library, its binary and embedders.

pub mod errors;

pub use errors::{HvctlError, HvctlResult};
