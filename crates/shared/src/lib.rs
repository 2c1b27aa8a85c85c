//! HuertoRentable Shared Types
//!
//! Identity and plan types shared between the identity subsystem and the
//! application handlers (crops, analytics, exports) that consume it.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
