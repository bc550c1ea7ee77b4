//! Leader-side work distribution: ranges, leases, and merged discoveries.

pub mod error;
pub mod manager;
pub mod range;
pub mod seen;
pub mod targets;

pub use error::*;
pub use manager::*;
pub use range::*;
pub use seen::*;
pub use targets::*;
