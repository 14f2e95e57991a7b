//! Domain models for retina screening records.

mod exam;
mod patient;
mod report;

pub use exam::*;
pub use patient::*;
pub use report::*;
