//! Patient identity: name keys and equivalence classes.

mod matcher;
mod normalizer;

pub use matcher::*;
pub use normalizer::*;
