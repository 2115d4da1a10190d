pub mod matcher;

pub use matcher::{TemporalFiring, TemporalMatcher};
