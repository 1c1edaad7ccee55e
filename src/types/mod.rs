//! Core value types shared between the evaluator interface and the tree
mod interval;

pub use interval::{Interval, IntervalState};
