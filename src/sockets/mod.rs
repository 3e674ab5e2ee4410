//! Socket state engine: collection (spec §4.7), fd classification/dump
//! policy (spec §4.8), and restoration (spec §4.9) over the shared data
//! model (spec §3).

pub mod collector;
pub mod dumper;
pub mod model;
pub mod restorer;
