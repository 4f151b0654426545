//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

/// node / pool / placement-group identifiers and their serialization
pub mod id;

// common log initialisation routine
pub mod logging;
