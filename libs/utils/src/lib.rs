//! `utils` is a place for plumbing shared between the crates in this
//! repository.

// common log initialisation routine
pub mod logging;

// signal-driven shutdown handling
pub mod signals;
