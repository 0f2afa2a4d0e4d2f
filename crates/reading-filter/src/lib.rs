//! Reading Filter
//!
//! Turns raw broker payloads into scaled numeric readings and decides
//! which of them are worth persisting.

mod deadband;
mod extract;

pub use deadband::{DeadbandFilter, StoredReading};
pub use extract::{extract, Transform};
