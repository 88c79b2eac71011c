//! Drive configuration helpers.

mod location;

pub use location::{BusLocation, DriveInterface, derive_location};
