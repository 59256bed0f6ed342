//! Data models for ProxyUsage

mod analytics;
mod overview;
mod price;
mod usage;
mod vitals;

pub use analytics::*;
pub use overview::*;
pub use price::*;
pub use usage::*;
pub use vitals::*;
