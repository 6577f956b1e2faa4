//! Time source for cooldown checks and event timestamps.

pub use mockable::{Clock, DefaultClock};
