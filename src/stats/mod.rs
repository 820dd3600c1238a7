mod window;

pub use window::{SlidingWindow, StatsSnapshot};
