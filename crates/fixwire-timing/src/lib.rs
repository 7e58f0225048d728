mod clock;
mod nanos;
mod repeater;

pub use clock::{Clock, WallClock, global_clock, init_clock_with_mock};
pub use nanos::Nanos;
pub use repeater::Repeater;
