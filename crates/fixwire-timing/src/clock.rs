use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;
use quanta::Mock;

use crate::Nanos;

pub type Clock = quanta::Clock;

/// Wall-clock source behind [`Nanos::now`].
///
/// The `Quanta` variant only exists for mocked time in tests; real time
/// always comes from the system clock.
#[derive(Clone, Debug)]
pub enum WallClock {
    Quanta(Clock),
    System,
}

impl WallClock {
    pub fn raw(&self) -> u64 {
        match self {
            WallClock::Quanta(clock) => clock.raw(),
            WallClock::System => unsafe {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_unchecked().as_nanos() as u64
            },
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        Nanos(self.raw())
    }
}

// might be mocked
static GLOBAL_CLOCK: OnceCell<WallClock> = OnceCell::new();

/// Installs a mocked global clock and returns its controller.
///
/// Must run before anything else samples [`Nanos::now`] in this process.
#[inline]
pub fn init_clock_with_mock() -> Arc<Mock> {
    let (mock, controller) = Clock::mock();
    let mock = GLOBAL_CLOCK.get_or_init(|| WallClock::Quanta(mock));
    // this is in some effort to never not have 2 threads racing to initialize
    // different mocks and/or global clock before mock
    assert_eq!(mock.raw(), 0, "Do not initialize the global mock clock from 2 different threads");
    controller.increment(1);
    controller
}

#[inline]
pub fn global_clock() -> &'static WallClock {
    GLOBAL_CLOCK.get_or_init(|| WallClock::System)
}
