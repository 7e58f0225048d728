use crate::Nanos;

/// Rate-gates a recurring action on the wall clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Repeater {
    interval: Nanos,
    last_acted: Nanos,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Nanos) -> Self {
        Self { interval, last_acted: Nanos::ZERO }
    }

    /// True once per interval, starting with the first call.
    #[inline]
    pub fn fired(&mut self) -> bool {
        self.fired_at(Nanos::now())
    }

    #[inline]
    pub fn fired_at(&mut self, now: Nanos) -> bool {
        if now.elapsed_since(self.last_acted) >= self.interval {
            self.last_acted = now;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Nanos {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Nanos) {
        self.interval = interval;
    }

    pub fn reset(&mut self) {
        self.last_acted = Nanos::now();
    }

    pub fn force_fire(&mut self) {
        self.last_acted = Nanos::ZERO;
    }
}
