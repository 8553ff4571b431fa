// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use rsd_common::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A countdown timer ticked at the session's resolution by whatever loop
/// owns it. Only enabled timers count down or expire.
#[derive(Clone)]
pub struct Timer {
    /// State: interval to reset to, enabled flag, time left.
    value: Arc<Mutex<(Duration, bool, Duration)>>,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            value: Arc::new(Mutex::new((interval, false, interval))),
        }
    }

    /// Tick the timer down by `resolution`, saturating at zero.
    pub fn tick(&self, resolution: Duration) {
        let mut value = lock!(self.value);
        if value.1 {
            value.2 = value.2.saturating_sub(resolution);
        }
    }

    pub fn interval(&self) -> Duration {
        lock!(self.value).0
    }

    /// Change the interval and restart the countdown. Used when hold time
    /// is renegotiated.
    pub fn set_interval(&self, interval: Duration) {
        let mut value = lock!(self.value);
        value.0 = interval;
        value.2 = interval;
    }

    pub fn enabled(&self) -> bool {
        lock!(self.value).1
    }

    pub fn enable(&self) {
        lock!(self.value).1 = true
    }

    pub fn disable(&self) {
        lock!(self.value).1 = false
    }

    /// True once an enabled timer has ticked down to zero.
    pub fn expired(&self) -> bool {
        let v = lock!(self.value);
        v.1 && v.2.is_zero()
    }

    pub fn reset(&self) {
        let mut value = lock!(self.value);
        value.2 = value.0;
    }
}

/// The per-session timers the FSM driver ticks from its state loops.
#[derive(Clone)]
pub struct SessionClock {
    /// How often the owning loops wake up to tick.
    pub resolution: Duration,

    /// How long to keep a session alive between keepalive, update and/or
    /// notification messages. Interval follows hold-time negotiation.
    pub hold_timer: Timer,

    /// Time between sending keepalive messages.
    pub keepalive_timer: Timer,

    /// Amount of time that a peer is held in the idle state.
    pub idle_hold_timer: Timer,
}

impl SessionClock {
    pub fn new(
        resolution: Duration,
        hold_interval: Duration,
        keepalive_interval: Duration,
        idle_hold_interval: Duration,
    ) -> Self {
        Self {
            resolution,
            hold_timer: Timer::new(hold_interval),
            keepalive_timer: Timer::new(keepalive_interval),
            idle_hold_timer: Timer::new(idle_hold_interval),
        }
    }
}
