//! Tick source for the timer server

use std::sync::{Arc, Mutex};

use crate::locked;

/// Low-level clock and alarm the timer server runs on. All values are ticks
/// unless a method says otherwise.
pub trait RtcDriver: Send {
    /// Arms the alarm `timeout` ticks after the current timer context
    fn set_alarm(&mut self, timeout: u32);

    fn stop_alarm(&mut self);

    /// Records the current time as the new context and returns it
    fn set_timer_context(&mut self) -> u32;

    fn timer_context(&self) -> u32;

    /// Ticks since the context was last recorded
    fn timer_elapsed_time(&self) -> u32;

    fn timer_value(&self) -> u32;

    fn minimum_timeout(&self) -> u32;

    fn ms_to_tick(&self, ms: u32) -> u32;

    fn tick_to_ms(&self, tick: u32) -> u32;
}

/// Alarms closer than this many ticks are pushed back to it
pub const MIN_ALARM_DELAY: u32 = 3;

#[derive(Debug, Default)]
struct RtcState {
    now: u32,
    context: u32,
    alarm: Option<u32>,
}

/// Millisecond RTC whose time is moved forward by the caller. Clones share
/// the same clock, so the runtime keeps one handle while the timer server
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct SoftRtc {
    state: Arc<Mutex<RtcState>>,
}

impl SoftRtc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u32 {
        locked(&self.state).now
    }

    pub fn set_now(&self, now: u32) {
        locked(&self.state).now = now;
    }

    pub fn advance(&self, ms: u32) {
        let mut state = locked(&self.state);
        state.now = state.now.wrapping_add(ms);
    }

    /// Absolute tick of the armed alarm
    pub fn alarm(&self) -> Option<u32> {
        locked(&self.state).alarm
    }

    /// Ticks left until the alarm, zero when it is already due
    pub fn time_to_alarm(&self) -> Option<u32> {
        let state = locked(&self.state);
        state.alarm.map(|at| {
            let left = at.wrapping_sub(state.now);
            if left > u32::MAX / 2 {
                0
            } else {
                left
            }
        })
    }

    /// Clears and reports an alarm that has been reached
    pub fn take_due_alarm(&self) -> bool {
        let mut state = locked(&self.state);
        match state.alarm {
            Some(at) if state.now.wrapping_sub(at) <= u32::MAX / 2 => {
                state.alarm = None;
                true
            }
            _ => false,
        }
    }
}

impl RtcDriver for SoftRtc {
    fn set_alarm(&mut self, timeout: u32) {
        let mut state = locked(&self.state);
        state.alarm = Some(state.context.wrapping_add(timeout));
    }

    fn stop_alarm(&mut self) {
        locked(&self.state).alarm = None;
    }

    fn set_timer_context(&mut self) -> u32 {
        let mut state = locked(&self.state);
        state.context = state.now;
        state.context
    }

    fn timer_context(&self) -> u32 {
        locked(&self.state).context
    }

    fn timer_elapsed_time(&self) -> u32 {
        let state = locked(&self.state);
        state.now.wrapping_sub(state.context)
    }

    fn timer_value(&self) -> u32 {
        self.now()
    }

    fn minimum_timeout(&self) -> u32 {
        MIN_ALARM_DELAY
    }

    fn ms_to_tick(&self, ms: u32) -> u32 {
        ms
    }

    fn tick_to_ms(&self, tick: u32) -> u32 {
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_is_relative_to_context() {
        let mut rtc = SoftRtc::new();
        rtc.advance(100);
        rtc.set_timer_context();
        rtc.advance(40);
        rtc.set_alarm(50);
        assert_eq!(rtc.alarm(), Some(150));
        assert_eq!(rtc.time_to_alarm(), Some(10));
        assert_eq!(rtc.timer_elapsed_time(), 40);
    }

    #[test]
    fn test_take_due_alarm() {
        let mut rtc = SoftRtc::new();
        rtc.set_alarm(20);
        rtc.advance(19);
        assert!(!rtc.take_due_alarm());
        rtc.advance(5);
        assert_eq!(rtc.time_to_alarm(), Some(0));
        assert!(rtc.take_due_alarm());
        assert_eq!(rtc.alarm(), None);
    }

    #[test]
    fn test_clones_share_clock() {
        let rtc = SoftRtc::new();
        let other = rtc.clone();
        rtc.advance(7);
        assert_eq!(other.now(), 7);
    }
}
