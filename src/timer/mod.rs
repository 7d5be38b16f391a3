//! Software timer service
//!
//! Timer events live in an arena owned by [`TimerServer`] and are referred to
//! by [`TimerId`]. Running events form a singly linked list threaded through
//! the arena, sorted by ascending deadline. Only the head of the list has the
//! RTC alarm armed; [`TimerServer::irq_handler`] is called when that alarm
//! fires.

pub mod rtc;

pub use rtc::{RtcDriver, SoftRtc};

use tracing::trace;

/// Stable reference to a timer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
    #[default]
    OneShot,
    /// Restarted with its reload value after each expiry
    Periodic,
}

/// Expiry callback. Receives the server so it can start or stop timers,
/// its own included.
pub type TimerCallback = Box<dyn FnMut(&mut TimerServer) + Send>;

struct TimerEvent {
    /// Deadline in ticks, relative to the RTC timer context
    timestamp: u32,
    reload: u32,
    running: bool,
    next_to_expire: bool,
    mode: TimerMode,
    callback: Option<TimerCallback>,
    next: Option<TimerId>,
}

pub struct TimerServer {
    rtc: Box<dyn RtcDriver>,
    events: Vec<TimerEvent>,
    head: Option<TimerId>,
}

impl TimerServer {
    pub fn new(rtc: Box<dyn RtcDriver>) -> Self {
        Self {
            rtc,
            events: Vec::new(),
            head: None,
        }
    }

    /// Allocates a stopped one-shot timer
    pub fn create(&mut self, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.events.len());
        self.events.push(TimerEvent {
            timestamp: 0,
            reload: 0,
            running: false,
            next_to_expire: false,
            mode: TimerMode::OneShot,
            callback: Some(callback),
            next: None,
        });
        id
    }

    /// Re-initializes an existing timer: stopped, zero duration, new callback
    pub fn init(&mut self, id: TimerId, callback: TimerCallback) {
        self.stop(id);
        let event = &mut self.events[id.0];
        event.timestamp = 0;
        event.reload = 0;
        event.mode = TimerMode::OneShot;
        event.callback = Some(callback);
    }

    pub fn set_mode(&mut self, id: TimerId, mode: TimerMode) {
        self.events[id.0].mode = mode;
    }

    /// Stops the timer and sets its duration, never below the RTC minimum
    pub fn set_value(&mut self, id: TimerId, ms: u32) {
        self.stop(id);
        let ticks = self.rtc.ms_to_tick(ms).max(self.rtc.minimum_timeout());
        let event = &mut self.events[id.0];
        event.timestamp = ticks;
        event.reload = ticks;
    }

    /// Duration the timer restarts with
    pub fn reload_ms(&self, id: TimerId) -> u32 {
        self.rtc.tick_to_ms(self.events[id.0].reload)
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.events[id.0].running
    }

    /// Inserts the timer into the running list. Starting a timer already in
    /// the list does nothing.
    pub fn start(&mut self, id: TimerId) {
        if self.exists(id) {
            return;
        }
        {
            let event = &mut self.events[id.0];
            event.timestamp = event.reload;
            event.running = true;
            event.next_to_expire = false;
        }

        match self.head {
            None => {
                self.rtc.set_timer_context();
                self.insert_new_head(id);
            }
            Some(head) => {
                let elapsed = self.rtc.timer_elapsed_time();
                let timestamp = self.events[id.0].timestamp.wrapping_add(elapsed);
                self.events[id.0].timestamp = timestamp;
                if timestamp < self.events[head.0].timestamp {
                    self.insert_new_head(id);
                } else {
                    self.insert(id);
                }
            }
        }
        trace!("Timer {:?} started, deadline {}", id, self.events[id.0].timestamp);
    }

    /// Unlinks the timer. Stopping a timer that is not running does nothing.
    pub fn stop(&mut self, id: TimerId) {
        let Some(head) = self.head else {
            return;
        };
        self.events[id.0].running = false;

        if head == id {
            let next = self.events[head.0].next;
            self.events[head.0].next = None;
            if self.events[head.0].next_to_expire {
                self.events[head.0].next_to_expire = false;
                self.head = next;
                match next {
                    Some(next) => self.set_timeout(next),
                    None => self.rtc.stop_alarm(),
                }
            } else {
                self.head = next;
            }
            return;
        }

        let mut prev = head;
        let mut cur = self.events[head.0].next;
        while let Some(c) = cur {
            if c == id {
                self.events[prev.0].next = self.events[c.0].next;
                self.events[c.0].next = None;
                return;
            }
            prev = c;
            cur = self.events[c.0].next;
        }
    }

    pub fn reset(&mut self, id: TimerId) {
        self.stop(id);
        self.start(id);
    }

    /// Current time in milliseconds
    pub fn current_time(&self) -> u32 {
        self.rtc.tick_to_ms(self.rtc.timer_value())
    }

    /// Milliseconds elapsed since `past`, a value returned by
    /// [`TimerServer::current_time`]. Zero maps to zero.
    pub fn elapsed_time(&self, past: u32) -> u32 {
        if past == 0 {
            return 0;
        }
        let now = self.rtc.timer_value();
        let past = self.rtc.ms_to_tick(past);
        self.rtc.tick_to_ms(now.wrapping_sub(past))
    }

    /// Alarm handler: expires the head and every other event whose deadline
    /// has passed, then re-arms the alarm for the new head
    pub fn irq_handler(&mut self) {
        let old = self.rtc.timer_context();
        let now = self.rtc.set_timer_context();
        let delta = now.wrapping_sub(old);

        let mut cur = self.head;
        while let Some(c) = cur {
            let event = &mut self.events[c.0];
            event.timestamp = event.timestamp.saturating_sub(delta);
            cur = event.next;
        }

        if let Some(head) = self.head {
            self.expire_head(head);
        }

        while let Some(head) = self.head {
            if self.events[head.0].timestamp > self.rtc.timer_elapsed_time() {
                break;
            }
            self.expire_head(head);
        }

        if let Some(head) = self.head {
            if !self.events[head.0].next_to_expire {
                self.set_timeout(head);
            }
        }
    }

    fn expire_head(&mut self, id: TimerId) {
        {
            let event = &mut self.events[id.0];
            self.head = event.next;
            event.next = None;
            event.running = false;
            event.next_to_expire = false;
        }
        trace!("Timer {:?} expired", id);

        if let Some(mut callback) = self.events[id.0].callback.take() {
            callback(self);
            // The callback may have re-initialized the timer with a new one
            let slot = &mut self.events[id.0].callback;
            if slot.is_none() {
                *slot = Some(callback);
            }
        }

        if self.events[id.0].mode == TimerMode::Periodic && !self.exists(id) {
            self.start(id);
        }
    }

    fn exists(&self, id: TimerId) -> bool {
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == id {
                return true;
            }
            cur = self.events[c.0].next;
        }
        false
    }

    fn insert_new_head(&mut self, id: TimerId) {
        if let Some(old) = self.head {
            self.events[old.0].next_to_expire = false;
        }
        self.events[id.0].next = self.head;
        self.head = Some(id);
        self.set_timeout(id);
    }

    fn insert(&mut self, id: TimerId) {
        let Some(head) = self.head else {
            return;
        };
        let timestamp = self.events[id.0].timestamp;
        let mut cur = head;
        while let Some(next) = self.events[cur.0].next {
            if timestamp > self.events[next.0].timestamp {
                cur = next;
            } else {
                self.events[cur.0].next = Some(id);
                self.events[id.0].next = Some(next);
                return;
            }
        }
        self.events[cur.0].next = Some(id);
        self.events[id.0].next = None;
    }

    fn set_timeout(&mut self, id: TimerId) {
        let min_ticks = self.rtc.minimum_timeout();
        let earliest = self.rtc.timer_elapsed_time().wrapping_add(min_ticks);
        let event = &mut self.events[id.0];
        event.next_to_expire = true;
        if event.timestamp < earliest {
            event.timestamp = earliest;
        }
        self.rtc.set_alarm(event.timestamp);
    }
}

/// Moves `rtc` forward to `target`, running the alarm handler at every alarm
/// reached on the way
pub fn run_until(timers: &mut TimerServer, rtc: &SoftRtc, target: u32) {
    loop {
        let remaining = target.wrapping_sub(rtc.now());
        if remaining == 0 || remaining > u32::MAX / 2 {
            return;
        }
        match rtc.time_to_alarm() {
            Some(left) if left <= remaining => {
                rtc.advance(left);
                if rtc.take_due_alarm() {
                    timers.irq_handler();
                }
            }
            _ => rtc.advance(remaining),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn server() -> (TimerServer, SoftRtc) {
        let rtc = SoftRtc::new();
        (TimerServer::new(Box::new(rtc.clone())), rtc)
    }

    fn recorder(log: &Arc<Mutex<Vec<(&'static str, u32)>>>, name: &'static str, rtc: &SoftRtc) -> TimerCallback {
        let log = log.clone();
        let rtc = rtc.clone();
        Box::new(move |_: &mut TimerServer| log.lock().unwrap().push((name, rtc.now())))
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let (mut timers, rtc) = server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = timers.create(recorder(&log, "a", &rtc));
        let b = timers.create(recorder(&log, "b", &rtc));
        let c = timers.create(recorder(&log, "c", &rtc));
        timers.set_value(a, 300);
        timers.set_value(b, 100);
        timers.set_value(c, 200);
        timers.start(a);
        timers.start(b);
        timers.start(c);

        run_until(&mut timers, &rtc, 1000);
        assert_eq!(*log.lock().unwrap(), vec![("b", 100), ("c", 200), ("a", 300)]);
        assert!(!timers.is_running(a));
    }

    #[test]
    fn test_start_accounts_for_elapsed_context() {
        let (mut timers, rtc) = server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = timers.create(recorder(&log, "a", &rtc));
        let b = timers.create(recorder(&log, "b", &rtc));
        timers.set_value(a, 100);
        timers.set_value(b, 50);
        timers.start(a);
        run_until(&mut timers, &rtc, 70);
        timers.start(b);

        run_until(&mut timers, &rtc, 500);
        assert_eq!(*log.lock().unwrap(), vec![("a", 100), ("b", 120)]);
    }

    #[test]
    fn test_stop_head_rearms_next() {
        let (mut timers, rtc) = server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = timers.create(recorder(&log, "a", &rtc));
        let b = timers.create(recorder(&log, "b", &rtc));
        timers.set_value(a, 10);
        timers.set_value(b, 40);
        timers.start(a);
        timers.start(b);
        timers.stop(a);
        // Stopping twice is harmless
        timers.stop(a);
        assert_eq!(rtc.alarm(), Some(40));

        run_until(&mut timers, &rtc, 100);
        assert_eq!(*log.lock().unwrap(), vec![("b", 40)]);
    }

    #[test]
    fn test_stop_last_timer_clears_alarm() {
        let (mut timers, rtc) = server();
        let a = timers.create(Box::new(|_: &mut TimerServer| {}));
        timers.set_value(a, 10);
        timers.start(a);
        timers.stop(a);
        assert_eq!(rtc.alarm(), None);
    }

    #[test]
    fn test_minimum_timeout_applies() {
        let (mut timers, _rtc) = server();
        let a = timers.create(Box::new(|_: &mut TimerServer| {}));
        timers.set_value(a, 0);
        assert_eq!(timers.reload_ms(a), rtc::MIN_ALARM_DELAY);
    }

    #[test]
    fn test_expired_entries_fire_together() {
        let (mut timers, rtc) = server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = timers.create(recorder(&log, "a", &rtc));
        let b = timers.create(recorder(&log, "b", &rtc));
        timers.set_value(a, 10);
        timers.set_value(b, 12);
        timers.start(a);
        timers.start(b);

        // Alarm serviced late: both deadlines have passed
        rtc.advance(30);
        assert!(rtc.take_due_alarm());
        timers.irq_handler();
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_callback_can_start_other_timer() {
        let (mut timers, rtc) = server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let second = timers.create(recorder(&log, "second", &rtc));
        timers.set_value(second, 25);
        let first = timers.create(Box::new(move |t: &mut TimerServer| t.start(second)));
        timers.set_value(first, 10);
        timers.start(first);

        run_until(&mut timers, &rtc, 100);
        assert_eq!(*log.lock().unwrap(), vec![("second", 35)]);
    }

    #[test]
    fn test_periodic_timer_reloads() {
        let (mut timers, rtc) = server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let tick = timers.create(recorder(&log, "tick", &rtc));
        timers.set_value(tick, 100);
        timers.set_mode(tick, TimerMode::Periodic);
        timers.start(tick);

        run_until(&mut timers, &rtc, 350);
        assert_eq!(
            *log.lock().unwrap(),
            vec![("tick", 100), ("tick", 200), ("tick", 300)]
        );
        assert!(timers.is_running(tick));
    }

    #[test]
    fn test_elapsed_time() {
        let (timers, rtc) = server();
        assert_eq!(timers.elapsed_time(0), 0);
        rtc.advance(500);
        let saved = timers.current_time();
        rtc.advance(120);
        assert_eq!(timers.elapsed_time(saved), 120);
    }

    #[test]
    fn test_reset_restarts_full_duration() {
        let (mut timers, rtc) = server();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = timers.create(recorder(&log, "a", &rtc));
        timers.set_value(a, 100);
        timers.start(a);
        run_until(&mut timers, &rtc, 60);
        timers.reset(a);

        run_until(&mut timers, &rtc, 500);
        assert_eq!(*log.lock().unwrap(), vec![("a", 160)]);
    }
}
