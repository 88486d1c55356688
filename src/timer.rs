//! Named request timers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimerInfo {
    /// Accumulated time in milliseconds.
    pub time_ms: f64,
    /// Number of times the timer was started.
    pub count: u32,
}

#[derive(Debug, Default)]
struct Timer {
    start: Option<Instant>,
    elapsed: Duration,
    count: u32,
}

#[derive(Debug, Default)]
pub struct Timers {
    timers: HashMap<String, Timer>,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a timer. Time accumulates across start/stop pairs.
    pub fn start(&mut self, name: &str) {
        let timer = self.timers.entry(name.to_string()).or_default();
        timer.start = Some(Instant::now());
        timer.count += 1;
    }

    /// Milliseconds accumulated so far, including a running interval.
    pub fn read(&self, name: &str) -> Option<f64> {
        self.timers.get(name).map(|timer| {
            let running = timer.start.map(|s| s.elapsed()).unwrap_or_default();
            millis(timer.elapsed + running)
        })
    }

    pub fn stop(&mut self, name: &str) -> Option<TimerInfo> {
        let timer = self.timers.get_mut(name)?;
        if let Some(start) = timer.start.take() {
            timer.elapsed += start.elapsed();
        }
        Some(TimerInfo {
            time_ms: millis(timer.elapsed),
            count: timer.count,
        })
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.timers.get(name).is_some_and(|t| t.start.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_timer() {
        let mut timers = Timers::new();
        assert_eq!(timers.read("page"), None);
        assert_eq!(timers.stop("page"), None);
    }

    #[test]
    fn test_start_stop_accumulates() {
        let mut timers = Timers::new();
        timers.start("page");
        assert!(timers.is_running("page"));
        std::thread::sleep(Duration::from_millis(2));
        let first = timers.stop("page").unwrap();
        assert!(!timers.is_running("page"));
        assert!(first.time_ms >= 2.0);
        assert_eq!(first.count, 1);

        timers.start("page");
        let second = timers.stop("page").unwrap();
        assert_eq!(second.count, 2);
        assert!(second.time_ms >= first.time_ms);
    }
}
