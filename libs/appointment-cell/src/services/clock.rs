// libs/appointment-cell/src/services/clock.rs
use chrono::{DateTime, Utc};

/// Source of "now" for lifecycle stamps and queue visibility.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
