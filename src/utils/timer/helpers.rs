//! Support code for the [`timeout`](super::timeout) and [`should_timeout`](super::should_timeout)
//! attributes.

use std::{
    future::Future,
    pin::pin,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use futures::future::{select, Either};
use parse_display::Display;

use super::sleep;

#[derive(Debug, Display, PartialEq, Eq)]
#[display("should timeout")]
pub struct ShouldTimeoutError {
    _private: (),
}
impl ShouldTimeoutError {
    fn new() -> Self {
        Self { _private: () }
    }
}

impl std::error::Error for ShouldTimeoutError {}

#[doc(hidden)]
pub async fn with_should_timeout_async(
    fut: impl Future<Output = ()>,
    duration: Duration,
) -> Result<(), ShouldTimeoutError> {
    match select(pin!(fut), pin!(sleep(duration))).await {
        Either::Left(((), _)) => Err(ShouldTimeoutError::new()),
        Either::Right(((), _)) => Ok(()),
    }
}

#[doc(hidden)]
pub fn with_should_timeout(
    f: impl FnOnce() + Send + 'static,
    duration: Duration,
) -> Result<(), ShouldTimeoutError> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        f();
        let _ = tx.send(());
    });
    match rx.recv_timeout(duration) {
        Err(RecvTimeoutError::Timeout) => Ok(()),
        Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(ShouldTimeoutError::new()),
    }
}

/// A value usable as the argument of the timeout attributes.
pub trait IntoTimeoutDuration {
    fn into_timeout_duration(self) -> Duration;
}
impl IntoTimeoutDuration for Duration {
    fn into_timeout_duration(self) -> Duration {
        self
    }
}
impl IntoTimeoutDuration for &str {
    fn into_timeout_duration(self) -> Duration {
        parse_duration(self).unwrap_or_else(|e| panic!("{e}"))
    }
}
impl IntoTimeoutDuration for String {
    fn into_timeout_duration(self) -> Duration {
        self.as_str().into_timeout_duration()
    }
}
impl IntoTimeoutDuration for &String {
    fn into_timeout_duration(self) -> Duration {
        self.as_str().into_timeout_duration()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display("{0}")]
pub struct ParseDurationError(&'static str);

impl std::error::Error for ParseDurationError {}

/// Parses `"250ms"`, `"1.5s"` or `"2m"`.
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ParseDurationError("duration literal is empty"));
    }
    let (number, unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, Unit::Millis)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, Unit::Secs)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, Unit::Mins)
    } else {
        return Err(ParseDurationError("invalid duration literal"));
    };
    if number.is_empty() {
        return Err(ParseDurationError("invalid duration literal"));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| ParseDurationError("invalid duration number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseDurationError(
            "duration must be non-negative and finite",
        ));
    }
    Ok(Duration::from_secs_f64(unit.to_secs(value)))
}

#[derive(Clone, Copy)]
enum Unit {
    Millis,
    Secs,
    Mins,
}
impl Unit {
    fn to_secs(self, value: f64) -> f64 {
        match self {
            Unit::Millis => value / 1000.0,
            Unit::Secs => value,
            Unit::Mins => value * 60.0,
        }
    }
}
