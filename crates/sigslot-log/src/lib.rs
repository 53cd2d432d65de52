//! Rate-limited diagnostic logging.
//!
//! Hot paths of the event loop (queue overflow, messages for objects that are
//! gone) can repeat the same diagnostic thousands of times per second. The
//! helpers here forward to the [`log`] facade but only let through one call in
//! `n` for a given message template. Counting is keyed by the template alone,
//! never by the formatted arguments, so `"queue {} is full"` is a single
//! counter no matter which queue overflowed.
//!
//! The counters live in one [`Throttle`] table per process, created on first
//! use and shared by every call site through [`throttle()`].

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;

pub use log::Level;

/// Counter table for rate-limited messages.
#[derive(Debug, Default)]
pub struct Throttle {
    history: Mutex<HashMap<&'static str, u64>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one occurrence of `key`.
    ///
    /// Returns the number of earlier occurrences when this one should be
    /// logged (the first call, then every `n`th), `None` otherwise. `n` of 0
    /// or 1 lets every call through.
    pub fn check(&self, key: &'static str, n: u64) -> Option<u64> {
        let mut history = self.history.lock();
        let count = history.entry(key).or_insert(0);
        let seen = *count;
        *count += 1;

        if n <= 1 || seen % n == 0 {
            Some(seen)
        } else {
            None
        }
    }

    /// How many times `key` has been counted so far.
    pub fn count(&self, key: &str) -> u64 {
        self.history.lock().get(key).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.history.lock().clear();
    }
}

/// Process-wide counter table used by the `*_every_n!` macros.
pub fn throttle() -> &'static Throttle {
    static THROTTLE: OnceLock<Throttle> = OnceLock::new();
    THROTTLE.get_or_init(Throttle::new)
}

/// Logs `args` at `level` once every `n` calls sharing the same `key`.
///
/// Repeated messages carry a `(k times)` suffix so the log still shows how
/// often the condition occurred.
pub fn log_every_n(
    target: &str,
    level: Level,
    n: u64,
    key: &'static str,
    args: fmt::Arguments<'_>,
) {
    if let Some(seen) = throttle().check(key, n) {
        if seen > 1 {
            log::log!(target: target, level, "{args} ({seen} times)");
        } else {
            log::log!(target: target, level, "{args}");
        }
    }
}

#[macro_export]
macro_rules! warn_every_n {
    ($n:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::log_every_n(
            module_path!(),
            $crate::Level::Warn,
            $n,
            $fmt,
            format_args!($fmt $(, $arg)*),
        )
    };
}

#[macro_export]
macro_rules! debug_every_n {
    ($n:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::log_every_n(
            module_path!(),
            $crate::Level::Debug,
            $n,
            $fmt,
            format_args!($fmt $(, $arg)*),
        )
    };
}

#[macro_export]
macro_rules! error_every_n {
    ($n:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::log_every_n(
            module_path!(),
            $crate::Level::Error,
            $n,
            $fmt,
            format_args!($fmt $(, $arg)*),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_and_every_nth_pass() {
        let throttle = Throttle::new();
        let passed: Vec<u64> = (0..25)
            .filter_map(|_| throttle.check("queue full", 10))
            .collect();

        assert_eq!(passed, vec![0, 10, 20]);
        assert_eq!(throttle.count("queue full"), 25);
    }

    #[test]
    fn keys_are_counted_separately() {
        let throttle = Throttle::new();
        assert_eq!(throttle.check("a", 5), Some(0));
        assert_eq!(throttle.check("b", 5), Some(0));
        assert_eq!(throttle.check("a", 5), None);
        assert_eq!(throttle.count("a"), 2);
        assert_eq!(throttle.count("b"), 1);
        assert_eq!(throttle.count("c"), 0);
    }

    #[test]
    fn n_of_one_never_skips() {
        let throttle = Throttle::new();
        assert!((0..5).all(|_| throttle.check("x", 1).is_some()));

        throttle.reset();
        assert_eq!(throttle.count("x"), 0);
    }

    #[test]
    fn macros_count_by_template() {
        for i in 0..3 {
            warn_every_n!(100, "macro template {} used", i);
        }
        assert_eq!(throttle().count("macro template {} used"), 3);
    }
}
