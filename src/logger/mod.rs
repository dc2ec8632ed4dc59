//! Leveled console logging on top of `ufmt`

use core::convert::Infallible;
use ufmt::derive::uDebug;
use ufmt::uWrite;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, uDebug)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "[ERR] ",
            Level::Warn => "[WRN] ",
            Level::Info => "[INF] ",
            Level::Debug => "[DBG] ",
        }
    }
}

/// Writer that drops everything, for builds without a console
#[derive(Default)]
pub struct Discard;

impl uWrite for Discard {
    type Error = Infallible;

    fn write_str(&mut self, _s: &str) -> Result<(), Infallible> {
        Ok(())
    }
}

pub struct Logger<W> {
    writer: W,
    max_level: Level,
}

impl<W: uWrite> Logger<W> {
    pub const fn new(writer: W, max_level: Level) -> Self {
        Self { writer, max_level }
    }

    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    /// Writes the level tag and hands out the writer for the message body.
    /// Returns `None` when the level is filtered out.
    #[doc(hidden)]
    pub fn begin(&mut self, level: Level) -> Option<&mut W> {
        if !self.enabled(level) {
            return None;
        }
        self.writer.write_str(level.tag()).ok()?;
        Some(&mut self.writer)
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[macro_export]
macro_rules! log {
    ($logger:expr, $level:expr, $($arg:tt)+) => {
        if let Some(w) = $logger.begin($level) {
            let _ = ufmt::uwriteln!(w, $($arg)+);
        }
    };
}

#[macro_export]
macro_rules! error {
    ($logger:expr, $($arg:tt)+) => { $crate::log!($logger, $crate::logger::Level::Error, $($arg)+) };
}

#[macro_export]
macro_rules! warn {
    ($logger:expr, $($arg:tt)+) => { $crate::log!($logger, $crate::logger::Level::Warn, $($arg)+) };
}

#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)+) => { $crate::log!($logger, $crate::logger::Level::Info, $($arg)+) };
}

#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => { $crate::log!($logger, $crate::logger::Level::Debug, $($arg)+) };
}
