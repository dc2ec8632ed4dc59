pub mod trigger;

pub use trigger::{Callback, Channel, TimerError, Trigger};
