//! Periodic trigger: hands out timer channels and dispatches their callbacks.
//!
//! Each channel slot of the arena is either free or bound to one callback
//! at one rate. The timer interrupt handler forwards to `on_interrupt`.

use ufmt::derive::uDebug;

use crate::hal::timer::{select_divider, select_period, TimerHardware, TimerMode};

/// Callback run from interrupt context with the firing channel.
pub type Callback = fn(Channel);

#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub struct Channel(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub enum TimerError {
    /// Every channel is already bound
    NoChannel,
    /// No divider reaches the requested rate
    UnsupportedRate,
    /// A channel already runs at this rate in this mode
    RateInUse,
    InvalidChannel,
}

#[derive(Clone, Copy)]
struct Binding {
    divider: usize,
    compare: u16,
    mode: TimerMode,
    callback: Callback,
}

pub struct Trigger<T, const N: usize> {
    timers: T,
    slots: [Option<Binding>; N],
}

impl<T: TimerHardware, const N: usize> Trigger<T, N> {
    pub fn new(timers: T) -> Self {
        Self {
            timers,
            slots: [None; N],
        }
    }

    /// Calls `callback` at `frequency_hz` until the channel is stopped.
    pub fn create_periodic(
        &mut self,
        frequency_hz: u32,
        callback: Callback,
    ) -> Result<Channel, TimerError> {
        let setting = select_divider(T::CLOCK_HZ, T::DIVIDERS, T::MAX_TICKS, frequency_hz);
        self.create(setting, TimerMode::Periodic, callback)
    }

    /// Calls `callback` once after `period_us`.
    pub fn create_one_shot(
        &mut self,
        period_us: u32,
        callback: Callback,
    ) -> Result<Channel, TimerError> {
        let setting = select_period(T::CLOCK_HZ, T::DIVIDERS, T::MAX_TICKS, period_us);
        self.create(setting, TimerMode::OneShot, callback)
    }

    /// Binds a free channel to the `(divider, compare)` setting. Two
    /// channels never share a setting in the same mode.
    fn create(
        &mut self,
        setting: Option<(usize, u16)>,
        mode: TimerMode,
        callback: Callback,
    ) -> Result<Channel, TimerError> {
        let (divider, compare) = setting.ok_or(TimerError::UnsupportedRate)?;

        let taken = self
            .slots
            .iter()
            .flatten()
            .any(|b| b.divider == divider && b.compare == compare && b.mode == mode);
        if taken {
            return Err(TimerError::RateInUse);
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TimerError::NoChannel)?;

        self.slots[index] = Some(Binding {
            divider,
            compare,
            mode,
            callback,
        });
        self.timers.start(index, divider, compare);

        Ok(Channel(index))
    }

    /// Releases `channel`. Stopping a free channel is a no-op.
    pub fn stop(&mut self, channel: Channel) -> Result<(), TimerError> {
        let slot = self
            .slots
            .get_mut(channel.0)
            .ok_or(TimerError::InvalidChannel)?;

        if slot.take().is_some() {
            self.timers.stop(channel.0);
        }
        Ok(())
    }

    /// Releases every channel.
    pub fn stop_all(&mut self) {
        for index in 0..N {
            let _ = self.stop(Channel(index));
        }
    }

    pub fn is_counting(&self, channel: Channel) -> Result<bool, TimerError> {
        self.slots
            .get(channel.0)
            .map(Option::is_some)
            .ok_or(TimerError::InvalidChannel)
    }

    pub const fn channel_count(&self) -> usize {
        N
    }

    /// Compare-match interrupt entry for `channel`.
    pub fn on_interrupt(&mut self, channel: Channel) {
        let Some(Some(binding)) = self.slots.get(channel.0).copied() else {
            return;
        };

        (binding.callback)(channel);

        if binding.mode == TimerMode::OneShot {
            let _ = self.stop(channel);
        }
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }
}
