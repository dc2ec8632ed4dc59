//! Compare-match timer hardware behind the periodic trigger.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    Periodic,
    OneShot,
}

/// A bank of identical compare-match timer channels.
pub trait TimerHardware {
    /// Timer input clock before division
    const CLOCK_HZ: u32;
    /// Available clock dividers; the index is the hardware prescaler selector
    const DIVIDERS: &'static [u32];
    /// Counter range (65 536 for a 16-bit counter)
    const MAX_TICKS: u32;

    /// Starts `channel` counting to `compare` on the clock divided by
    /// `DIVIDERS[divider]`, interrupting on every match.
    fn start(&mut self, channel: usize, divider: usize, compare: u16);

    fn stop(&mut self, channel: usize);
}

/// Finds the first divider able to reach `frequency_hz` and the compare
/// value for it. Returns `None` when the rate is out of reach.
pub fn select_divider(
    clock_hz: u32,
    dividers: &[u32],
    max_ticks: u32,
    frequency_hz: u32,
) -> Option<(usize, u16)> {
    if frequency_hz == 0 {
        return None;
    }

    dividers.iter().enumerate().find_map(|(index, &divider)| {
        let tick_hz = clock_hz / divider;
        if frequency_hz > tick_hz / max_ticks {
            let compare = tick_hz / frequency_hz;
            if compare == 0 || compare > u16::MAX as u32 {
                return None;
            }
            Some((index, compare as u16))
        } else {
            None
        }
    })
}

/// Finds the first divider whose counter range covers `period_us` and the
/// compare value for it. Returns `None` when the period is out of reach.
pub fn select_period(
    clock_hz: u32,
    dividers: &[u32],
    max_ticks: u32,
    period_us: u32,
) -> Option<(usize, u16)> {
    let limit = max_ticks.min(u16::MAX as u32) as u64;

    dividers.iter().enumerate().find_map(|(index, &divider)| {
        let ticks = (clock_hz / divider) as u64 * period_us as u64 / 1_000_000;
        if (1..=limit).contains(&ticks) {
            Some((index, ticks as u16))
        } else {
            None
        }
    })
}

#[cfg(target_arch = "avr")]
pub use self::avr::Timers;

#[cfg(target_arch = "avr")]
mod avr {
    use avr_device::atmega128a::{TC1, TC3};

    use super::TimerHardware;
    use crate::config::CPU_FREQ_HZ;

    const WGM_CTC: u8 = 1 << 3;
    // OCIE1A in TIMSK and OCIE3A in ETIMSK sit on the same bit
    const OCIE_A: u8 = 1 << 4;
    const CS_MASK: u8 = 0x07;

    /// The two 16-bit timers, TC1 and TC3, in CTC mode on output compare A.
    pub struct Timers {
        _private: (),
    }

    impl Timers {
        pub const COUNT: usize = 2;

        pub fn new() -> Self {
            unsafe {
                let tc1 = TC1::ptr();
                (*tc1).tccr1b.write(|w| w.bits(0));
                (*tc1).tccr1a.write(|w| w.bits(0));

                let tc3 = TC3::ptr();
                (*tc3).tccr3b.write(|w| w.bits(0));
                (*tc3).tccr3a.write(|w| w.bits(0));
            }
            Self { _private: () }
        }
    }

    impl Default for Timers {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TimerHardware for Timers {
        const CLOCK_HZ: u32 = CPU_FREQ_HZ;
        const DIVIDERS: &'static [u32] = &[1, 8, 64, 256, 1024];
        const MAX_TICKS: u32 = 65_536;

        fn start(&mut self, channel: usize, divider: usize, compare: u16) {
            let top = compare.saturating_sub(1);
            // CS selector 1..=5 maps to DIVIDERS[0..=4]
            let clock = WGM_CTC | ((divider as u8 + 1) & CS_MASK);

            unsafe {
                match channel {
                    0 => {
                        let p = TC1::ptr();
                        (*p).tccr1b.write(|w| w.bits(0));
                        (*p).tcnt1.write(|w| w.bits(0));
                        (*p).ocr1a.write(|w| w.bits(top));
                        (*p).timsk.modify(|r, w| w.bits(r.bits() | OCIE_A));
                        (*p).tccr1b.write(|w| w.bits(clock));
                    }
                    1 => {
                        let p = TC3::ptr();
                        (*p).tccr3b.write(|w| w.bits(0));
                        (*p).tcnt3.write(|w| w.bits(0));
                        (*p).ocr3a.write(|w| w.bits(top));
                        (*p).etimsk.modify(|r, w| w.bits(r.bits() | OCIE_A));
                        (*p).tccr3b.write(|w| w.bits(clock));
                    }
                    _ => {}
                }
            }
        }

        fn stop(&mut self, channel: usize) {
            unsafe {
                match channel {
                    0 => {
                        let p = TC1::ptr();
                        (*p).tccr1b.modify(|r, w| w.bits(r.bits() & !CS_MASK));
                        (*p).timsk.modify(|r, w| w.bits(r.bits() & !OCIE_A));
                    }
                    1 => {
                        let p = TC3::ptr();
                        (*p).tccr3b.modify(|r, w| w.bits(r.bits() & !CS_MASK));
                        (*p).etimsk.modify(|r, w| w.bits(r.bits() & !OCIE_A));
                    }
                    _ => {}
                }
            }
        }
    }
}
