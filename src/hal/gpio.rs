use core::convert::Infallible;

use avr_device::atmega128a::PORTB;
use embedded_hal::digital::v2::OutputPin;

/// Push-pull output on PORTB bit `PIN`.
pub struct PortBOutput<const PIN: u8> {
    _private: (),
}

impl<const PIN: u8> PortBOutput<PIN> {
    /// Configures the pin as an output, driven high.
    pub fn new() -> Self {
        unsafe {
            let p = PORTB::ptr();
            (*p).portb.modify(|r, w| w.bits(r.bits() | (1 << PIN)));
            (*p).ddrb.modify(|r, w| w.bits(r.bits() | (1 << PIN)));
        }
        Self { _private: () }
    }
}

impl<const PIN: u8> Default for PortBOutput<PIN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const PIN: u8> OutputPin for PortBOutput<PIN> {
    type Error = Infallible;

    #[inline]
    fn set_low(&mut self) -> Result<(), Infallible> {
        unsafe {
            (*PORTB::ptr()).portb.modify(|r, w| w.bits(r.bits() & !(1 << PIN)));
        }
        Ok(())
    }

    #[inline]
    fn set_high(&mut self) -> Result<(), Infallible> {
        unsafe {
            (*PORTB::ptr()).portb.modify(|r, w| w.bits(r.bits() | (1 << PIN)));
        }
        Ok(())
    }
}
