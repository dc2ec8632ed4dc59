//! Polled USART0 transmitter, 8N1.
//!
//! The bootloader runs with interrupts masked most of the time, so
//! transmission busy-waits on the data register instead of going through
//! an interrupt driven ring buffer.

use core::convert::Infallible;

use avr_device::atmega128a::USART0;

use crate::config::{CPU_FREQ_HZ, UART_BAUD};

const UDRE: u8 = 1 << 5;
const TXEN: u8 = 1 << 3;
// UCSZ1:0 = 0b11, 8 data bits
const CHAR_8BIT: u8 = 0x06;

/// (16_000_000 / (16 * 9600)) - 1 = 103
const UBRR: u16 = (CPU_FREQ_HZ / (16 * UART_BAUD) - 1) as u16;

pub struct Uart {
    _private: (),
}

impl Uart {
    pub fn new() -> Self {
        let [hi, lo] = UBRR.to_be_bytes();
        unsafe {
            let p = USART0::ptr();
            (*p).ubrr0h.write(|w| w.bits(hi));
            (*p).ubrr0l.write(|w| w.bits(lo));
            (*p).ucsr0c.write(|w| w.bits(CHAR_8BIT));
            (*p).ucsr0b.write(|w| w.bits(TXEN));
        }

        Self { _private: () }
    }

    pub fn write_byte(&mut self, byte: u8) {
        unsafe {
            let p = USART0::ptr();
            while (*p).ucsr0a.read().bits() & UDRE == 0 {}
            (*p).udr0.write(|w| w.bits(byte));
        }
    }

    pub fn write_str(&mut self, s: &str) -> Result<(), Infallible> {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}
