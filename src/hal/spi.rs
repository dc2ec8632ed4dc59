//! SPI (Serial Peripheral Interface) master on PORTB
//!
//! Exposed through the `embedded-hal` blocking traits so the flash driver
//! stays portable.

use core::convert::Infallible;

use avr_device::atmega128a::{PORTB, SPI};
use embedded_hal::blocking::spi::{Transfer, Write};

const SPE: u8 = 1 << 6;
const MSTR: u8 = 1 << 4;
const SPIF: u8 = 1 << 7;
const SPI2X: u8 = 1 << 0;

// PB0 must be an output or a low level drops the peripheral out of master mode
const SS: u8 = 1 << 0;
const SCK: u8 = 1 << 1;
const MOSI: u8 = 1 << 2;

/// SPI clock prescaler options
#[derive(Clone, Copy)]
#[repr(u8)]
pub enum SpiPrescaler {
    Div4 = 0,
    Div16 = 1,
    Div64 = 2,
    Div128 = 3,
}

pub struct Spi {
    _private: (),
}

impl Spi {
    /// Mode 0, MSB first.
    pub fn new(prescaler: SpiPrescaler) -> Self {
        unsafe {
            (*PORTB::ptr()).ddrb.modify(|r, w| w.bits(r.bits() | SS | SCK | MOSI));

            let p = SPI::ptr();
            (*p).spcr.write(|w| w.bits(SPE | MSTR | prescaler as u8));
            (*p).spsr.modify(|r, w| w.bits(r.bits() & !SPI2X));
        }

        Self { _private: () }
    }

    /// Transfer a single byte
    pub fn transfer_byte(&mut self, byte: u8) -> u8 {
        unsafe {
            let p = SPI::ptr();
            (*p).spdr.write(|w| w.bits(byte));
            while (*p).spsr.read().bits() & SPIF == 0 {}
            (*p).spdr.read().bits()
        }
    }
}

impl Transfer<u8> for Spi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Infallible> {
        for word in words.iter_mut() {
            *word = self.transfer_byte(*word);
        }
        Ok(words)
    }
}

impl Write<u8> for Spi {
    type Error = Infallible;

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        for &word in words {
            self.transfer_byte(word);
        }
        Ok(())
    }
}
