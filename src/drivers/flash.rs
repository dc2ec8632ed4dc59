//! External Flash Memory Driver (W25Q128)
//!
//! Read side of the SPI NOR chip holding the load image slots. The image
//! transfer writes the chip; the bootloader only identifies it, reads it
//! and puts it to sleep before handing over to the application.

use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use ufmt::derive::uDebug;

use crate::hal::flash::ImageSource;

const READ_STATUS: u8 = 0x05;
const READ_DATA: u8 = 0x03;
const POWER_DOWN: u8 = 0xB9;
const RELEASE_POWER_DOWN: u8 = 0xAB;
const JEDEC_ID: u8 = 0x9F;

const STATUS_BUSY: u8 = 0x01;

/// Winbond, SPI NOR, 128 Mbit
const EXPECTED_ID: [u8; 3] = [0xEF, 0x40, 0x18];

const BUSY_POLL_LIMIT: u32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub enum FlashError {
    Spi,
    Pin,
    Timeout,
    WrongId,
}

pub struct SpiFlash<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI, CS, E> SpiFlash<SPI, CS>
where
    SPI: Transfer<u8, Error = E> + Write<u8, Error = E>,
    CS: OutputPin,
{
    /// Wakes the chip and checks its JEDEC id.
    pub fn new(spi: SPI, mut cs: CS) -> Result<Self, FlashError> {
        cs.set_high().map_err(|_| FlashError::Pin)?;
        let mut flash = Self { spi, cs };

        flash.release_power_down()?;
        if flash.read_jedec_id()? != EXPECTED_ID {
            return Err(FlashError::WrongId);
        }
        Ok(flash)
    }

    pub fn read(&mut self, addr: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.wait_busy()?;
        self.select(|spi| {
            spi.write(&command(READ_DATA, addr))?;
            buffer.fill(0x00);
            spi.transfer(buffer)?;
            Ok(())
        })
    }

    pub fn power_down(&mut self) -> Result<(), FlashError> {
        self.wait_busy()?;
        self.select(|spi| spi.write(&[POWER_DOWN]))
    }

    pub fn release_power_down(&mut self) -> Result<(), FlashError> {
        self.select(|spi| spi.write(&[RELEASE_POWER_DOWN]))
    }

    pub fn read_jedec_id(&mut self) -> Result<[u8; 3], FlashError> {
        self.select(|spi| {
            let mut id = [0u8; 3];
            spi.write(&[JEDEC_ID])?;
            spi.transfer(&mut id)?;
            Ok(id)
        })
    }

    fn read_status(&mut self) -> Result<u8, FlashError> {
        self.select(|spi| {
            let mut status = [0u8];
            spi.write(&[READ_STATUS])?;
            spi.transfer(&mut status)?;
            Ok(status[0])
        })
    }

    fn wait_busy(&mut self) -> Result<(), FlashError> {
        let mut polls = 0;
        while self.read_status()? & STATUS_BUSY != 0 {
            polls += 1;
            if polls > BUSY_POLL_LIMIT {
                return Err(FlashError::Timeout);
            }
        }
        Ok(())
    }

    /// Runs one transaction with chip select held low. The chip is
    /// deselected again even when the transaction fails.
    fn select<R>(&mut self, f: impl FnOnce(&mut SPI) -> Result<R, E>) -> Result<R, FlashError> {
        self.cs.set_low().map_err(|_| FlashError::Pin)?;
        let result = f(&mut self.spi);
        self.cs.set_high().map_err(|_| FlashError::Pin)?;
        result.map_err(|_| FlashError::Spi)
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI, CS, E> ImageSource for SpiFlash<SPI, CS>
where
    SPI: Transfer<u8, Error = E> + Write<u8, Error = E>,
    CS: OutputPin,
{
    type Error = FlashError;

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        SpiFlash::read(self, address, buffer)
    }
}

fn command(op: u8, addr: u32) -> [u8; 4] {
    let [_, a2, a1, a0] = addr.to_be_bytes();
    [op, a2, a1, a0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::pin::{Mock as PinMock, State, Transaction as PinTransaction};
    use embedded_hal_mock::spi::{Mock as SpiMock, Transaction as SpiTransaction};
    use std::vec;
    use std::vec::Vec;

    fn cs_cycles(n: usize) -> Vec<PinTransaction> {
        let mut pins = vec![PinTransaction::set(State::High)];
        for _ in 0..n {
            pins.push(PinTransaction::set(State::Low));
            pins.push(PinTransaction::set(State::High));
        }
        pins
    }

    fn id_check(id: [u8; 3]) -> Vec<SpiTransaction> {
        vec![
            SpiTransaction::write(vec![RELEASE_POWER_DOWN]),
            SpiTransaction::write(vec![JEDEC_ID]),
            SpiTransaction::transfer(vec![0, 0, 0], id.to_vec()),
        ]
    }

    #[test]
    fn identifies_the_chip() {
        let mut spi = SpiMock::new(&id_check(EXPECTED_ID));
        let mut cs = PinMock::new(&cs_cycles(2));

        let flash = SpiFlash::new(spi.clone(), cs.clone());
        assert!(flash.is_ok());

        spi.done();
        cs.done();
    }

    #[test]
    fn rejects_unknown_chip() {
        let mut spi = SpiMock::new(&id_check([0xC2, 0x20, 0x18]));
        let mut cs = PinMock::new(&cs_cycles(2));

        assert_eq!(
            SpiFlash::new(spi.clone(), cs.clone()).err(),
            Some(FlashError::WrongId)
        );

        spi.done();
        cs.done();
    }

    #[test]
    fn reads_after_the_chip_goes_idle() {
        let mut expectations = id_check(EXPECTED_ID);
        expectations.extend([
            // busy, then idle
            SpiTransaction::write(vec![READ_STATUS]),
            SpiTransaction::transfer(vec![0], vec![STATUS_BUSY]),
            SpiTransaction::write(vec![READ_STATUS]),
            SpiTransaction::transfer(vec![0], vec![0]),
            SpiTransaction::write(vec![READ_DATA, 0x02, 0x01, 0x80]),
            SpiTransaction::transfer(vec![0; 4], vec![0xAA, 0x01, 0x02, 0x03]),
        ]);
        let mut spi = SpiMock::new(&expectations);
        let mut cs = PinMock::new(&cs_cycles(5));

        let mut flash = SpiFlash::new(spi.clone(), cs.clone()).unwrap();
        // stale content is cleared before clocking out
        let mut buffer = [0x55u8; 4];
        ImageSource::read(&mut flash, 0x02_0180, &mut buffer).unwrap();
        assert_eq!(buffer, [0xAA, 0x01, 0x02, 0x03]);

        spi.done();
        cs.done();
    }

    #[test]
    fn sleeps_before_handover() {
        let mut expectations = id_check(EXPECTED_ID);
        expectations.extend([
            SpiTransaction::write(vec![READ_STATUS]),
            SpiTransaction::transfer(vec![0], vec![0]),
            SpiTransaction::write(vec![POWER_DOWN]),
        ]);
        let mut spi = SpiMock::new(&expectations);
        let mut cs = PinMock::new(&cs_cycles(4));

        let mut flash = SpiFlash::new(spi.clone(), cs.clone()).unwrap();
        flash.power_down().unwrap();
        drop(flash.release());

        spi.done();
        cs.done();
    }
}
