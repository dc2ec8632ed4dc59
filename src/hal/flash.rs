//! Flash access seams used by the bootloader core.
//!
//! `ImageSource` is anything an image can be read back from: the external
//! SPI flash holding load images, or on-chip flash holding the installed
//! application. `FlashProgrammer` erases and writes on-chip flash.

use ufmt::derive::uDebug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, uDebug)]
pub enum ProgramError {
    EraseFailed { block: u16 },
    WriteFailed { address: u32 },
    OutOfRange,
}

/// Random access read of image bytes.
pub trait ImageSource {
    type Error;

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), Self::Error>;
}

impl<T: ImageSource + ?Sized> ImageSource for &mut T {
    type Error = T::Error;

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), Self::Error> {
        (**self).read(address, buffer)
    }
}

/// Block erase and write of on-chip flash.
///
/// Geometry stays with the implementor: the core only hands over block
/// indices and byte ranges inside the application region.
pub trait FlashProgrammer {
    fn erase_block(&mut self, block: u16) -> Result<(), ProgramError>;

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), ProgramError>;
}

#[cfg(target_arch = "avr")]
pub use self::spm::OnChipFlash;

#[cfg(target_arch = "avr")]
mod spm {
    use core::arch::asm;
    use core::convert::Infallible;

    use avr_device::atmega128a::{BOOT_LOAD, CPU};

    use super::{FlashProgrammer, ImageSource, ProgramError};
    use crate::config::{APP_BASE, APP_SIZE, FLASH_BLOCK_SIZE, ROM_NUM_BLOCKS};

    const SPMEN: u8 = 1 << 0;
    const PGERS: u8 = 1 << 1;
    const PGWRT: u8 = 1 << 2;
    const RWWSRE: u8 = 1 << 4;

    /// Self-programming access to the application section.
    /// Must run from the boot section, which `build.rs` links the image into.
    pub struct OnChipFlash {
        _private: (),
    }

    impl OnChipFlash {
        pub fn new() -> Self {
            Self { _private: () }
        }

        fn wait_spm() {
            unsafe { while (*BOOT_LOAD::ptr()).spmcsr.read().bits() & SPMEN != 0 {} }
        }

        /// Upper address bits for `spm` and `elpm`.
        unsafe fn set_rampz(address: u32) {
            (*CPU::ptr()).rampz.write(|w| w.bits((address >> 16) as u8));
        }

        // SPMCSR must be written no more than four cycles ahead of `spm`,
        // so the store and the instruction stay together in asm.

        /// Issues one SPM command with Z (and RAMPZ) pointing at `address`.
        unsafe fn spm(address: u32, command: u8) {
            Self::wait_spm();
            Self::set_rampz(address);
            asm!(
                "sts 0x68, {cmd}",
                "spm",
                cmd = in(reg) command,
                in("Z") address as u16,
            );
            Self::wait_spm();
        }

        /// Loads one word into the temporary page buffer.
        unsafe fn fill(address: u32, word: u16) {
            Self::wait_spm();
            Self::set_rampz(address);
            asm!(
                "movw r0, {word}",
                "sts 0x68, {cmd}",
                "spm",
                "clr r1",
                word = in(reg_pair) word,
                cmd = in(reg) SPMEN,
                in("Z") address as u16,
            );
        }

        unsafe fn read_byte(address: u32) -> u8 {
            Self::set_rampz(address);
            let byte: u8;
            asm!(
                "elpm {byte}, Z",
                byte = out(reg) byte,
                in("Z") address as u16,
            );
            byte
        }

        fn in_app_region(address: u32, len: usize) -> bool {
            address >= APP_BASE && address + len as u32 <= APP_BASE + APP_SIZE
        }
    }

    impl Default for OnChipFlash {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FlashProgrammer for OnChipFlash {
        fn erase_block(&mut self, block: u16) -> Result<(), ProgramError> {
            if block >= ROM_NUM_BLOCKS {
                return Err(ProgramError::OutOfRange);
            }
            let address = APP_BASE + block as u32 * FLASH_BLOCK_SIZE;

            avr_device::interrupt::free(|_| unsafe {
                Self::spm(address, PGERS | SPMEN);
                Self::spm(address, RWWSRE | SPMEN);
            });

            // Erased flash reads back as 0xFF
            if (0..FLASH_BLOCK_SIZE).all(|i| unsafe { Self::read_byte(address + i) } == 0xFF) {
                Ok(())
            } else {
                Err(ProgramError::EraseFailed { block })
            }
        }

        fn write(&mut self, address: u32, data: &[u8]) -> Result<(), ProgramError> {
            if !Self::in_app_region(address, data.len()) {
                return Err(ProgramError::OutOfRange);
            }

            let mut offset = 0usize;
            while offset < data.len() {
                let page = (address + offset as u32) & !(FLASH_BLOCK_SIZE - 1);
                let page_end = (page + FLASH_BLOCK_SIZE) as usize - address as usize;
                let end = page_end.min(data.len());

                avr_device::interrupt::free(|_| unsafe {
                    // Bytes outside `data` keep their current content
                    let mut at = page;
                    while at < page + FLASH_BLOCK_SIZE {
                        let lo = Self::byte_for(address, data, at);
                        let hi = Self::byte_for(address, data, at + 1);
                        Self::fill(at, u16::from_le_bytes([lo, hi]));
                        at += 2;
                    }
                    Self::spm(page, PGWRT | SPMEN);
                    Self::spm(page, RWWSRE | SPMEN);
                });

                offset = end;
            }

            let written = data
                .iter()
                .enumerate()
                .all(|(i, b)| unsafe { Self::read_byte(address + i as u32) } == *b);
            if written {
                Ok(())
            } else {
                Err(ProgramError::WriteFailed { address })
            }
        }
    }

    impl OnChipFlash {
        unsafe fn byte_for(address: u32, data: &[u8], at: u32) -> u8 {
            if at >= address && ((at - address) as usize) < data.len() {
                data[(at - address) as usize]
            } else {
                Self::read_byte(at)
            }
        }
    }

    impl ImageSource for OnChipFlash {
        type Error = Infallible;

        fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), Infallible> {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = unsafe { Self::read_byte(address + i as u32) };
            }
            Ok(())
        }
    }
}
