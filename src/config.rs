//! Configuration constants for the ATmega128 bootloader

use crate::logger::Level;

/// CPU frequency in Hz
pub const CPU_FREQ_HZ: u32 = 16_000_000;

/// UART baud rate
pub const UART_BAUD: u32 = 9600;

/// Number of load image slots in external flash
pub const NUM_LOAD_IMAGES: usize = 4;

/// Base address of each load image slot in external flash.
/// Slots are 128 KiB apart, one per possible application image.
pub const LOAD_IMAGE_ADDRESSES: [u32; NUM_LOAD_IMAGES] = [0x00_0000, 0x02_0000, 0x04_0000, 0x06_0000];

/// First byte of the application region in on-chip flash
pub const APP_BASE: u32 = 0x0000;

/// Application region size; the boot section starts right after it
pub const APP_SIZE: u32 = 0x1E000;

/// Offset of the image header inside an image (linker section `.app_header`)
pub const APP_HEADER_OFFSET: u32 = APP_SIZE - 0x100;

/// Erase unit of the on-chip flash (one SPM page)
pub const FLASH_BLOCK_SIZE: u32 = 256;

/// Erase units covering the application region
pub const ROM_NUM_BLOCKS: u16 = (APP_SIZE / FLASH_BLOCK_SIZE) as u16;

/// Upper bound on erase blocks tracked by the write progress map
pub const MAX_BLOCKS: usize = 512;

/// Working buffer size for checksum and programming passes
pub const CHUNK_SIZE: usize = 256;

/// `valid_mask` value of a completely written image header
pub const VALID_MASK: u8 = 0xAA;

/// Checksum seed used by the linker when it embeds `raw_crc`
pub const LINKER_SEED: u16 = 0xFFFF;

/// Rate at which the staged-image poll runs while waiting for a transfer
pub const TRANSFER_POLL_HZ: u32 = 100;

/// SPI flash control pins on PORTB. PB1..PB3 are taken by SCK, MOSI and MISO.
pub const FLASH_CS_PIN: u8 = 0;
pub const FLASH_WP_PIN: u8 = 4;
pub const FLASH_HOLD_PIN: u8 = 5;

/// Most verbose log level that reaches the console
#[cfg(feature = "debug")]
pub const LOG_LEVEL: Level = Level::Debug;
#[cfg(not(feature = "debug"))]
pub const LOG_LEVEL: Level = Level::Info;
