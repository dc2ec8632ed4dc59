use static_assertions::const_assert;
use ufmt::derive::uDebug;

use super::header::HEADER_SIZE;
use crate::config::{
    APP_BASE, APP_HEADER_OFFSET, APP_SIZE, CHUNK_SIZE, FLASH_BLOCK_SIZE, LOAD_IMAGE_ADDRESSES,
    MAX_BLOCKS, NUM_LOAD_IMAGES, ROM_NUM_BLOCKS,
};

const_assert!(APP_SIZE % FLASH_BLOCK_SIZE == 0);
const_assert!(ROM_NUM_BLOCKS as usize <= MAX_BLOCKS);
const_assert!(APP_HEADER_OFFSET + HEADER_SIZE as u32 <= APP_SIZE);
const_assert!(CHUNK_SIZE >= HEADER_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub enum LayoutError {
    EmptyImage,
    HeaderOutOfImage,
    TooManyBlocks,
    /// An image would run past the end of the address space
    AddressOverflow,
}

/// Where images live: one region in on-chip flash, one slot per load image
/// in external flash. All images share the same size and header offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// On-chip address of the application image
    pub app_base: u32,
    /// Header position inside an image
    pub header_offset: u32,
    /// On-chip erase unit
    pub block_size: u32,
    pub num_blocks: u16,
    /// External flash base address of each load image slot
    pub slots: [u32; NUM_LOAD_IMAGES],
}

impl Layout {
    pub const DEFAULT: Layout = Layout {
        app_base: APP_BASE,
        header_offset: APP_HEADER_OFFSET,
        block_size: FLASH_BLOCK_SIZE,
        num_blocks: ROM_NUM_BLOCKS,
        slots: LOAD_IMAGE_ADDRESSES,
    };

    /// Saturates on a layout that `validate` rejects.
    #[inline]
    pub const fn image_size(&self) -> u32 {
        self.block_size.saturating_mul(self.num_blocks as u32)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.block_size == 0 || self.num_blocks == 0 {
            return Err(LayoutError::EmptyImage);
        }
        if self.num_blocks as usize > MAX_BLOCKS {
            return Err(LayoutError::TooManyBlocks);
        }
        let image_size = self
            .block_size
            .checked_mul(self.num_blocks as u32)
            .ok_or(LayoutError::AddressOverflow)?;

        let header_end = self
            .header_offset
            .checked_add(HEADER_SIZE as u32)
            .ok_or(LayoutError::HeaderOutOfImage)?;
        if header_end > image_size {
            return Err(LayoutError::HeaderOutOfImage);
        }

        // The last byte of every image must be addressable
        let fits = |base: u32| base.checked_add(image_size - 1).is_some();
        if !fits(self.app_base) || !self.slots.iter().all(|&slot| fits(slot)) {
            return Err(LayoutError::AddressOverflow);
        }
        Ok(())
    }

    /// Erase block holding image offset `offset`.
    #[inline]
    pub const fn block_of(&self, offset: u32) -> u16 {
        (offset / self.block_size) as u16
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
