//! Host-side doubles for the flash collaborators and an image builder.

use std::vec;
use std::vec::Vec;

use crate::bootloader::header::{ImageHeader, Version, HEADER_SIZE, RAW_CRC_OFFSET, RAW_CRC_SIZE};
use crate::bootloader::layout::Layout;
use crate::config::{NUM_LOAD_IMAGES, VALID_MASK};
use crate::hal::flash::{FlashProgrammer, ImageSource, ProgramError};

/// Small layout: 8 blocks of 64 bytes, header in the middle of a chunk.
pub fn small_layout() -> Layout {
    Layout {
        app_base: 0x0000,
        header_offset: 0x0180,
        block_size: 64,
        num_blocks: 8,
        slots: [0x0000, 0x1000, 0x2000, 0x3000],
    }
}

/// Blocks larger than the working buffer, application not at address zero.
pub fn wide_layout() -> Layout {
    Layout {
        app_base: 0x0400,
        header_offset: 0x0010,
        block_size: 512,
        num_blocks: 2,
        slots: [0x0000, 0x1000, 0x2000, 0x3000],
    }
}

/// External flash held in memory, erased to 0xFF.
pub struct MemStore {
    pub data: Vec<u8>,
    /// Reads overlapping `[start, end)` fail
    pub fail_reads: Option<(u32, u32)>,
}

impl MemStore {
    pub fn erased(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            fail_reads: None,
        }
    }

    pub fn stage(&mut self, layout: &Layout, slot: usize, image: &[u8]) {
        let base = layout.slots[slot] as usize;
        self.data[base..base + image.len()].copy_from_slice(image);
    }
}

impl ImageSource for MemStore {
    type Error = ();

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), ()> {
        let end = address + buffer.len() as u32;
        if let Some((lo, hi)) = self.fail_reads {
            if address < hi && end > lo {
                return Err(());
            }
        }
        let src = self
            .data
            .get(address as usize..end as usize)
            .ok_or(())?;
        buffer.copy_from_slice(src);
        Ok(())
    }
}

/// On-chip flash with NOR semantics: erase sets 0xFF, writes only clear bits.
pub struct SimFlash {
    pub base: u32,
    pub block_size: u32,
    pub mem: Vec<u8>,
    pub erases: Vec<u16>,
    pub writes: Vec<(u32, usize)>,
    pub fail_erase_of: Option<u16>,
    /// Index of the write call that fails
    pub fail_write_at: Option<usize>,
}

impl SimFlash {
    pub fn erased(layout: &Layout) -> Self {
        Self {
            base: layout.app_base,
            block_size: layout.block_size,
            mem: vec![0xFF; layout.image_size() as usize],
            erases: Vec::new(),
            writes: Vec::new(),
            fail_erase_of: None,
            fail_write_at: None,
        }
    }

    pub fn with_image(layout: &Layout, image: &[u8]) -> Self {
        let mut flash = Self::erased(layout);
        flash.mem.copy_from_slice(image);
        flash
    }

    pub fn touched(&self) -> bool {
        !self.erases.is_empty() || !self.writes.is_empty()
    }
}

impl FlashProgrammer for SimFlash {
    fn erase_block(&mut self, block: u16) -> Result<(), ProgramError> {
        if self.fail_erase_of == Some(block) {
            return Err(ProgramError::EraseFailed { block });
        }
        let start = (block as u32 * self.block_size) as usize;
        let end = start + self.block_size as usize;
        let span = self.mem.get_mut(start..end).ok_or(ProgramError::OutOfRange)?;
        span.fill(0xFF);
        self.erases.push(block);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), ProgramError> {
        let call = self.writes.len();
        self.writes.push((address, data.len()));
        if self.fail_write_at == Some(call) {
            return Err(ProgramError::WriteFailed { address });
        }
        let start = address
            .checked_sub(self.base)
            .ok_or(ProgramError::OutOfRange)? as usize;
        let span = self
            .mem
            .get_mut(start..start + data.len())
            .ok_or(ProgramError::OutOfRange)?;
        for (cell, byte) in span.iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }
}

impl ImageSource for SimFlash {
    type Error = ();

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), ()> {
        let start = address.checked_sub(self.base).ok_or(())? as usize;
        let src = self.mem.get(start..start + buffer.len()).ok_or(())?;
        buffer.copy_from_slice(src);
        Ok(())
    }
}

/// Bit-by-bit CRC-16/CCITT, kept independent of the table driven engine.
pub fn reference_crc16(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Expected `raw_crc`: every image byte except the field itself, then
/// complemented.
pub fn expected_raw_crc(layout: &Layout, image: &[u8]) -> u16 {
    let crc_at = (layout.header_offset + RAW_CRC_OFFSET) as usize;
    let crc_end = crc_at + RAW_CRC_SIZE as usize;

    let mut covered = Vec::with_capacity(image.len());
    covered.extend_from_slice(&image[..crc_at]);
    covered.extend_from_slice(&image[crc_end..]);
    !reference_crc16(0xFFFF, &covered)
}

/// Builds a full application image with a correct header.
pub fn build_image(layout: &Layout, version: Version, fill: u8) -> Vec<u8> {
    let size = layout.image_size() as usize;
    let mut image: Vec<u8> = (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(fill))
        .collect();

    let header = ImageHeader {
        valid_mask: VALID_MASK,
        image_id: 1,
        version,
        raw_crc: 0,
        image_size: size as u32,
        max_block_size: layout.block_size as u16,
    };
    write_header(layout, &mut image, &header);

    let crc = expected_raw_crc(layout, &image);
    write_header(layout, &mut image, &ImageHeader { raw_crc: crc, ..header });
    image
}

pub fn write_header(layout: &Layout, image: &mut [u8], header: &ImageHeader) {
    let at = layout.header_offset as usize;
    image[at..at + HEADER_SIZE].copy_from_slice(&header.to_bytes());
}

pub fn header_of(layout: &Layout, image: &[u8]) -> ImageHeader {
    let at = layout.header_offset as usize;
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&image[at..at + HEADER_SIZE]);
    ImageHeader::from_bytes(&raw)
}

/// External flash big enough for every slot of `layout`.
pub fn external_for(layout: &Layout) -> MemStore {
    let end = layout.slots[NUM_LOAD_IMAGES - 1] + layout.image_size();
    MemStore::erased(end as usize)
}
