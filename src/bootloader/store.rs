//! Image store manager.
//!
//! Keeps the table of load image headers found in external flash, checks
//! staged images against their embedded checksum and copies a chosen image
//! into on-chip flash through a resumable write machine. Every `step` of the
//! machine erases one block or programs one chunk and returns, so callers
//! can spread a full image write over many scheduler ticks.

use ufmt::derive::uDebug;

use super::checksum;
use super::header::{ImageHeader, HEADER_SIZE, RAW_CRC_OFFSET, RAW_CRC_SIZE};
use super::layout::{Layout, LayoutError};
use crate::config::{CHUNK_SIZE, LINKER_SEED, MAX_BLOCKS, NUM_LOAD_IMAGES};
use crate::hal::flash::{FlashProgrammer, ImageSource, ProgramError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub enum StoreError {
    InvalidSlot,
    InvalidBlock,
    /// A write pass is already in flight
    Busy,
    /// Retry asked for an image other than the last one written
    NotResumable,
    /// Every slot already holds an image
    TableFull,
    /// External image store read failed
    Read,
    Program(ProgramError),
}

impl From<ProgramError> for StoreError {
    fn from(e: ProgramError) -> Self {
        StoreError::Program(e)
    }
}

/// Blocks of one write pass: `[first, end)` of the image in `slot`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pass {
    pub slot: usize,
    pub first: u16,
    pub end: u16,
}

/// Write progress inside a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    /// Next on-chip address to program
    pub dest: u32,
    /// Matching address in external flash
    pub src: u32,
    pub remaining: u32,
}

impl Cursor {
    fn start_of(layout: &Layout, pass: &Pass) -> Self {
        let offset = pass.first as u32 * layout.block_size;
        Self {
            dest: layout.app_base + offset,
            src: layout.slots[pass.slot] + offset,
            remaining: (pass.end - pass.first) as u32 * layout.block_size,
        }
    }

    fn advance(self, len: u32) -> Self {
        Self {
            dest: self.dest + len,
            src: self.src + len,
            remaining: self.remaining - len,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    Idle,
    Erasing { pass: Pass, block: u16 },
    Programming { pass: Pass, cursor: Cursor },
    /// Halted on an adapter or read failure; resumable through the retry path
    Failed { pass: Pass, error: StoreError },
}

const MAP_BYTES: usize = (MAX_BLOCKS + 7) / 8;

/// One bit per erase block, set once the block is fully programmed.
#[derive(Clone, PartialEq, Eq)]
struct BlockMap {
    bitmap: [u8; MAP_BYTES],
}

impl BlockMap {
    const fn new() -> Self {
        Self {
            bitmap: [0u8; MAP_BYTES],
        }
    }

    fn mark(&mut self, block: u16) {
        self.bitmap[block as usize >> 3] |= 1 << (block & 0x7);
    }

    fn unmark(&mut self, block: u16) {
        self.bitmap[block as usize >> 3] &= !(1 << (block & 0x7));
    }

    fn is_marked(&self, block: u16) -> bool {
        self.bitmap[block as usize >> 3] & (1 << (block & 0x7)) != 0
    }

    fn clear(&mut self) {
        self.bitmap = [0u8; MAP_BYTES];
    }

    fn popcount(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }
}

#[derive(Clone, Copy)]
struct RetryScan {
    slot: usize,
    next: u16,
}

pub struct Store<S> {
    source: S,
    layout: Layout,
    headers: [ImageHeader; NUM_LOAD_IMAGES],
    buffer: [u8; CHUNK_SIZE],
    state: StoreState,
    progress: BlockMap,
    /// Slot of the most recent pass; only that image can be resumed
    written: Option<usize>,
    retry: Option<RetryScan>,
}

impl<S: ImageSource> Store<S> {
    pub fn new(source: S, layout: Layout) -> Result<Self, LayoutError> {
        layout.validate()?;

        Ok(Self {
            source,
            layout,
            headers: [ImageHeader::blank(); NUM_LOAD_IMAGES],
            buffer: [0u8; CHUNK_SIZE],
            state: StoreState::Idle,
            progress: BlockMap::new(),
            written: None,
            retry: None,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn headers(&self) -> &[ImageHeader; NUM_LOAD_IMAGES] {
        &self.headers
    }

    pub fn header(&self, slot: usize) -> Option<&ImageHeader> {
        self.headers.get(slot)
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Refreshes the whole header table from external flash. A slot that
    /// cannot be read is recorded as erased, so it never counts as valid.
    pub fn get_load_image_headers(&mut self) {
        for (slot, header) in self.headers.iter_mut().enumerate() {
            let mut raw = [0u8; HEADER_SIZE];
            let at = self.layout.slots[slot] + self.layout.header_offset;
            *header = match self.source.read(at, &mut raw) {
                Ok(()) => ImageHeader::from_bytes(&raw),
                Err(_) => ImageHeader::blank(),
            };
        }
    }

    /// Highest slot holding a valid header.
    ///
    /// Slots fill in arrival order, so the last valid one is the newest
    /// download. Versions are deliberately not compared.
    pub fn get_latest_image(&self) -> Option<usize> {
        self.headers.iter().rposition(ImageHeader::is_valid)
    }

    /// Latest valid slot holding the same image id and version as `header`.
    pub fn find_matching_image(&self, header: &ImageHeader) -> Option<usize> {
        self.headers
            .iter()
            .rposition(|h| h.is_valid() && h.same_release(header))
    }

    /// First slot with no valid header, for staging the next download.
    pub fn claim_free_slot(&self) -> Result<usize, StoreError> {
        self.headers
            .iter()
            .position(|h| !h.is_valid())
            .ok_or(StoreError::TableFull)
    }

    /// Checksum of the image staged in `slot`, ready to compare with its
    /// `raw_crc`.
    pub fn verify_load_image(&mut self, slot: usize) -> Result<u16, StoreError> {
        let base = *self.layout.slots.get(slot).ok_or(StoreError::InvalidSlot)?;
        image_checksum(&mut self.source, base, &self.layout, &mut self.buffer)
            .map_err(|_| StoreError::Read)
    }

    /// Same walk as `verify_load_image` over any other image, such as the
    /// one installed in on-chip flash at `base`.
    pub fn checksum_of<R: ImageSource>(&mut self, reader: &mut R, base: u32) -> Result<u16, R::Error> {
        image_checksum(reader, base, &self.layout, &mut self.buffer)
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            StoreState::Erasing { .. } | StoreState::Programming { .. }
        )
    }

    /// Blocks of the current image known to be fully programmed.
    pub fn completed_blocks(&self) -> usize {
        self.progress.popcount()
    }

    /// Arms a full pass: erase every block, then program the image in `slot`.
    pub fn start_erase(&mut self, slot: usize) -> Result<(), StoreError> {
        let pass = self.full_pass(slot)?;
        self.progress.clear();
        self.written = Some(slot);
        self.retry = None;
        self.state = StoreState::Erasing {
            pass,
            block: pass.first,
        };
        Ok(())
    }

    /// Arms a programming-only pass over flash that is already erased.
    pub fn block_init(&mut self, slot: usize) -> Result<(), StoreError> {
        let pass = self.full_pass(slot)?;
        self.progress.clear();
        self.written = Some(slot);
        self.retry = None;
        self.state = StoreState::Programming {
            pass,
            cursor: Cursor::start_of(&self.layout, &pass),
        };
        Ok(())
    }

    fn full_pass(&self, slot: usize) -> Result<Pass, StoreError> {
        if slot >= NUM_LOAD_IMAGES {
            return Err(StoreError::InvalidSlot);
        }
        if self.is_busy() {
            return Err(StoreError::Busy);
        }
        Ok(Pass {
            slot,
            first: 0,
            end: self.layout.num_blocks,
        })
    }

    /// Advances the current pass by one erase block or one chunk.
    ///
    /// `WouldBlock` while work remains, `Ok` once idle. After a failure the
    /// machine stays halted and keeps returning the same error until a new
    /// pass or a retry is armed.
    pub fn step<F: FlashProgrammer>(&mut self, flash: &mut F) -> nb::Result<(), StoreError> {
        match self.state {
            StoreState::Idle => Ok(()),
            StoreState::Failed { error, .. } => Err(nb::Error::Other(error)),
            StoreState::Erasing { pass, block } => {
                if let Err(e) = flash.erase_block(block) {
                    return Err(self.halt(pass, e.into()));
                }
                self.progress.unmark(block);

                self.state = if block + 1 < pass.end {
                    StoreState::Erasing {
                        pass,
                        block: block + 1,
                    }
                } else {
                    StoreState::Programming {
                        pass,
                        cursor: Cursor::start_of(&self.layout, &pass),
                    }
                };
                Err(nb::Error::WouldBlock)
            }
            StoreState::Programming { pass, cursor } => self.program_chunk(flash, pass, cursor),
        }
    }

    fn program_chunk<F: FlashProgrammer>(
        &mut self,
        flash: &mut F,
        pass: Pass,
        cursor: Cursor,
    ) -> nb::Result<(), StoreError> {
        let offset = cursor.dest - self.layout.app_base;
        let block = self.layout.block_of(offset);
        let block_end = (block as u32 + 1) * self.layout.block_size;
        let len = (CHUNK_SIZE as u32)
            .min(cursor.remaining)
            .min(block_end - offset);
        let chunk = &mut self.buffer[..len as usize];

        if self.source.read(cursor.src, chunk).is_err() {
            return Err(self.halt(pass, StoreError::Read));
        }
        if let Err(e) = flash.write(cursor.dest, chunk) {
            return Err(self.halt(pass, e.into()));
        }

        if offset + len == block_end {
            self.progress.mark(block);
        }

        let next = cursor.advance(len);
        if next.remaining == 0 {
            self.state = StoreState::Idle;
            Ok(())
        } else {
            self.state = StoreState::Programming { pass, cursor: next };
            Err(nb::Error::WouldBlock)
        }
    }

    fn halt(&mut self, pass: Pass, error: StoreError) -> nb::Error<StoreError> {
        self.state = StoreState::Failed { pass, error };
        nb::Error::Other(error)
    }

    /// Starts scanning the last written image for blocks still missing.
    pub fn retry_init(&mut self, slot: usize) -> Result<(), StoreError> {
        if slot >= NUM_LOAD_IMAGES {
            return Err(StoreError::InvalidSlot);
        }
        if self.is_busy() {
            return Err(StoreError::Busy);
        }
        if self.written != Some(slot) {
            return Err(StoreError::NotResumable);
        }
        self.retry = Some(RetryScan { slot, next: 0 });
        Ok(())
    }

    /// Sequence id (block index) of the next block that still needs
    /// writing, or `None` once the image is complete.
    pub fn retry_continue(&mut self) -> Option<u16> {
        let scan = self.retry.as_mut()?;
        let missing = (scan.next..self.layout.num_blocks).find(|&b| !self.progress.is_marked(b));
        scan.next = missing.map_or(self.layout.num_blocks, |b| b + 1);
        missing
    }

    /// Arms a one block pass (erase, then program) for `seq_id`.
    pub fn retry_get_block(&mut self, seq_id: u16) -> Result<(), StoreError> {
        let scan = self.retry.ok_or(StoreError::NotResumable)?;
        if seq_id >= self.layout.num_blocks {
            return Err(StoreError::InvalidBlock);
        }
        if self.is_busy() {
            return Err(StoreError::Busy);
        }
        let pass = Pass {
            slot: scan.slot,
            first: seq_id,
            end: seq_id + 1,
        };
        self.progress.unmark(seq_id);
        self.state = StoreState::Erasing {
            pass,
            block: seq_id,
        };
        Ok(())
    }

    /// Drops the cursor and all progress of the current image.
    pub fn finish(&mut self) {
        self.state = StoreState::Idle;
        self.progress.clear();
        self.written = None;
        self.retry = None;
    }
}

/// Walks the image at `base` in buffer sized reads and returns the
/// finalized checksum. The `raw_crc` field sits inside the checked region
/// but is itself skipped: first the body up to the header, then the header
/// bytes ahead of the field, then everything after it.
fn image_checksum<R: ImageSource>(
    reader: &mut R,
    base: u32,
    layout: &Layout,
    buffer: &mut [u8],
) -> Result<u16, R::Error> {
    let crc_at = layout.header_offset + RAW_CRC_OFFSET;
    let crc_end = crc_at + RAW_CRC_SIZE;

    let mut crc = LINKER_SEED;
    crc = accumulate(reader, base, 0..layout.header_offset, buffer, crc)?;
    crc = accumulate(reader, base, layout.header_offset..crc_at, buffer, crc)?;
    crc = accumulate(reader, base, crc_end..layout.image_size(), buffer, crc)?;

    Ok(checksum::finalize(crc))
}

fn accumulate<R: ImageSource>(
    reader: &mut R,
    base: u32,
    range: core::ops::Range<u32>,
    buffer: &mut [u8],
    mut crc: u16,
) -> Result<u16, R::Error> {
    let mut at = range.start;
    while at < range.end {
        let len = (buffer.len() as u32).min(range.end - at) as usize;
        reader.read(base + at, &mut buffer[..len])?;
        crc = checksum::compute(crc, &buffer[..len]);
        at += len as u32;
    }
    Ok(crc)
}
