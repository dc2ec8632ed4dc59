//! Running CRC-16 used by the linker to stamp `raw_crc` into every image.
//!
//! The register is never reflected or xored on output, so feeding the
//! result of one call back in as the seed of the next gives the same value
//! as one call over the concatenated bytes. Image verification relies on
//! that to walk the image one buffer at a time.

use crc::{Algorithm, Crc};

use crate::config::LINKER_SEED;

const LINKER_CRC: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: LINKER_SEED,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x29B1,
    residue: 0x0000,
};

const ENGINE: Crc<u16> = Crc::<u16>::new(&LINKER_CRC);

/// Accumulates `data` onto `seed` and returns the new register value.
pub fn compute(seed: u16, data: &[u8]) -> u16 {
    let mut digest = ENGINE.digest_with_initial(seed);
    digest.update(data);
    digest.finalize()
}

/// The linker stores the complement of the final register value.
#[inline]
pub const fn finalize(crc: u16) -> u16 {
    !crc
}
