//! Dual-image flash bootloader for the ATmega128 board.
//!
//! The portable core (checksum engine, image store, write machine,
//! orchestrator, timer channel arena) builds on any target. Register level
//! adapters are only compiled for AVR.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "avr", feature(asm_experimental_arch))]

#[macro_use]
pub mod logger;

pub mod bootloader;
pub mod config;
pub mod drivers;
pub mod hal;
pub mod rtos;

#[cfg(test)]
pub(crate) mod testing;
