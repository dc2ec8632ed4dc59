pub mod flash;
pub mod timer;

#[cfg(target_arch = "avr")]
pub mod gpio;
#[cfg(target_arch = "avr")]
pub mod spi;
#[cfg(target_arch = "avr")]
pub mod uart;
#[cfg(target_arch = "avr")]
pub mod watchdog;

// Re-export commonly used types
pub use flash::{FlashProgrammer, ImageSource, ProgramError};
pub use timer::{TimerHardware, TimerMode};

#[cfg(target_arch = "avr")]
pub use flash::OnChipFlash;
#[cfg(target_arch = "avr")]
pub use gpio::PortBOutput;
#[cfg(target_arch = "avr")]
pub use spi::{Spi, SpiPrescaler};
#[cfg(target_arch = "avr")]
pub use timer::Timers;
#[cfg(target_arch = "avr")]
pub use uart::Uart;
#[cfg(target_arch = "avr")]
pub use watchdog::{Watchdog, WatchdogTimeout};

/// Routes interrupts to the vector table at the start of the boot section.
#[cfg(target_arch = "avr")]
pub fn select_boot_vectors() {
    avr_device::interrupt::free(|_| unsafe {
        let mcucr = &(*avr_device::atmega128a::CPU::ptr()).mcucr;
        // IVCE, then IVSEL within four cycles
        mcucr.write(|w| w.bits(0x01));
        mcucr.write(|w| w.bits(0x02));
    });
}

/// Hands the CPU to the application at its reset vector. Never returns.
///
/// # Safety
///
/// The application region must hold a verified image, and every
/// peripheral the bootloader started must be stopped first.
#[cfg(target_arch = "avr")]
pub unsafe fn jump_to_application() -> ! {
    avr_device::interrupt::disable();

    // Interrupt vectors back to the application section
    let mcucr = &(*avr_device::atmega128a::CPU::ptr()).mcucr;
    mcucr.write(|w| w.bits(0x01));
    mcucr.write(|w| w.bits(0x00));

    core::arch::asm!("jmp 0", options(noreturn));
}
