pub mod flash;
#[cfg(target_arch = "avr")]
pub mod serial_console;

pub use flash::{FlashError, SpiFlash};
#[cfg(target_arch = "avr")]
pub use serial_console::SerialConsole;
