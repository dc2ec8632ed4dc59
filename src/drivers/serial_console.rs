use core::convert::Infallible;

use ufmt::uWrite;

use crate::hal::Uart;

/// Log sink on USART0. Line feeds go out as CR LF for terminal emulators.
pub struct SerialConsole {
    uart: Uart,
}

impl SerialConsole {
    pub fn new() -> Self {
        Self { uart: Uart::new() }
    }
}

impl Default for SerialConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl uWrite for SerialConsole {
    type Error = Infallible;

    fn write_str(&mut self, s: &str) -> Result<(), Infallible> {
        for line in s.split_inclusive('\n') {
            match line.strip_suffix('\n') {
                Some(body) => {
                    self.uart.write_str(body)?;
                    self.uart.write_str("\r\n")?;
                }
                None => self.uart.write_str(line)?,
            }
        }
        Ok(())
    }
}
