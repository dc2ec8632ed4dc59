use avr_device::atmega128a::WDT;

const WDCE: u8 = 1 << 4;
const WDE: u8 = 1 << 3;

#[derive(Clone, Copy)]
#[repr(u8)]
pub enum WatchdogTimeout {
    Ms16 = 0,
    Ms32 = 1,
    Ms64 = 2,
    Ms125 = 3,
    Ms250 = 4,
    Ms500 = 5,
    Ms1000 = 6,
    Ms2000 = 7,
}

pub struct Watchdog {
    _private: (),
}

impl Watchdog {
    #[inline]
    pub fn new() -> Self {
        Self { _private: () }
    }

    #[inline]
    pub fn start(&mut self, timeout: WatchdogTimeout) {
        avr_device::interrupt::free(|_| unsafe {
            let wdtcr = &(*WDT::ptr()).wdtcr;
            // Timed sequence: change enable, then the new setting within 4 cycles
            wdtcr.write(|w| w.bits(WDCE | WDE));
            wdtcr.write(|w| w.bits(WDE | timeout as u8));
        });
    }

    #[inline]
    pub fn disable(&mut self) {
        avr_device::interrupt::free(|_| unsafe {
            let wdtcr = &(*WDT::ptr()).wdtcr;
            wdtcr.write(|w| w.bits(WDCE | WDE));
            wdtcr.write(|w| w.bits(0x00));
        });
    }

    /// Full device reset through the shortest watchdog timeout.
    pub fn reset(&mut self) -> ! {
        self.start(WatchdogTimeout::Ms16);
        loop {}
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}
