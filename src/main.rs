#![cfg_attr(target_arch = "avr", no_std)]
#![cfg_attr(target_arch = "avr", no_main)]
#![cfg_attr(target_arch = "avr", feature(abi_avr_interrupt))]

#[cfg(target_arch = "avr")]
mod firmware {
    use core::cell::RefCell;

    use avr_device::interrupt::{self, Mutex};
    use panic_halt as _;

    use atmega128_bootloader::bootloader::layout::Layout;
    use atmega128_bootloader::bootloader::{BootDecision, BootError, Bootloader};
    use atmega128_bootloader::config::{
        FLASH_CS_PIN, FLASH_HOLD_PIN, FLASH_WP_PIN, LOG_LEVEL, TRANSFER_POLL_HZ,
    };
    use atmega128_bootloader::drivers::{SerialConsole, SpiFlash};
    use atmega128_bootloader::hal::{
        self, OnChipFlash, PortBOutput, Spi, SpiPrescaler, Timers, Watchdog,
    };
    use atmega128_bootloader::logger::Logger;
    use atmega128_bootloader::rtos::{Channel, Trigger};
    use atmega128_bootloader::{error, info, warn};

    type ExternalFlash = SpiFlash<Spi, PortBOutput<FLASH_CS_PIN>>;
    type Boot = Bootloader<ExternalFlash, OnChipFlash, SerialConsole>;
    type PollTrigger = Trigger<Timers, { Timers::COUNT }>;

    // Touched from the timer interrupts while waiting for a transfer
    static BOOT: Mutex<RefCell<Option<Boot>>> = Mutex::new(RefCell::new(None));
    static TRIGGER: Mutex<RefCell<Option<PollTrigger>>> = Mutex::new(RefCell::new(None));

    #[avr_device::entry]
    fn main() -> ! {
        Watchdog::new().disable();

        let mut log = Logger::new(SerialConsole::new(), LOG_LEVEL);
        info!(log, "bootloader {}", env!("CARGO_PKG_VERSION"));

        // Flash write protect and hold stay released
        let _wp = PortBOutput::<FLASH_WP_PIN>::new();
        let _hold = PortBOutput::<FLASH_HOLD_PIN>::new();

        let spi = Spi::new(SpiPrescaler::Div4);
        let external = match SpiFlash::new(spi, PortBOutput::<FLASH_CS_PIN>::new()) {
            Ok(flash) => flash,
            Err(e) => {
                error!(log, "external flash: {:?}", e);
                halt()
            }
        };

        let mut boot = match Bootloader::new(external, OnChipFlash::new(), log, Layout::DEFAULT) {
            Ok(boot) => boot,
            Err(_) => halt(),
        };

        match boot.run() {
            BootDecision::JumpToApp => start_application(boot),
            BootDecision::WaitForTransfer(reason) => wait_for_transfer(boot, reason),
        }
    }

    fn start_application(boot: Boot) -> ! {
        let (mut store, _, mut log) = boot.into_parts();
        if let Err(e) = store.source_mut().power_down() {
            warn!(log, "external flash stays awake: {:?}", e);
        }
        info!(log, "starting application");

        // SAFETY: the orchestrator re-verified the installed image and no
        // timer or interrupt has been started on this path
        unsafe { hal::jump_to_application() }
    }

    fn wait_for_transfer(mut boot: Boot, reason: BootError) -> ! {
        warn!(boot.logger_mut(), "waiting for transfer: {:?}", reason);

        let mut trigger = PollTrigger::new(Timers::new());
        let scheduled = trigger.create_periodic(TRANSFER_POLL_HZ, poll_transfer);
        if let Err(e) = scheduled {
            error!(boot.logger_mut(), "no poll timer: {:?}", e);
        }

        interrupt::free(|cs| {
            BOOT.borrow(cs).replace(Some(boot));
            TRIGGER.borrow(cs).replace(Some(trigger));
        });
        hal::select_boot_vectors();
        // SAFETY: shared state is in place before the first interrupt
        unsafe { interrupt::enable() };

        loop {
            if scheduled.is_err() {
                poll_transfer(Channel(0));
            }
        }
    }

    /// Resets into a fresh boot once a new image shows up.
    fn poll_transfer(_: Channel) {
        let staged = interrupt::free(|cs| {
            BOOT.borrow(cs)
                .borrow_mut()
                .as_mut()
                .map_or(false, Boot::poll_for_transfer)
        });
        if staged {
            Watchdog::new().reset();
        }
    }

    fn dispatch(channel: Channel) {
        interrupt::free(|cs| {
            if let Some(trigger) = TRIGGER.borrow(cs).borrow_mut().as_mut() {
                trigger.on_interrupt(channel);
            }
        });
    }

    #[avr_device::interrupt(atmega128a)]
    fn TIMER1_COMPA() {
        dispatch(Channel(0));
    }

    #[avr_device::interrupt(atmega128a)]
    fn TIMER3_COMPA() {
        dispatch(Channel(1));
    }

    fn halt() -> ! {
        loop {}
    }
}

#[cfg(not(target_arch = "avr"))]
fn main() {}
