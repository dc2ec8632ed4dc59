//! Boot decision procedure.
//!
//! Runs once per reset: trusts or distrusts the installed application,
//! looks for a staged candidate, reprograms on-chip flash when the candidate
//! is newer and intact, and finally either hands control to the application
//! or parks the device until a new image is staged.

pub mod checksum;
pub mod header;
pub mod layout;
pub mod store;

use ufmt::derive::uDebug;
use ufmt::uWrite;

use self::header::{ImageHeader, HEADER_SIZE};
use self::layout::{Layout, LayoutError};
use self::store::Store;
use crate::hal::flash::{FlashProgrammer, ImageSource};
use crate::logger::Logger;

/// Why the device is waiting instead of booting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub enum BootError {
    /// No staged image and nothing trustworthy installed
    CandidateAbsent,
    /// The staged image fails its checksum and nothing trustworthy is installed
    CandidateCorrupt,
    /// An erase or write failed part way through programming
    ProgramFailure,
    /// The freshly programmed image does not verify
    InstalledCorrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub enum BootDecision {
    JumpToApp,
    WaitForTransfer(BootError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootState {
    Start,
    CheckStaged { installed_ok: bool },
    VerifyCandidate { slot: usize, installed_ok: bool },
    ProgramImage { slot: usize },
    VerifyInstalled,
    JumpToApp,
    WaitForTransfer(BootError),
}

pub struct Bootloader<S, F, W> {
    store: Store<S>,
    flash: F,
    log: Logger<W>,
    state: BootState,
    installed: ImageHeader,
    /// Latest staged image seen by this boot
    candidate: Option<(usize, ImageHeader)>,
    /// The candidate failed its checksum, possibly because its transfer
    /// was still running
    candidate_corrupt: bool,
}

impl<S, F, W> Bootloader<S, F, W>
where
    S: ImageSource,
    F: FlashProgrammer + ImageSource,
    W: uWrite,
{
    pub fn new(source: S, flash: F, log: Logger<W>, layout: Layout) -> Result<Self, LayoutError> {
        Ok(Self {
            store: Store::new(source, layout)?,
            flash,
            log,
            state: BootState::Start,
            installed: ImageHeader::blank(),
            candidate: None,
            candidate_corrupt: false,
        })
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn installed(&self) -> &ImageHeader {
        &self.installed
    }

    pub fn store(&self) -> &Store<S> {
        &self.store
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn logger(&self) -> &Logger<W> {
        &self.log
    }

    pub fn logger_mut(&mut self) -> &mut Logger<W> {
        &mut self.log
    }

    pub fn into_parts(self) -> (Store<S>, F, Logger<W>) {
        (self.store, self.flash, self.log)
    }

    /// Steps until a decision is reached.
    pub fn run(&mut self) -> BootDecision {
        loop {
            if let Some(decision) = self.step() {
                return decision;
            }
        }
    }

    /// Advances one state, or one erase/program unit while programming.
    /// Returns the decision once a terminal state is reached.
    pub fn step(&mut self) -> Option<BootDecision> {
        self.state = match self.state {
            BootState::Start => {
                let installed_ok = self.check_application();
                if installed_ok {
                    info!(self.log, "installed image {:?} ok", self.installed.version);
                } else {
                    warn!(self.log, "installed image not trusted");
                }
                BootState::CheckStaged { installed_ok }
            }
            BootState::CheckStaged { installed_ok } => self.check_staged(installed_ok),
            BootState::VerifyCandidate { slot, installed_ok } => {
                self.verify_candidate(slot, installed_ok)
            }
            BootState::ProgramImage { slot } => match self.store.step(&mut self.flash) {
                Err(nb::Error::WouldBlock) => BootState::ProgramImage { slot },
                Ok(()) => {
                    info!(
                        self.log,
                        "slot {} programmed, {} blocks",
                        slot,
                        self.store.completed_blocks()
                    );
                    BootState::VerifyInstalled
                }
                Err(nb::Error::Other(e)) => {
                    error!(self.log, "programming slot {} failed: {:?}", slot, e);
                    BootState::WaitForTransfer(BootError::ProgramFailure)
                }
            },
            BootState::VerifyInstalled => {
                self.store.finish();
                if self.check_application() {
                    BootState::JumpToApp
                } else {
                    error!(self.log, "programmed image does not verify");
                    BootState::WaitForTransfer(BootError::InstalledCorrupt)
                }
            }
            terminal => terminal,
        };

        match self.state {
            BootState::JumpToApp => Some(BootDecision::JumpToApp),
            BootState::WaitForTransfer(reason) => Some(BootDecision::WaitForTransfer(reason)),
            _ => None,
        }
    }

    fn check_staged(&mut self, installed_ok: bool) -> BootState {
        self.store.get_load_image_headers();
        let latest = self.store.get_latest_image();
        self.candidate = latest.and_then(|slot| Some((slot, *self.store.header(slot)?)));
        self.candidate_corrupt = false;

        let Some((slot, candidate)) = self.candidate else {
            info!(self.log, "no staged image");
            return if installed_ok {
                BootState::JumpToApp
            } else {
                BootState::WaitForTransfer(BootError::CandidateAbsent)
            };
        };

        if installed_ok && candidate.version == self.installed.version {
            info!(self.log, "slot {} already installed", slot);
            return BootState::JumpToApp;
        }

        info!(self.log, "candidate {:?} in slot {}", candidate.version, slot);
        BootState::VerifyCandidate { slot, installed_ok }
    }

    /// Checks a staged slot against the checksum in its header.
    fn slot_intact(&mut self, slot: usize) -> bool {
        let expected = self.store.header(slot).map(|h| h.raw_crc);
        match self.store.verify_load_image(slot) {
            Ok(crc) => Some(crc) == expected,
            Err(e) => {
                warn!(self.log, "slot {} unreadable: {:?}", slot, e);
                false
            }
        }
    }

    fn verify_candidate(&mut self, slot: usize, installed_ok: bool) -> BootState {
        if !self.slot_intact(slot) {
            warn!(self.log, "slot {} fails its checksum", slot);
            self.candidate_corrupt = true;
            return if installed_ok {
                BootState::JumpToApp
            } else {
                BootState::WaitForTransfer(BootError::CandidateCorrupt)
            };
        }

        match self.store.start_erase(slot) {
            Ok(()) => BootState::ProgramImage { slot },
            Err(e) => {
                error!(self.log, "cannot start programming: {:?}", e);
                BootState::WaitForTransfer(BootError::ProgramFailure)
            }
        }
    }

    /// Reads the installed header and checks the installed image against it.
    pub fn check_application(&mut self) -> bool {
        let layout = *self.store.layout();
        let mut raw = [0u8; HEADER_SIZE];
        if self
            .flash
            .read(layout.app_base + layout.header_offset, &mut raw)
            .is_err()
        {
            self.installed = ImageHeader::blank();
            return false;
        }
        self.installed = ImageHeader::from_bytes(&raw);

        if !self.installed.is_valid() {
            return false;
        }
        match self.store.checksum_of(&mut self.flash, layout.app_base) {
            Ok(crc) => crc == self.installed.raw_crc,
            Err(_) => false,
        }
    }

    /// Rescans the slots while waiting. Returns `true` once an image other
    /// than the one seen at boot has been staged, or once the corrupt
    /// candidate seen at boot verifies, telling the caller to reset and run
    /// the decision again.
    pub fn poll_for_transfer(&mut self) -> bool {
        if !matches!(self.state, BootState::WaitForTransfer(_)) {
            return false;
        }

        self.store.get_load_image_headers();
        let latest = self
            .store
            .get_latest_image()
            .and_then(|slot| Some((slot, *self.store.header(slot)?)));

        if latest.is_some() && latest != self.candidate {
            if let Some((slot, header)) = latest {
                info!(self.log, "new image {:?} staged in slot {}", header.version, slot);
            }
            return true;
        }

        // Same header as at boot: the body may have landed since
        if let Some((slot, header)) = latest.filter(|_| self.candidate_corrupt) {
            if self.slot_intact(slot) {
                info!(self.log, "image {:?} in slot {} completed", header.version, slot);
                self.candidate_corrupt = false;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::header::Version;
    use crate::hal::flash::ProgramError;
    use crate::logger::Level;
    use crate::testing::*;
    use std::string::String;

    type Harness = Bootloader<MemStore, SimFlash, String>;

    fn harness(
        layout: Layout,
        installed: Option<Version>,
        staged: &[(usize, Version)],
    ) -> Harness {
        let mut external = external_for(&layout);
        for &(slot, version) in staged {
            external.stage(&layout, slot, &build_image(&layout, version, 0x40 + slot as u8));
        }
        let flash = match installed {
            Some(version) => SimFlash::with_image(&layout, &build_image(&layout, version, 0x10)),
            None => SimFlash::erased(&layout),
        };
        Bootloader::new(external, flash, Logger::new(String::new(), Level::Debug), layout).unwrap()
    }

    #[test]
    fn equal_versions_boot_without_touching_flash() {
        let v = Version::new(1, 2, 3, 4);
        let mut boot = harness(small_layout(), Some(v), &[(0, v)]);

        assert_eq!(boot.run(), BootDecision::JumpToApp);
        assert!(!boot.flash().touched());
    }

    #[test]
    fn newer_candidate_is_installed_and_reverified() {
        let layout = small_layout();
        let mut boot = harness(
            layout,
            Some(Version::new(1, 0, 0, 0)),
            &[(0, Version::new(1, 0, 0, 0)), (1, Version::new(2, 0, 0, 0))],
        );

        assert_eq!(boot.run(), BootDecision::JumpToApp);
        assert_eq!(boot.installed().version, Version::new(2, 0, 0, 0));
        assert_eq!(
            boot.flash().mem,
            build_image(&layout, Version::new(2, 0, 0, 0), 0x41)
        );
        assert_eq!(boot.flash().erases.len(), layout.num_blocks as usize);
    }

    #[test]
    fn blank_device_installs_the_candidate() {
        let layout = wide_layout();
        let mut boot = harness(layout, None, &[(2, Version::new(0, 1, 0, 0))]);

        assert_eq!(boot.run(), BootDecision::JumpToApp);
        assert_eq!(boot.installed().version, Version::new(0, 1, 0, 0));
    }

    #[test]
    fn slot_index_picks_the_candidate_even_if_older() {
        let layout = small_layout();
        let mut boot = harness(
            layout,
            Some(Version::new(5, 0, 0, 0)),
            &[(0, Version::new(9, 0, 0, 0)), (1, Version::new(3, 0, 0, 0))],
        );

        assert_eq!(boot.run(), BootDecision::JumpToApp);
        assert_eq!(boot.installed().version, Version::new(3, 0, 0, 0));
    }

    #[test]
    fn write_failure_never_jumps() {
        let layout = small_layout();
        let mut boot = harness(
            layout,
            Some(Version::new(1, 0, 0, 0)),
            &[(0, Version::new(2, 0, 0, 0))],
        );
        boot.flash.fail_write_at = Some(3);

        let mut decision = None;
        while decision.is_none() {
            decision = boot.step();
            assert_ne!(boot.state(), BootState::JumpToApp);
        }

        assert_eq!(
            decision,
            Some(BootDecision::WaitForTransfer(BootError::ProgramFailure))
        );
        assert_eq!(boot.flash().writes.len(), 4);
        // the terminal state is sticky
        assert_eq!(
            boot.step(),
            Some(BootDecision::WaitForTransfer(BootError::ProgramFailure))
        );
        assert!(boot.logger().writer().contains("[ERR] programming slot 0 failed"));
    }

    #[test]
    fn erase_failure_waits() {
        let mut boot = harness(small_layout(), None, &[(0, Version::new(1, 0, 0, 0))]);
        boot.flash.fail_erase_of = Some(0);

        assert_eq!(
            boot.run(),
            BootDecision::WaitForTransfer(BootError::ProgramFailure)
        );
        assert!(boot.flash().writes.is_empty());
        assert!(matches!(
            boot.store().state(),
            store::StoreState::Failed {
                error: store::StoreError::Program(ProgramError::EraseFailed { block: 0 }),
                ..
            }
        ));
    }

    #[test]
    fn corrupt_candidate_falls_back_to_installed() {
        let layout = small_layout();
        let mut boot = harness(
            layout,
            Some(Version::new(1, 0, 0, 0)),
            &[(0, Version::new(2, 0, 0, 0))],
        );
        boot.store.source_mut().data[7] ^= 0xFF;

        assert_eq!(boot.run(), BootDecision::JumpToApp);
        assert!(!boot.flash().touched());
        assert_eq!(boot.installed().version, Version::new(1, 0, 0, 0));
    }

    #[test]
    fn corrupt_candidate_without_installed_image_waits() {
        let mut boot = harness(small_layout(), None, &[(0, Version::new(2, 0, 0, 0))]);
        boot.store.source_mut().data[7] ^= 0xFF;

        assert_eq!(
            boot.run(),
            BootDecision::WaitForTransfer(BootError::CandidateCorrupt)
        );
        assert!(!boot.flash().touched());
    }

    #[test]
    fn no_candidate() {
        let mut trusted = harness(small_layout(), Some(Version::new(1, 0, 0, 0)), &[]);
        assert_eq!(trusted.run(), BootDecision::JumpToApp);

        let mut blank = harness(small_layout(), None, &[]);
        assert_eq!(
            blank.run(),
            BootDecision::WaitForTransfer(BootError::CandidateAbsent)
        );
    }

    #[test]
    fn corrupt_installed_image_is_replaced_even_with_equal_version() {
        let layout = small_layout();
        let v = Version::new(1, 0, 0, 0);
        let mut boot = harness(layout, Some(v), &[(0, v)]);
        boot.flash.mem[3] ^= 0x01;

        assert_eq!(boot.run(), BootDecision::JumpToApp);
        assert_eq!(boot.flash().mem, build_image(&layout, v, 0x40));
    }

    #[test]
    fn programmed_image_must_verify_before_jumping() {
        let layout = small_layout();
        let mut boot = harness(layout, None, &[(0, Version::new(1, 0, 0, 0))]);

        while boot.state() != BootState::VerifyInstalled {
            assert_eq!(boot.step(), None);
        }
        // bit rot between the last write and the check
        boot.flash.mem[0] = 0x00;

        assert_eq!(
            boot.step(),
            Some(BootDecision::WaitForTransfer(BootError::InstalledCorrupt))
        );
    }

    #[test]
    fn polls_for_a_new_transfer_while_waiting() {
        let layout = small_layout();
        let mut boot = harness(layout, None, &[]);
        assert!(!boot.poll_for_transfer());

        boot.run();
        assert!(!boot.poll_for_transfer());

        let image = build_image(&layout, Version::new(1, 0, 0, 0), 0);
        boot.store.source_mut().stage(&layout, 0, &image);
        assert!(boot.poll_for_transfer());
    }

    #[test]
    fn candidate_completed_after_its_header_is_reported() {
        let layout = small_layout();
        let image = build_image(&layout, Version::new(2, 0, 0, 0), 0x41);
        let mut boot = harness(layout, None, &[]);

        // header written, start of the body still erased
        let mut partial = image.clone();
        partial[..0x100].fill(0xFF);
        boot.store.source_mut().stage(&layout, 1, &partial);

        assert_eq!(
            boot.run(),
            BootDecision::WaitForTransfer(BootError::CandidateCorrupt)
        );
        assert!(!boot.poll_for_transfer());

        boot.store.source_mut().stage(&layout, 1, &image);
        assert!(boot.poll_for_transfer());
    }

    #[test]
    fn still_corrupt_candidate_does_not_retrigger() {
        let mut boot = harness(small_layout(), None, &[(1, Version::new(2, 0, 0, 0))]);
        boot.store.source_mut().data[0x1000 + 9] ^= 0xFF;

        assert_eq!(
            boot.run(),
            BootDecision::WaitForTransfer(BootError::CandidateCorrupt)
        );
        assert!(!boot.poll_for_transfer());
        assert!(!boot.poll_for_transfer());
    }
}
