use std::env;

/// Byte address of the ATmega128 boot section (BOOTSZ = 4096 words).
const BOOT_SECTION_START: u32 = 0x1E000;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Host builds only carry the portable core and its tests
    let target = env::var("TARGET").unwrap_or_default();
    if !target.contains("avr") {
        return;
    }

    // Configure for ATmega128
    println!("cargo:rustc-link-arg=-mmcu=atmega128");

    // SPM only works from the boot section, so the whole image lives there
    println!(
        "cargo:rustc-link-arg=-Wl,--section-start=.text={:#x}",
        BOOT_SECTION_START
    );

    println!("cargo:warning=Building bootloader for ATmega128 at 16MHz");
}
