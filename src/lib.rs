#![warn(missing_docs)]
#![warn(unsafe_code)]
//! cbm_convert is a library crate for converting files between
//! Commodore 8-bit storage containers: CBM DOS and C128 CP/M disk
//! images, Lynx, ARC/SDA, Arkive, T64 and C2N archives, Zip-Code
//! compressed disks, and host files in raw or PC64 form.
//!
//! The [`convert`] module ties one input reader to one write sink;
//! the container codecs live under [`container`] and the disk image
//! engine under [`image`].
//!
use log::error;

pub mod archive;
pub mod config;
pub mod container;
pub mod convert;
pub mod diag;
pub mod error;
pub mod file;
pub mod host;
pub mod image;
pub mod petscii;

/// Rounded integer division: `a / b` rounded up to the next integer
/// value.  Block and record counts all round this way.
pub fn rounddiv(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Initialize the module.
/// This should be called before any parsing is performed.
/// Panics on failure or if there are any incompatibilities.
pub fn init() {
    // If we're on a system with a usize < 32 bits then fail.  Whole
    // disk images are held in single buffers and indexed with usize,
    // so 16-bit targets cannot work.
    if usize::BITS < 32 {
        error!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
        panic!(
            "Architecture usize {} is too small for this library",
            usize::BITS
        );
    }
}

#[cfg(test)]
mod tests {
    use super::rounddiv;

    #[test]
    fn rounddiv_rounds_up() {
        assert_eq!(rounddiv(0, 254), 0);
        assert_eq!(rounddiv(1, 254), 1);
        assert_eq!(rounddiv(254, 254), 1);
        assert_eq!(rounddiv(255, 254), 2);
        assert_eq!(rounddiv(200, 120), 2);
    }
}
