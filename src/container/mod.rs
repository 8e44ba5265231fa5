#![warn(missing_docs)]
#![warn(unsafe_code)]
//!
//! Archive and tape container codecs
//!
//! Every reader in this module walks one container format and hands
//! each contained file to a [`FileSink`].  The sink decides where the
//! file ends up: a disk image, another archive, or host files.

use crate::diag::Diagnostics;
use crate::error::Error;
use crate::petscii::Filename;

/// Sticky-EOF bit and byte reader
pub mod bitstream;

/// ARC/SDA archive decoder
pub mod arc;

/// Arkive archive reader
pub mod arkive;

/// Commodore C2N tape stream codec
pub mod c2n;

/// Lynx archive codec
pub mod lynx;

/// C64S T64 tape catalog reader
pub mod t64;

/// Zip-Code compressed disk codec
pub mod zipcode;

/// Destination for files extracted from a container.
///
/// Exactly one sink is active per conversion run.  A sink failure is
/// reported through the error kind: `NoSpace` and `FileExists` are
/// meaningful to the orchestrator (it may switch disk images),
/// anything else aborts the run.
pub trait FileSink {
    /// Write one file to the sink
    ///
    /// # Arguments
    ///
    /// - `name` - native (PETSCII) name of the file
    /// - `data` - the contents of the file
    /// - `diag` - diagnostic output
    fn write_file(
        &mut self,
        name: &Filename,
        data: &[u8],
        diag: &mut Diagnostics,
    ) -> Result<(), Error>;
}
