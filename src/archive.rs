//! An in-memory collection of Commodore files
//!
//! Lynx and C2N archives are written in one pass from a complete file
//! list, so conversions targeting them accumulate files here first and
//! serialize the collection when all inputs have been read.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::fmt::{Display, Formatter, Result};

use crate::diag::Diagnostics;
use crate::error::Error;
use crate::petscii::{Filename, Filetype};

/// An entry in a file archive
pub struct ArchiveEntry {
    /// The file name of the entry
    pub name: Filename,
    /// The contents of the entry
    pub data: Vec<u8>,
}

/// A file archive.  Entries keep their insertion order.
#[derive(Default)]
pub struct Archive {
    /// The archive entries, first to last
    pub entries: Vec<ArchiveEntry>,
}

impl Archive {
    /// Create an empty archive
    pub fn new() -> Archive {
        Archive::default()
    }

    /// Write a file to the archive.
    ///
    /// Only file types that can exist on tape or in a Lynx directory
    /// are accepted.  A file whose full 16-byte name, type and record
    /// length match an existing entry is rejected.
    ///
    /// # Arguments
    ///
    /// - `name` - native (PETSCII) name of the file
    /// - `data` - the contents of the file
    /// - `diag` - diagnostic output
    pub fn write_file(
        &mut self,
        name: &Filename,
        data: &[u8],
        diag: &mut Diagnostics,
    ) -> std::result::Result<(), Error> {
        match name.filetype {
            Filetype::Del | Filetype::Seq | Filetype::Prg | Filetype::Usr | Filetype::Rel => {}
            _ => {
                diag.error(Some(name), "Unsupported file type.");
                return Err(crate::error::invalid("unsupported file type"));
            }
        }

        if self.entries.iter().any(|ae| ae.name == *name) {
            return Err(Error::file_exists());
        }

        self.entries.push(ArchiveEntry {
            name: *name,
            data: data.to_vec(),
        });

        Ok(())
    }

    /// Number of files in the archive
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the archive holds no files
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Display for Archive {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        writeln!(f, "archive of {} files", self.entries.len())?;
        for ae in &self.entries {
            writeln!(f, "{} ({} bytes)", ae.name, ae.data.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Archive;
    use crate::diag::Diagnostics;
    use crate::petscii::{Filename, Filetype};

    #[test]
    fn entries_keep_insertion_order() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();

        for name in [&b"ONE"[..], b"TWO", b"THREE"] {
            archive
                .write_file(&Filename::new(name, Filetype::Prg, 0), b"x", &mut diag)
                .unwrap();
        }

        let names: Vec<_> = archive.entries.iter().map(|ae| ae.name.stem()).collect();
        assert_eq!(names, vec![&b"ONE"[..], b"TWO", b"THREE"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();
        let name = Filename::new(b"SAME", Filetype::Seq, 0);

        archive.write_file(&name, b"abc", &mut diag).unwrap();
        let err = archive.write_file(&name, b"def", &mut diag).unwrap_err();
        assert!(err.is_file_exists());

        // a different type is a different file
        let other = Filename::new(b"SAME", Filetype::Prg, 0);
        archive.write_file(&other, b"def", &mut diag).unwrap();
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn partitions_are_not_archivable() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();
        let name = Filename::new(b"PART", Filetype::Cbm, 0);
        assert!(archive.write_file(&name, b"x", &mut diag).is_err());
    }
}
