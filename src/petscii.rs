//! PETSCII file names and Commodore file types
//!
//! File names on Commodore disks and tapes are 16 bytes of PETSCII,
//! padded at the end with shifted spaces (0xA0).  Equality is over the
//! full 16 bytes, never over a trimmed printable form: two names that
//! render the same but differ in padding are different files.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::fmt::{Debug, Display, Formatter, Result};

/// The shifted-space byte used to pad file names
pub const PAD: u8 = 0xA0;

/// Commodore file types
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Filetype {
    /// Deleted (sequential) file
    Del,
    /// Sequential data file
    Seq,
    /// Sequential program file
    Prg,
    /// Sequential data file with user-defined structure
    Usr,
    /// Random-access (relative) data file
    Rel,
    /// 1581 partition
    Cbm,
}

impl Filetype {
    /// The type code as stored in a directory entry, with the
    /// "closed" bit set.
    pub fn code(self) -> u8 {
        match self {
            Filetype::Del => 0x80,
            Filetype::Seq => 0x81,
            Filetype::Prg => 0x82,
            Filetype::Usr => 0x83,
            Filetype::Rel => 0x84,
            Filetype::Cbm => 0x85,
        }
    }

    /// Decode a directory entry type byte.  The flag bits (locked,
    /// unclosed) are masked off; type codes past CBM are invalid.
    pub fn from_code(code: u8) -> Option<Filetype> {
        match code & 0x8F {
            0x80 => Some(Filetype::Del),
            0x81 => Some(Filetype::Seq),
            0x82 => Some(Filetype::Prg),
            0x83 => Some(Filetype::Usr),
            0x84 => Some(Filetype::Rel),
            0x85 => Some(Filetype::Cbm),
            _ => None,
        }
    }
}

impl Display for Filetype {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let s = match self {
            Filetype::Del => "DEL",
            Filetype::Seq => "SEQ",
            Filetype::Prg => "PRG",
            Filetype::Usr => "USR",
            Filetype::Rel => "REL",
            Filetype::Cbm => "CBM",
        };
        write!(f, "{}", s)
    }
}

/// A Commodore file name: 16 bytes of PETSCII padded with shifted
/// spaces, a file type, and a record length (meaningful only for
/// relative files).
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Filename {
    /// The file name, padded with shifted spaces
    pub name: [u8; 16],
    /// The file type
    pub filetype: Filetype,
    /// Record length for random-access (relative) files
    pub record_length: u8,
}

impl Filename {
    /// Build a file name from raw PETSCII bytes.  Bytes past the end
    /// of `name` are padded with shifted spaces.
    pub fn new(name: &[u8], filetype: Filetype, record_length: u8) -> Filename {
        let mut buf = [PAD; 16];
        for (i, c) in name.iter().take(16).enumerate() {
            buf[i] = *c;
        }
        Filename {
            name: buf,
            filetype,
            record_length,
        }
    }

    /// Build a file name from an ASCII string, converting each
    /// character to PETSCII.
    pub fn from_ascii(name: &str, filetype: Filetype, record_length: u8) -> Filename {
        let converted: Vec<u8> = name.bytes().take(16).map(ascii_to_petscii).collect();
        Filename::new(&converted, filetype, record_length)
    }

    /// The name without the trailing shifted-space padding
    pub fn stem(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .rposition(|c| *c != PAD)
            .map_or(0, |i| i + 1);
        &self.name[..end]
    }

    /// Convert the file name to a printable ASCII string with a type
    /// suffix, e.g. `howto,prg` or `data,l80`.
    ///
    /// Upper-case PETSCII graphics map to upper-case ASCII, the
    /// unshifted letter range maps to lower case, printable ASCII
    /// passes through and anything else becomes an underscore.
    pub fn printable(&self) -> String {
        let mut buf = String::with_capacity(21);

        for c in self.stem() {
            buf.push(match *c {
                0x41..=0x5A => (c - 0x41 + b'a') as char,
                0xC1..=0xDA => (c - 0xC1 + b'A') as char,
                0x61..=0x7A => (c - 0x61 + b'A') as char,
                0x20..=0x5F => *c as char,
                _ => '_',
            });
        }

        match self.filetype {
            Filetype::Del => buf.push_str(",del"),
            Filetype::Seq => buf.push_str(",seq"),
            Filetype::Prg => buf.push_str(",prg"),
            Filetype::Usr => buf.push_str(",usr"),
            Filetype::Rel => buf.push_str(&format!(",l{:02X}", self.record_length)),
            Filetype::Cbm => buf.push_str(",cbm"),
        }

        buf
    }
}

impl Display for Filename {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.printable())
    }
}

impl Debug for Filename {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.printable())
    }
}

/// Convert an ASCII character to PETSCII
///
/// Control characters become `-` and graphics characters become `+`,
/// so any host file name maps to something a Commodore drive would
/// accept.
pub fn ascii_to_petscii(c: u8) -> u8 {
    if c.is_ascii_uppercase() {
        c - b'A' + 0xC1
    } else if c.is_ascii_lowercase() {
        c - b'a' + 0x41
    } else if (c & 127) < 32 {
        b'-'
    } else if c == PAD {
        c
    } else if c > b'z' {
        b'+'
    } else {
        c
    }
}

#[cfg(test)]
mod tests {
    use super::{ascii_to_petscii, Filename, Filetype, PAD};
    use pretty_assertions::assert_eq;

    #[test]
    fn names_are_padded() {
        let name = Filename::new(b"HOWTO", Filetype::Prg, 0);
        assert_eq!(&name.name[..5], b"HOWTO");
        assert!(name.name[5..].iter().all(|c| *c == PAD));
        assert_eq!(name.stem(), b"HOWTO");
    }

    #[test]
    fn equality_covers_padding() {
        let a = Filename::new(b"A", Filetype::Prg, 0);
        let mut b = a;
        b.name[15] = b' ';
        assert_ne!(a, b);
    }

    #[test]
    fn printable_mapping() {
        // unshifted letters render lower case, shifted letters upper case
        let name = Filename::new(b"README", Filetype::Seq, 0);
        assert_eq!(name.printable(), "readme,seq");

        let name = Filename::new(&[0xC1, 0xC2, b'1'], Filetype::Usr, 0);
        assert_eq!(name.printable(), "AB1,usr");

        let name = Filename::new(&[0x12, b'X'], Filetype::Del, 0);
        assert_eq!(name.printable(), "_x,del");
    }

    #[test]
    fn relative_suffix_carries_record_length() {
        let name = Filename::new(b"DATA", Filetype::Rel, 0xFE);
        assert_eq!(name.printable(), "data,lFE");
    }

    #[test]
    fn ascii_round_trips_through_petscii() {
        let name = Filename::from_ascii("howto", Filetype::Prg, 0);
        assert_eq!(name.printable(), "howto,prg");
        assert_eq!(ascii_to_petscii(b'A'), 0xC1);
        assert_eq!(ascii_to_petscii(0x01), b'-');
        assert_eq!(ascii_to_petscii(b'{'), b'+');
    }

    #[test]
    fn type_codes_round_trip() {
        for t in [
            Filetype::Del,
            Filetype::Seq,
            Filetype::Prg,
            Filetype::Usr,
            Filetype::Rel,
            Filetype::Cbm,
        ] {
            assert_eq!(Filetype::from_code(t.code()), Some(t));
        }
        // flag bits are ignored
        assert_eq!(Filetype::from_code(0xC2), Some(Filetype::Prg));
        assert_eq!(Filetype::from_code(0x86), None);
        assert_eq!(Filetype::from_code(0x02), None);
    }
}
