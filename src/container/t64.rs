//! Tape archive extractor for the C64S emulator's T64 format
//!
//! A T64 file is a fixed 64-byte header followed by a directory of
//! 32-byte entries; payloads live at absolute offsets recorded in the
//! entries.  The stored end address is frequently wrong in the wild,
//! so the payload length is recomputed from the start/end address
//! pair and truncation is tolerated.

use log::debug;

use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u32, le_u8};
use nom::IResult;

use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::petscii::{Filename, Filetype};

/// A C64S T64 file header
struct T64Header {
    /// Header identifier block (magic cookie)
    signature: [u8; 32],
    /// Minor version number
    minor_version: u8,
    /// Major version number
    major_version: u8,
    /// Maximum number of directory entries
    max_entries: u16,
    /// Actual number of directory entries
    num_entries: u16,
}

/// A T64 directory entry
struct T64Entry {
    /// 1 == normal file
    entry_type: u8,
    /// Commodore file type (1 or $82 for PRG)
    file_type: u8,
    /// The file's start address
    start_addr: u16,
    /// The file's end address
    end_addr: u16,
    /// Absolute offset of the payload in the T64 file
    file_offset: u32,
    /// Commodore file name, padded with spaces
    name: [u8; 16],
}

/// Accepted signature prefixes
static T64_SIGNATURES: [&[u8]; 3] = [
    b"C64 tape image file",
    b"C64S tape file",
    b"C64S tape image file",
];

/// Parse the 64-byte T64 file header
fn t64_header_parser(i: &[u8]) -> IResult<&[u8], T64Header> {
    let (i, signature) = take(32_usize)(i)?;
    let (i, minor_version) = le_u8(i)?;
    let (i, major_version) = le_u8(i)?;
    let (i, max_entries) = le_u16(i)?;
    let (i, num_entries) = le_u16(i)?;
    let (i, _padding) = take(26_usize)(i)?;

    let mut sig = [0u8; 32];
    sig.copy_from_slice(signature);

    Ok((
        i,
        T64Header {
            signature: sig,
            minor_version,
            major_version,
            max_entries,
            num_entries,
        },
    ))
}

/// Parse one 32-byte directory entry
fn t64_entry_parser(i: &[u8]) -> IResult<&[u8], T64Entry> {
    let (i, entry_type) = le_u8(i)?;
    let (i, file_type) = le_u8(i)?;
    let (i, start_addr) = le_u16(i)?;
    let (i, end_addr) = le_u16(i)?;
    let (i, _padding1) = take(2_usize)(i)?;
    let (i, file_offset) = le_u32(i)?;
    let (i, _padding2) = take(4_usize)(i)?;
    let (i, name) = take(16_usize)(i)?;

    let mut name_buf = [0u8; 16];
    name_buf.copy_from_slice(name);

    Ok((
        i,
        T64Entry {
            entry_type,
            file_type,
            start_addr,
            end_addr,
            file_offset,
            name: name_buf,
        },
    ))
}

/// Read and convert a tape archive of the C64S emulator
///
/// # Arguments
///
/// - `data` - the T64 file contents
/// - `sink` - destination for the contained files
/// - `diag` - diagnostic output
pub fn read_t64(data: &[u8], sink: &mut dyn FileSink, diag: &mut Diagnostics) -> Result<(), Error> {
    let header = match t64_header_parser(data) {
        Ok((_, header)) => header,
        Err(_) => {
            diag.error(None, "Truncated T64 header");
            return Err(invalid("truncated T64 header"));
        }
    };

    if !T64_SIGNATURES
        .iter()
        .any(|sig| header.signature.starts_with(sig))
    {
        diag.error(None, "Unknown T64 header");
        return Err(invalid("unknown T64 header"));
    }

    if header.major_version != 1 || header.minor_version != 0 {
        diag.error(None, "Unknown T64 version, trying anyway");
    }

    let num_entries = if header.num_entries == 0 {
        diag.warning(
            None,
            "Number of entries set to zero; trying to read the first entry",
        );
        1
    } else if header.num_entries > header.max_entries {
        diag.error(None, "Error in the number of entries");
        return Err(invalid("bad T64 entry count"));
    } else {
        header.num_entries
    };

    diag.info(
        None,
        &format!(
            "T64 version {}.{}, {}/{} files",
            header.major_version, header.minor_version, num_entries, header.max_entries
        ),
    );

    for index in 0..num_entries as usize {
        let offset = 64 + index * 32;
        let entry = match data.get(offset..offset + 32).map(t64_entry_parser) {
            Some(Ok((_, entry))) => entry,
            _ => {
                diag.error(None, "Truncated T64 directory");
                return Err(invalid("truncated T64 directory"));
            }
        };

        let mut name_buf = entry.name;
        // convert trailing spaces to shifted spaces; the first
        // character is left alone
        for i in (1..16).rev() {
            if name_buf[i] == b' ' {
                name_buf[i] = 0xA0;
            } else {
                break;
            }
        }

        let mut name = Filename {
            name: name_buf,
            filetype: Filetype::Prg,
            record_length: 0,
        };

        if entry.entry_type != 1 {
            diag.error(
                Some(&name),
                &format!(
                    "Unknown entry type 0x{:02x} 0x{:02x}, assuming PRG",
                    entry.entry_type, entry.file_type
                ),
            );
        } else if entry.file_type != 1 {
            match Filetype::from_code(entry.file_type) {
                Some(t) if matches!(t, Filetype::Del | Filetype::Seq | Filetype::Prg | Filetype::Usr) => {
                    name.filetype = t;
                }
                _ => {
                    diag.error(
                        Some(&name),
                        &format!(
                            "Unknown entry type 0x{:02x} 0x{:02x}, assuming PRG",
                            entry.entry_type, entry.file_type
                        ),
                    );
                }
            }
        }

        let length = usize::from(entry.end_addr.wrapping_sub(entry.start_addr));

        debug!(
            "T64 entry {}: {} bytes at offset {}",
            index, length, entry.file_offset
        );

        // the payload carries its two-byte load address
        let mut buf = Vec::with_capacity(length + 2);
        buf.push(entry.start_addr as u8);
        buf.push((entry.start_addr >> 8) as u8);

        let start = (entry.file_offset as usize).min(data.len());
        let end = (start + length).min(data.len());
        if end - start < length {
            diag.warning(Some(&name), "Truncated file, proceeding anyway");
        }
        buf.extend_from_slice(&data[start..end]);

        sink.write_file(&name, &buf, diag)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::read_t64;
    use crate::container::FileSink;
    use crate::diag::Diagnostics;
    use crate::error::Error;
    use crate::petscii::{Filename, Filetype};
    use pretty_assertions::assert_eq;

    struct Collector {
        files: Vec<(Filename, Vec<u8>)>,
    }

    impl FileSink for Collector {
        fn write_file(
            &mut self,
            name: &Filename,
            data: &[u8],
            _diag: &mut Diagnostics,
        ) -> Result<(), Error> {
            self.files.push((*name, data.to_vec()));
            Ok(())
        }
    }

    fn build_t64(entries: &[(&[u8], u16, &[u8])]) -> Vec<u8> {
        let mut out = vec![0u8; 64];
        out[..20].copy_from_slice(b"C64 tape image file\0");
        out[32] = 0; // minor
        out[33] = 1; // major
        out[34..36].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        out[36..38].copy_from_slice(&(entries.len() as u16).to_le_bytes());

        let dir_end = 64 + entries.len() * 32;
        let mut payload_offset = dir_end as u32;
        let mut payloads = Vec::new();

        for (name, start, data) in entries {
            let mut entry = vec![0u8; 32];
            entry[0] = 1;
            entry[1] = 1;
            entry[2..4].copy_from_slice(&start.to_le_bytes());
            let end = start.wrapping_add(data.len() as u16);
            entry[4..6].copy_from_slice(&end.to_le_bytes());
            entry[8..12].copy_from_slice(&payload_offset.to_le_bytes());
            let mut name_buf = [b' '; 16];
            name_buf[..name.len()].copy_from_slice(name);
            entry[16..32].copy_from_slice(&name_buf);
            out.extend_from_slice(&entry);
            payloads.extend_from_slice(data);
            payload_offset += data.len() as u32;
        }

        out.extend_from_slice(&payloads);
        out
    }

    #[test]
    fn extracts_program_with_load_address() {
        let image = build_t64(&[(b"GAME", 0x0801, b"\xA9\x00\x60")]);
        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();

        read_t64(&image, &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        let (name, data) = &sink.files[0];
        assert_eq!(*name, Filename::new(b"GAME", Filetype::Prg, 0));
        assert_eq!(data, &vec![0x01, 0x08, 0xA9, 0x00, 0x60]);
    }

    #[test]
    fn trailing_spaces_become_shifted_spaces() {
        let image = build_t64(&[(b"AB", 0x1000, b"xy")]);
        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();

        read_t64(&image, &mut sink, &mut diag).expect("read failed");
        assert_eq!(sink.files[0].0, Filename::new(b"AB", Filetype::Prg, 0));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let mut image = vec![0u8; 96];
        image[..4].copy_from_slice(b"RIFF");
        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        assert!(read_t64(&image, &mut sink, &mut diag).is_err());
    }
}
