//! Arkive archive extractor
//!
//! An Arkive file starts with a file count byte and a directory of
//! 29-byte entries copied nearly verbatim from CBM DOS directory
//! slots.  Payloads follow the directory, rounded up to a 254-byte
//! boundary; relative files carry their last side sector in-line.

use nom::bytes::complete::take;
use nom::number::complete::le_u8;
use nom::IResult;

use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::petscii::{Filename, Filetype};
use crate::rounddiv;

/// One Commodore disk block of payload
const BLOCK: usize = 254;

/// Arkive directory entry
struct ArkiveEntry {
    /// Commodore file type
    filetype: u8,
    /// Number of bytes in the last sector
    last_sector_length: u8,
    /// Commodore file name
    name: [u8; 16],
    /// Record length for random-access (relative) files
    record_length: u8,
    /// Number of side sectors for relative files
    sidesect_count: u8,
    /// Length of the last side sector
    sidesect_last_length: u8,
    /// The file's block count
    blocks: u16,
}

/// Size of a directory entry on file
const ENTRY_SIZE: usize = 29;

/// Parse one Arkive directory entry
fn arkive_entry_parser(i: &[u8]) -> IResult<&[u8], ArkiveEntry> {
    let (i, filetype) = le_u8(i)?;
    let (i, last_sector_length) = le_u8(i)?;
    let (i, name) = take(16_usize)(i)?;
    let (i, record_length) = le_u8(i)?;
    let (i, _unknown) = take(6_usize)(i)?;
    let (i, sidesect_count) = le_u8(i)?;
    let (i, sidesect_last_length) = le_u8(i)?;
    let (i, blocks_low) = le_u8(i)?;
    let (i, blocks_high) = le_u8(i)?;

    let mut name_buf = [0u8; 16];
    name_buf.copy_from_slice(name);

    Ok((
        i,
        ArkiveEntry {
            filetype,
            last_sector_length,
            name: name_buf,
            record_length,
            sidesect_count,
            sidesect_last_length,
            blocks: u16::from(blocks_low) | u16::from(blocks_high) << 8,
        },
    ))
}

/// Read and convert an Arkive archive
///
/// # Arguments
///
/// - `data` - the archive file contents
/// - `sink` - destination for the contained files
/// - `diag` - diagnostic output
pub fn read_arkive(
    data: &[u8],
    sink: &mut dyn FileSink,
    diag: &mut Diagnostics,
) -> Result<(), Error> {
    let file_count = match data.first() {
        Some(count) => *count as usize,
        None => {
            diag.error(None, "File header read failed");
            return Err(invalid("empty Arkive file"));
        }
    };

    let mut header_pos = 1usize;
    let mut archive_pos = BLOCK * rounddiv(header_pos + file_count * ENTRY_SIZE, BLOCK);

    for _ in 0..file_count {
        let entry = match data
            .get(header_pos..header_pos + ENTRY_SIZE)
            .map(arkive_entry_parser)
        {
            Some(Ok((_, entry))) => entry,
            _ => {
                diag.error(None, "File header read failed");
                return Err(invalid("truncated Arkive directory"));
            }
        };

        header_pos += ENTRY_SIZE;

        let blocks = entry.blocks as usize;
        let mut length = (BLOCK * blocks + entry.last_sector_length as usize).saturating_sub(255);

        let mut name = Filename {
            name: entry.name,
            filetype: Filetype::Del,
            record_length: entry.record_length,
        };

        // the type byte carries DOS flag bits in the middle
        name.filetype = match entry.filetype & 0xC7 {
            0x80 => Filetype::Del,
            0x81 => Filetype::Seq,
            0x82 => Filetype::Prg,
            0x84 => {
                if name.record_length == 0 {
                    diag.warning(Some(&name), "zero record length");
                }

                let sidesect_count = (blocks + 119) / 121;
                let sidesect_last_length = 15 + 2 * ((blocks - sidesect_count) % 120);

                if entry.sidesect_count as usize != sidesect_count
                    || entry.sidesect_last_length as usize != sidesect_last_length
                {
                    diag.error(Some(&name), "improper side sector length");
                    diag.error(Some(&name), "Following files may be totally wrong!");
                }

                length = ((blocks - sidesect_count) * BLOCK + entry.last_sector_length as usize)
                    .saturating_sub(255);

                Filetype::Rel
            }
            _ => {
                diag.error(Some(&name), "Unknown type, defaulting to DEL");
                Filetype::Del
            }
        };

        let payload = match data.get(archive_pos..archive_pos + length) {
            Some(payload) => payload,
            None => {
                diag.error(Some(&name), "Truncated Arkive payload");
                return Err(invalid("truncated Arkive payload"));
            }
        };

        archive_pos += BLOCK * blocks;
        if name.filetype == Filetype::Rel {
            // Arkive stores the last side sector, wasting a block for
            // each relative file
            archive_pos -= BLOCK * (entry.sidesect_count as usize).saturating_sub(1);
        }

        sink.write_file(&name, payload, diag)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_arkive, BLOCK, ENTRY_SIZE};
    use crate::container::FileSink;
    use crate::diag::Diagnostics;
    use crate::error::Error;
    use crate::petscii::{Filename, Filetype};
    use crate::rounddiv;
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

    fn entry(filetype: u8, name: &[u8], data_len: usize) -> [u8; ENTRY_SIZE] {
        let mut e = [0u8; ENTRY_SIZE];
        let blocks = rounddiv(data_len, BLOCK).max(1);
        e[0] = filetype;
        e[1] = (data_len - BLOCK * (blocks - 1) + 1) as u8;
        let mut name_buf = [0xA0u8; 16];
        name_buf[..name.len()].copy_from_slice(name);
        e[2..18].copy_from_slice(&name_buf);
        e[27] = blocks as u8;
        e[28] = (blocks >> 8) as u8;
        e
    }

    #[test]
    fn sequential_files_extract() {
        let payload = vec![0x55u8; 300];

        let mut image = vec![1u8];
        image.extend_from_slice(&entry(0x81, b"DATA", payload.len()));
        image.resize(BLOCK * rounddiv(1 + ENTRY_SIZE, BLOCK), 0);
        image.extend_from_slice(&payload);
        image.resize(image.len() + 2 * BLOCK - payload.len(), 0);

        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        read_arkive(&image, &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, Filename::new(b"DATA", Filetype::Seq, 0));
        assert_eq!(sink.files[0].1, payload);
    }

    #[test]
    fn empty_input_fails() {
        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        assert!(read_arkive(&[], &mut sink, &mut diag).is_err());
    }
}
