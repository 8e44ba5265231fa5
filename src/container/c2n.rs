//! Commodore C2N tape archive extractor and archiver
//!
//! A C2N stream is a sequence of 192-byte records.  A header record
//! announces a program (with start and end addresses) or a data file;
//! a data file's contents follow as data-block records carrying 191
//! payload bytes each.  An end-of-tape marker or any non-data record
//! terminates the preceding data file.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u8};
use nom::IResult;

use crate::archive::Archive;
use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::petscii::{Filename, Filetype};

/// Size of every tape record
const RECORD: usize = 192;

/// Relocatable (BASIC) program
const TAG_BASIC: u8 = 1;
/// Actual data block of a data file
const TAG_DATA_BLOCK: u8 = 2;
/// Absolute program
const TAG_ML: u8 = 3;
/// Data file header
const TAG_DATA_HEADER: u8 = 4;
/// End-of-tape header
const TAG_END: u8 = 5;

/// A parsed C2N tape header
struct C2nHeader {
    /// Header identifier tag
    tag: u8,
    /// Start address of the following block
    start: u16,
    /// End address of the following block
    end: u16,
    /// Commodore file name, padded with spaces
    filename: [u8; 16],
}

/// Parse the leading fields of a 192-byte tape header
fn c2n_header_parser(i: &[u8]) -> IResult<&[u8], C2nHeader> {
    let (i, tag) = le_u8(i)?;
    let (i, start) = le_u16(i)?;
    let (i, end) = le_u16(i)?;
    let (i, filename) = take(16_usize)(i)?;

    let mut name_buf = [0u8; 16];
    name_buf.copy_from_slice(filename);

    Ok((
        i,
        C2nHeader {
            tag,
            start,
            end,
            filename: name_buf,
        },
    ))
}

/// Copy a file name from a tape header, converting trailing spaces to
/// trailing shifted spaces
fn header_to_name(header: &C2nHeader, filetype: Filetype) -> Filename {
    let mut name = header.filename;
    for i in (0..16).rev() {
        if name[i] == 0x20 {
            name[i] = 0xA0;
        } else {
            break;
        }
    }
    Filename {
        name,
        filetype,
        record_length: 0,
    }
}

/// Copy a file name into a tape header, converting trailing shifted
/// spaces to spaces
fn name_to_header(name: &Filename, header: &mut [u8; RECORD]) {
    header.fill(0x20);
    header[5..21].copy_from_slice(&name.name);
    for i in (5..21).rev() {
        if header[i] == 0xA0 {
            header[i] = 0x20;
        } else {
            break;
        }
    }
}

/// Read and convert a Commodore C2N tape archive
///
/// # Arguments
///
/// - `data` - the tape stream contents
/// - `sink` - destination for the contained files
/// - `diag` - diagnostic output
pub fn read_c2n(data: &[u8], sink: &mut dyn FileSink, diag: &mut Diagnostics) -> Result<(), Error> {
    let mut pos = 0usize;

    'tape: while pos + RECORD <= data.len() {
        let mut record = &data[pos..pos + RECORD];
        pos += RECORD;

        'process: loop {
            let (_, header) = c2n_header_parser(record)?;

            let name = match header.tag {
                TAG_BASIC | TAG_ML => {
                    let name = header_to_name(&header, Filetype::Prg);
                    if (header.tag == TAG_BASIC && header.start & 0xFF != 1)
                        || header.start >= header.end
                    {
                        diag.warning(
                            Some(&name),
                            &format!(
                                "Suspicious addresses 0x{:04x}..0x{:04x}",
                                header.start, header.end
                            ),
                        );
                    }
                    name
                }
                TAG_DATA_HEADER => {
                    let name = header_to_name(&header, Filetype::Seq);
                    if header.start != 0x33C || header.end != 0x3FC {
                        diag.warning(
                            Some(&name),
                            &format!(
                                "Suspicious addresses 0x{:04x}..0x{:04x} (expected 0x33c..0x3fc)",
                                header.start, header.end
                            ),
                        );
                    }
                    if header.end.wrapping_sub(header.start) as u8 != 192 {
                        diag.warning(Some(&name), "Block length differs from 192");
                    }
                    name
                }
                TAG_END => {
                    let name = header_to_name(&header, Filetype::Del);
                    diag.info(Some(&name), "Ignoring end-of-tape marker");
                    continue 'tape;
                }
                _ => {
                    diag.error(None, &format!("Unknown C2N header code 0x{:02x}", header.tag));
                    return Err(invalid("unknown C2N header code"));
                }
            };

            if name.filetype == Filetype::Seq {
                // a data file: collect the following data blocks
                let mut payload: Vec<u8> = Vec::new();

                loop {
                    if pos + RECORD > data.len() {
                        // tape ends inside the file
                        if payload.is_empty() {
                            diag.warning(Some(&name), "no data");
                        }
                        sink.write_file(&name, &payload, diag)?;
                        break 'tape;
                    }

                    let block = &data[pos..pos + RECORD];
                    pos += RECORD;

                    if block[0] == TAG_DATA_BLOCK {
                        payload.extend_from_slice(&block[1..]);
                    } else {
                        if payload.is_empty() {
                            diag.warning(Some(&name), "no data");
                        }
                        sink.write_file(&name, &payload, diag)?;
                        // the record that ended this file is itself a
                        // header
                        record = block;
                        continue 'process;
                    }
                }
            } else {
                // a program: the payload follows the header in one run
                let length = usize::from(header.end.wrapping_sub(header.start));

                let mut buf = Vec::with_capacity(length + 2);
                buf.push(header.start as u8);
                buf.push((header.start >> 8) as u8);

                let end = (pos + length).min(data.len());
                if end - pos < length {
                    diag.warning(Some(&name), "Truncated file, proceeding anyway");
                }
                buf.extend_from_slice(&data[pos..end]);
                pos = end;

                sink.write_file(&name, &buf, diag)?;
                break 'process;
            }
        }
    }

    Ok(())
}

/// Serialize an archive in Commodore C2N tape format
///
/// Programs keep their original load addresses; everything else is
/// rewritten as a data file with 191-byte data blocks.
///
/// # Arguments
///
/// - `archive` - the archive to be written
///
/// # Returns
///
/// The tape stream as a byte vector
pub fn archive_c2n(archive: &Archive) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();

    for ae in &archive.entries {
        let mut header = [0u8; RECORD];
        name_to_header(&ae.name, &mut header);

        if ae.name.filetype == Filetype::Prg {
            if ae.data.len() < 2 {
                // too short to carry a load address
                continue;
            }

            let start = u16::from(ae.data[0]) | u16::from(ae.data[1]) << 8;
            let end = start.wrapping_add(ae.data.len() as u16).wrapping_sub(2);

            header[0] = if ae.data[0] == 1 { TAG_BASIC } else { TAG_ML };
            header[1] = ae.data[0];
            header[2] = ae.data[1];
            header[3] = end as u8;
            header[4] = (end >> 8) as u8;

            out.extend_from_slice(&header);
            out.extend_from_slice(&ae.data[2..]);
        } else {
            // convert anything else than programs to data files
            header[0] = TAG_DATA_HEADER;
            header[1] = 0x3C;
            header[2] = 0x03;
            header[3] = 0xFC;
            header[4] = 0x03;
            out.extend_from_slice(&header);

            let mut block = header;
            let mut cnt = 0usize;
            loop {
                let next = cnt + RECORD - 1;
                block[0] = TAG_DATA_BLOCK;
                if next > ae.data.len() {
                    let tail = ae.data.len() - cnt;
                    block[1..1 + tail].copy_from_slice(&ae.data[cnt..]);
                    block[1 + tail] = 0;
                } else {
                    block[1..RECORD].copy_from_slice(&ae.data[cnt..next]);
                }
                out.extend_from_slice(&block);
                cnt = next;
                if cnt >= ae.data.len() {
                    break;
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{archive_c2n, read_c2n, RECORD};
    use crate::archive::Archive;
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

    #[test]
    fn program_round_trip() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();

        let name = Filename::new(b"GAME", Filetype::Prg, 0);
        // machine language program at 0xC000
        let data = [&[0x00u8, 0xC0][..], &[0xEA; 10]].concat();
        archive.write_file(&name, &data, &mut diag).unwrap();

        let tape = archive_c2n(&archive).expect("archive failed");
        assert_eq!(tape.len(), RECORD + 10);
        assert_eq!(tape[0], 3); // absolute program

        let mut sink = Collector { files: Vec::new() };
        read_c2n(&tape, &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, name);
        assert_eq!(sink.files[0].1, data);
    }

    #[test]
    fn data_files_are_padded_to_blocks() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();

        let name = Filename::new(b"NOTES", Filetype::Seq, 0);
        let data = vec![0x41u8; 200];
        archive.write_file(&name, &data, &mut diag).unwrap();

        let tape = archive_c2n(&archive).expect("archive failed");
        // a data header plus two data blocks
        assert_eq!(tape.len(), 3 * RECORD);

        let mut sink = Collector { files: Vec::new() };
        read_c2n(&tape, &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, name);
        // payload is padded to whole data blocks
        assert_eq!(sink.files[0].1.len(), 2 * (RECORD - 1));
        assert_eq!(&sink.files[0].1[..200], &data[..]);
        assert_eq!(sink.files[0].1[200], 0);
    }

    #[test]
    fn basic_program_gets_relocatable_tag() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();

        let name = Filename::new(b"HELLO", Filetype::Prg, 0);
        let data = [0x01u8, 0x08, 0x0B, 0x08, 0x0A, 0x00];
        archive.write_file(&name, &data, &mut diag).unwrap();

        let tape = archive_c2n(&archive).expect("archive failed");
        assert_eq!(tape[0], 1); // relocatable program
    }

    #[test]
    fn unknown_tag_fails() {
        let mut record = vec![0u8; RECORD];
        record[0] = 9;
        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        assert!(read_c2n(&record, &mut sink, &mut diag).is_err());
    }
}
