//! Lynx archive extractor and archiver
//!
//! A Lynx archive starts with an optional BASIC loader, then an ASCII
//! text header: the size of the header region in 254-byte blocks, a
//! signature containing `LYNX`, the number of files, and one
//! directory line per file.  File payloads follow the header region,
//! each aligned to a 254-byte block boundary.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::debug;

use crate::archive::Archive;
use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::petscii::{Filename, Filetype};
use crate::rounddiv;

/// Maximal length of the BASIC header, if any
const MAX_BASIC_LENGTH: usize = 1024;

/// One Commodore disk block of payload
const BLOCK: usize = 254;

/// Scanner over the ASCII directory text
struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(data: &'a [u8], pos: usize) -> Scanner<'a> {
        Scanner { data, pos }
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn byte(&mut self) -> Option<u8> {
        let c = self.data.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.data.get(self.pos) {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    /// Consume at most `max` blanks (space or carriage return)
    fn skip_blanks(&mut self, max: usize) {
        for _ in 0..max {
            match self.data.get(self.pos) {
                Some(b' ') | Some(b'\r') => self.pos += 1,
                _ => break,
            }
        }
    }

    /// Skip whitespace and parse an unsigned decimal number
    fn number(&mut self) -> Option<u32> {
        self.skip_whitespace();
        let mut value: u32 = 0;
        let mut any = false;
        while let Some(c) = self.data.get(self.pos) {
            if c.is_ascii_digit() {
                value = value.wrapping_mul(10).wrapping_add(u32::from(c - b'0'));
                self.pos += 1;
                any = true;
            } else {
                break;
            }
        }
        if any {
            Some(value)
        } else {
            None
        }
    }
}

/// Find the end of a leading BASIC loader: the zero line link and the
/// final carriage return, within the first kilobyte.
fn skip_basic_header(data: &[u8]) -> usize {
    let end = MAX_BASIC_LENGTH.min(data.len());
    for i in 4..end {
        if data[i - 4..i] == [0, 0, 0, 0x0D] {
            return i;
        }
    }
    0
}

/// Read and convert a Lynx archive
///
/// # Arguments
///
/// - `data` - the archive file contents
/// - `sink` - destination for the contained files
/// - `diag` - diagnostic output
pub fn read_lynx(
    data: &[u8],
    sink: &mut dyn FileSink,
    diag: &mut Diagnostics,
) -> Result<(), Error> {
    let mut scan = Scanner::new(data, skip_basic_header(data));

    // set if the length of the last file is unknown
    let mut err_no_length = false;

    // the header region size in blocks, the signature, and the file
    // count
    let (blk_count, file_count) = {
        let blk_count = scan.number();
        scan.skip_whitespace();
        let tag_start = scan.pos;
        let tag_end = (tag_start + 24).min(data.len());
        let tag = &data[tag_start..tag_end];
        scan.seek(tag_end);
        let file_count = scan.number();
        scan.skip_blanks(2);

        match (blk_count, file_count) {
            (Some(blocks), Some(files))
                if blocks != 0 && files != 0 && tag.windows(4).any(|w| w == b"LYNX") =>
            {
                (blocks, files)
            }
            _ => {
                diag.error(None, "Not a Lynx archive.");
                return Err(invalid("not a Lynx archive"));
            }
        }
    };

    let mut header_pos = scan.pos;
    let header_end = BLOCK * blk_count as usize;
    let mut archive_pos = header_end;

    debug!("Lynx archive: {} header blocks, {} files", blk_count, file_count);

    for f in 1..=file_count {
        let hdr_error = || {
            invalid("Lynx header error")
        };

        if header_pos >= header_end {
            diag.error(None, "Lynx header error.");
            return Err(hdr_error());
        }

        scan.seek(header_pos);

        // the file name, terminated by a carriage return
        let mut name_buf = [0xA0u8; 16];
        let mut name_len = 0usize;
        loop {
            let c = match scan.byte() {
                Some(c) => c,
                None => {
                    diag.error(None, "Lynx header error.");
                    return Err(hdr_error());
                }
            };
            if c == 13 {
                break;
            }
            if name_len > 15 {
                diag.error(None, "Too long file name");
                return Err(invalid("too long file name"));
            }
            name_buf[name_len] = c;
            name_len += 1;
        }

        if name_len == 0 {
            diag.warning(None, "blank file name");
        }

        let mut blocks = match scan.number() {
            Some(b) => b,
            None => {
                diag.error(None, "Lynx header error.");
                return Err(hdr_error());
            }
        };
        scan.skip_whitespace();
        let filetype_char = match scan.byte() {
            Some(c) => c,
            None => {
                diag.error(None, "Lynx header error.");
                return Err(hdr_error());
            }
        };
        scan.skip_whitespace();

        let not_last_file = f < file_count;

        let mut length = match scan.number() {
            Some(len) => {
                scan.skip_blanks(2);
                len
            }
            None => {
                // the length must be known for relative files and for
                // all but the last file
                if filetype_char == b'R' || !not_last_file {
                    diag.error(None, "Lynx header error.");
                    return Err(hdr_error());
                }
                err_no_length = true;
                255
            }
        };

        let mut name = Filename {
            name: name_buf,
            filetype: Filetype::Del,
            record_length: 0,
        };

        name.filetype = match filetype_char {
            b'D' => Filetype::Del,
            b'S' => Filetype::Seq,
            b'P' => Filetype::Prg,
            b'U' => Filetype::Usr,
            b'R' => Filetype::Rel,
            _ => {
                diag.error(Some(&name), "Unknown type, defaulting to DEL");
                Filetype::Del
            }
        };

        if name.filetype == Filetype::Rel {
            name.record_length = length as u8;

            // side sectors are stored in-line and counted in the
            // block total
            let side_sectors = (blocks + 119) / 121;

            if side_sectors == 0
                || blocks < 121 * side_sectors - 119
                || blocks > 121 * side_sectors
            {
                diag.error(None, "Lynx header error.");
                return Err(hdr_error());
            }

            blocks -= side_sectors;
            archive_pos += BLOCK * side_sectors as usize;

            length = match scan.number() {
                Some(len) => {
                    scan.skip_whitespace();
                    len
                }
                None => {
                    if not_last_file {
                        diag.error(None, "Lynx header error.");
                        return Err(hdr_error());
                    }
                    err_no_length = true;
                    255
                }
            };

            if name.record_length == 0 {
                diag.warning(Some(&name), "zero record length");
            }
        }

        if (blocks != 0 && length < 2) || length == 1 || (blocks == 0 && length != 0) {
            diag.error(Some(&name), "illegal length, skipping file");
            diag.error(
                Some(&name),
                "FATAL: the archive may be corrupted from this point on!",
            );
            continue;
        }

        let length = if blocks != 0 {
            length as usize + blocks as usize * BLOCK - 255
        } else {
            0
        };

        if name.filetype == Filetype::Rel
            && name.record_length != 0
            && length % name.record_length as usize != 0
        {
            diag.warning(Some(&name), "non-integer record count");
        }

        header_pos = scan.pos;

        // extract the file
        let available = data.len().saturating_sub(archive_pos).min(length);
        if available < length {
            diag.warning(Some(&name), "Truncated file, proceeding anyway");
        }
        let payload = &data[archive_pos.min(data.len())..archive_pos.min(data.len()) + available];

        archive_pos += BLOCK * blocks as usize;

        sink.write_file(&name, payload, diag)?;
    }

    if err_no_length {
        diag.warning(None, "The last file may be too long.");
    }

    Ok(())
}

/// The BASIC loader written in front of every Lynx archive
static BASIC_HEADER: [u8; 95] = [
    0x01, 0x08, 0x5b, 0x08, 0x0a, 0x00, 0x97, 0x35, 0x33, 0x32, 0x38, 0x30, 0x2c, 0x30, 0x3a,
    0x97, 0x35, 0x33, 0x32, 0x38, 0x31, 0x2c, 0x30, 0x3a, 0x97, 0x36, 0x34, 0x36, 0x2c, 0xc2,
    0x28, 0x31, 0x36, 0x32, 0x29, 0x3a, 0x99, 0x22, 0x93, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11,
    0x11, 0x11, 0x22, 0x3a, 0x99, 0x22, 0x20, 0x20, 0x20, 0x20, 0x20, 0x55, 0x53, 0x45, 0x20,
    0x4c, 0x59, 0x4e, 0x58, 0x20, 0x54, 0x4f, 0x20, 0x44, 0x49, 0x53, 0x53, 0x4f, 0x4c, 0x56,
    0x45, 0x20, 0x54, 0x48, 0x49, 0x53, 0x20, 0x46, 0x49, 0x4c, 0x45, 0x22, 0x3a, 0x89, 0x31,
    0x30, 0x00, 0x00, 0x00, 0x0d,
];

/// The 24-character archive signature
static LYNX_TAG: &str = "*LYNX BY CBMCONVERT 1.0*";

/// Serialize an archive in Lynx format
///
/// # Arguments
///
/// - `archive` - the archive to be written
///
/// # Returns
///
/// The Lynx file image as a byte vector
pub fn archive_lynx(archive: &Archive) -> Result<Vec<u8>, Error> {
    if archive.is_empty() {
        return Err(invalid("cannot write an empty Lynx archive"));
    }

    let file_count = archive.len();
    let mut out = Vec::new();

    out.extend_from_slice(&BASIC_HEADER);

    // this is a bit overestimating the header size
    let mut block_counter = rounddiv(
        BASIC_HEADER.len() + 20 + LYNX_TAG.len() + 1 + 36 * file_count,
        BLOCK,
    );

    out.extend_from_slice(format!(" {}  {}\r {} \r", block_counter, LYNX_TAG, file_count).as_bytes());

    // the directory
    for ae in &archive.entries {
        // carriage returns in names would break the text format
        for c in ae.name.name.iter() {
            out.push(if *c == 13 { b'.' } else { *c });
        }

        let blocks = rounddiv(ae.data.len(), BLOCK);
        let recorded = if ae.name.filetype == Filetype::Rel {
            blocks + rounddiv(blocks, 120)
        } else {
            blocks
        };

        out.extend_from_slice(
            format!(
                "\r {}\r{}\r",
                recorded,
                char::from(b"DSPUR"[(ae.name.filetype.code() & 7) as usize])
            )
            .as_bytes(),
        );

        if ae.name.filetype == Filetype::Rel {
            out.extend_from_slice(format!(" {} \r", ae.name.record_length).as_bytes());
        }

        let last_sector_length = if ae.data.len() % BLOCK != 0 {
            ae.data.len() - BLOCK * (blocks - 1) + 1
        } else {
            255
        };
        out.extend_from_slice(format!(" {} \r", last_sector_length).as_bytes());
    }

    // the files, each starting on a block boundary
    for ae in &archive.entries {
        let blocks = rounddiv(ae.data.len(), BLOCK);

        // reserve space for the side sectors
        if ae.name.filetype == Filetype::Rel {
            block_counter += (blocks + 119) / 121;
        }

        out.resize(block_counter * BLOCK, 0);
        out.extend_from_slice(&ae.data);

        block_counter += blocks;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{archive_lynx, read_lynx, skip_basic_header, BASIC_HEADER, BLOCK};
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
    fn basic_header_is_found() {
        assert_eq!(skip_basic_header(&BASIC_HEADER), BASIC_HEADER.len());
        assert_eq!(skip_basic_header(b"no loader here"), 0);
    }

    #[test]
    fn pack_and_unpack_preserves_files() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();

        let a = Filename::new(b"A", Filetype::Prg, 0);
        let b = Filename::new(b"B", Filetype::Seq, 0);
        let c = Filename::new(b"C", Filetype::Rel, 4);

        let a_data: Vec<u8> = (0..10u8).collect();
        let b_data: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
        let c_data: Vec<u8> = (0..1024u32).map(|i| (i % 17) as u8).collect();

        archive.write_file(&a, &a_data, &mut diag).unwrap();
        archive.write_file(&b, &b_data, &mut diag).unwrap();
        archive.write_file(&c, &c_data, &mut diag).unwrap();

        let image = archive_lynx(&archive).expect("archive failed");

        let mut sink = Collector { files: Vec::new() };
        read_lynx(&image, &mut sink, &mut diag).expect("extract failed");

        assert_eq!(sink.files.len(), 3);
        assert_eq!(sink.files[0].0, a);
        assert_eq!(sink.files[0].1, a_data);
        assert_eq!(sink.files[1].0, b);
        assert_eq!(sink.files[1].1, b_data);
        assert_eq!(sink.files[2].0, c);
        assert_eq!(sink.files[2].0.record_length, 4);
        assert_eq!(sink.files[2].1, c_data);
    }

    #[test]
    fn payloads_start_on_block_boundaries() {
        let mut archive = Archive::new();
        let mut diag = Diagnostics::new();

        let payloads: [&[u8]; 2] = [b"first payload", b"second"];
        for (i, payload) in payloads.iter().enumerate() {
            let name = Filename::new(&[b'A' + i as u8], Filetype::Prg, 0);
            archive.write_file(&name, payload, &mut diag).unwrap();
        }

        let image = archive_lynx(&archive).expect("archive failed");

        for payload in payloads {
            let offset = image
                .windows(payload.len())
                .position(|w| w == payload)
                .expect("payload not found");
            assert_eq!(offset % BLOCK, 0);
        }
    }

    #[test]
    fn rejects_foreign_data() {
        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        assert!(read_lynx(b" 1  NOT THE RIGHT SIGNATURE\r 1 \r", &mut sink, &mut diag).is_err());
    }
}
