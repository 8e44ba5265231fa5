//! ARC/SDA (C64/C128) archive decoder
//!
//! An ARC archive is a sequence of entries, each with a small header
//! followed by the entry data in one of six storage modes: stored,
//! packed (run-length), squeezed (Huffman), squeezed+packed, crunched
//! (LZW over run-length) or crunched in one pass.  A self-dissolving
//! archive (SDA) prefixes the same data with a BASIC loader whose line
//! number gives the size of the loader in disk blocks.
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod huffman;
pub mod lzw;

use log::debug;

use crate::container::bitstream::BitReader;
use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::petscii::{Filename, Filetype};

use huffman::Huffman;
use lzw::{Lzw, Output, StackError};

/// Size of one Commodore disk block as used for archive accounting
const BLOCK: usize = 254;

/// A C64 archive entry header
struct Entry {
    /// Version number, must be 1 or 2
    version: u8,
    /// 0=store, 1=pack, 2=squeeze, 3=crunch, 4=squeeze+pack,
    /// 5=crunch in one pass
    mode: u8,
    /// Checksum over the decompressed data
    check: u16,
    /// Original size; three bytes are stored
    size: u32,
    /// Compressed size in disk blocks
    blocks: u16,
    /// File type letter: P, S, U or R
    type_letter: u8,
    /// File name length
    fnlen: u8,
    /// File name, `fnlen` bytes used
    name: [u8; 16],
    /// Record length for relative files (version 2 headers)
    record_length: u8,
}

/// Per-entry decoder state: the mode-specific decompressors plus the
/// running checksum
struct EntryDecoder {
    entry: Entry,
    /// Byte offset of the entry's first header byte
    start: usize,
    /// Run-length control character; version 1 archives choose their
    /// own, version 2 always uses 0xFE
    ctrl: u8,
    huffman: Option<Huffman>,
    lzw: Lzw,
    /// Running checksum
    crc: u16,
    /// Byte counter folded into version 2 checksums
    crc2: u8,
    /// Entry data exhausted
    done: bool,
}

/// Parse an entry header at the reader's position.
///
/// Any malformed header ends the archive: trailing padding from
/// XMODEM transfers routinely follows the last entry.
fn read_header(bits: &mut BitReader) -> Option<EntryDecoder> {
    if bits.eof() {
        return None;
    }

    let start = bits.position();

    let mut entry = Entry {
        version: bits.byte(),
        mode: bits.byte(),
        check: bits.word(),
        size: bits.tbyte(),
        blocks: bits.word(),
        type_letter: bits.byte(),
        fnlen: bits.byte(),
        name: [0; 16],
        record_length: 0,
    };

    if entry.fnlen > 16 {
        return None;
    }

    for i in 0..entry.fnlen as usize {
        entry.name[i] = bits.byte();
    }

    if entry.version > 1 {
        entry.record_length = bits.byte();
        let _date = bits.word();
    }

    if bits.eof() {
        return None;
    }

    if entry.version == 0 || entry.version > 2 {
        return None;
    }

    if entry.version == 1 && entry.mode > 2 {
        return None;
    }

    // version 1 packed entries choose their own control character
    let ctrl = if entry.mode == 1 { bits.byte() } else { 0xFE };

    if entry.mode > 5 {
        return None;
    }

    let huffman = if entry.mode == 2 || entry.mode == 4 {
        match Huffman::build(bits) {
            Ok(table) => Some(table),
            Err(_) => return None,
        }
    } else {
        None
    };

    if !b"SPUR".contains(&entry.type_letter) {
        return None;
    }

    debug!(
        "archive entry version {} mode {} size {} blocks {}",
        entry.version, entry.mode, entry.size, entry.blocks
    );

    Some(EntryDecoder {
        entry,
        start,
        ctrl,
        huffman,
        lzw: Lzw::new(),
        crc: 0,
        crc2: 0,
        done: false,
    })
}

impl EntryDecoder {
    /// Decompress one byte according to the entry mode
    fn unpack(&mut self, bits: &mut BitReader) -> Result<u8, StackError> {
        match self.entry.mode {
            // stored, or packed (the run-length pass is applied by
            // the caller)
            0 | 1 => Ok(bits.byte()),

            // squeezed, possibly over run-length
            2 | 4 => match self.huffman.as_ref().and_then(|h| h.decode(bits)) {
                Some(c) => Ok(c),
                None => {
                    self.done = true;
                    Ok(0)
                }
            },

            // crunched, possibly in one pass
            3 | 5 => match self.lzw.next(bits)? {
                Output::Byte(c) => Ok(c),
                Output::End => {
                    self.done = true;
                    if self.entry.mode == 5 {
                        self.read_trailer(bits);
                    }
                    Ok(0)
                }
            },

            _ => {
                self.done = true;
                Ok(0)
            }
        }
    }

    /// One-pass crunched entries keep the checksum and original size
    /// after the end-of-stream code; the block count is recomputed
    /// from the stream position.
    fn read_trailer(&mut self, bits: &mut BitReader) {
        let mut check = 0u16;
        for _ in 0..16 {
            check = (check << 1) | u16::from(bits.bit());
        }
        self.entry.check = check;

        let mut size = 0u32;
        for _ in 0..24 {
            size = (size << 1) | u32::from(bits.bit());
        }
        self.entry.size = size;

        // sixteen reserved bits, never used
        for _ in 0..16 {
            bits.bit();
        }

        let consumed = bits.position() - self.start;
        self.entry.blocks = crate::rounddiv(consumed, BLOCK) as u16;
    }

    fn at_end(&self, bits: &BitReader) -> bool {
        self.done || bits.eof()
    }

    fn update_checksum(&mut self, c: u8) {
        if self.entry.version == 1 {
            self.crc = self.crc.wrapping_add(u16::from(c));
        } else {
            self.crc2 = self.crc2.wrapping_add(1);
            self.crc = self.crc.wrapping_add(u16::from(c ^ self.crc2));
        }
    }

    /// Decompress the whole entry
    fn decode(&mut self, bits: &mut BitReader) -> Result<Vec<u8>, StackError> {
        let length = if self.entry.mode == 5 {
            // size is unknown until the trailer has been read
            65536
        } else {
            self.entry.size as usize
        };

        let mut buffer = Vec::with_capacity(length.min(65536));

        while buffer.len() < length {
            let mut c = self.unpack(bits)?;
            if self.at_end(bits) {
                break;
            }

            // expand a run unless the mode has no run-length layer
            if self.entry.mode != 0 && self.entry.mode != 2 && c == self.ctrl {
                let count = self.unpack(bits)?;
                c = self.unpack(bits)?;
                if self.at_end(bits) {
                    break;
                }

                let count: usize = if count == 0 {
                    if self.entry.version == 1 {
                        255
                    } else {
                        256
                    }
                } else {
                    count as usize
                };

                for _ in 1..count {
                    self.update_checksum(c);
                    buffer.push(c);
                }
            }

            self.update_checksum(c);
            buffer.push(c);
        }

        Ok(buffer)
    }

    /// The entry's Commodore file name
    fn filename(&self, diag: &mut Diagnostics) -> Filename {
        let name = &self.entry.name[..self.entry.fnlen as usize];

        match self.entry.type_letter {
            b'S' => Filename::new(name, Filetype::Seq, 0),
            b'P' => Filename::new(name, Filetype::Prg, 0),
            b'U' => Filename::new(name, Filetype::Usr, 0),
            b'R' => Filename::new(name, Filetype::Rel, self.entry.record_length),
            _ => {
                let fallback = Filename::new(name, Filetype::Del, 0);
                diag.error(Some(&fallback), "Unknown type, defaulting to DEL");
                fallback
            }
        }
    }
}

/// Find the start of the archived data.
///
/// A plain archive begins with the version byte 2.  A self-dissolving
/// archive is a program load starting with 1; its BASIC `SYS` line
/// number counts the loader's disk blocks, except that the C128
/// loader (line 15, CPU tag `7`) is one byte short of a full block.
fn start_of_data(bits: &mut BitReader) -> Option<usize> {
    bits.seek(0);

    let c = bits.byte();
    if c == 2 {
        return Some(0);
    }
    if c != 1 {
        return None;
    }

    bits.byte(); // high byte of the load address
    bits.word(); // BASIC line link
    let linenum = bits.word();

    if bits.byte() != 0x9E {
        // no SYS token: a version 1 archive
        return Some(0);
    }

    bits.byte(); // first digit of the SYS address
    let cpu = bits.byte();

    let mut skip = (i64::from(linenum) - 6) * BLOCK as i64;
    if linenum == 15 && cpu == b'7' {
        skip -= 1;
    }

    usize::try_from(skip).ok()
}

/// Read and convert an ARC/SDA archive
///
/// # Arguments
///
/// - `data` - the archive file contents
/// - `sink` - destination for the contained files
/// - `diag` - diagnostic output
pub fn read_arc(data: &[u8], sink: &mut dyn FileSink, diag: &mut Diagnostics) -> Result<(), Error> {
    let mut bits = BitReader::new(data, 0);

    let start = match start_of_data(&mut bits) {
        Some(start) => start,
        None => {
            diag.error(None, "Not a Commodore ARC or SDA.");
            return Err(invalid("not a Commodore ARC or SDA"));
        }
    };

    let mut file_pos = start;

    loop {
        bits.seek(file_pos);

        let mut decoder = match read_header(&mut bits) {
            Some(decoder) => decoder,
            None => break,
        };

        let buffer = decoder.decode(&mut bits).map_err(|e| {
            let message = match e {
                StackError::Underflow => "Lempel Zev stack underflow",
                StackError::Overflow => "Lempel Zev stack overflow",
            };
            diag.error(None, message);
            invalid(message)
        })?;

        let name = decoder.filename(diag);

        if decoder.crc != decoder.entry.check {
            diag.error(Some(&name), "Checksum error!");
        }

        sink.write_file(&name, &buffer, diag)?;

        file_pos += decoder.entry.blocks as usize * BLOCK;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_arc, start_of_data, BLOCK};
    use crate::container::bitstream::BitReader;
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

    /// Build a version 2, mode 0 (stored) entry
    fn stored_entry(name: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(2); // version
        out.push(0); // mode: stored
        let mut crc2 = 0u8;
        let mut check = 0u16;
        for c in data {
            crc2 = crc2.wrapping_add(1);
            check = check.wrapping_add(u16::from(c ^ crc2));
        }
        out.extend_from_slice(&check.to_le_bytes());
        let size = data.len() as u32;
        out.push(size as u8);
        out.push((size >> 8) as u8);
        out.push((size >> 16) as u8);
        let header_len = 11 + name.len() + 3;
        let blocks = crate::rounddiv(header_len + data.len(), BLOCK) as u16;
        out.extend_from_slice(&blocks.to_le_bytes());
        out.push(b'P');
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.push(0); // record length
        out.extend_from_slice(&[0, 0]); // date
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn start_of_data_plain_archive() {
        let data = [2u8, 0, 0, 0];
        let mut bits = BitReader::new(&data, 0);
        assert_eq!(start_of_data(&mut bits), Some(0));
    }

    #[test]
    fn start_of_data_rejects_foreign_files() {
        let data = [0x50u8, 0x4B, 3, 4];
        let mut bits = BitReader::new(&data, 0);
        assert_eq!(start_of_data(&mut bits), None);
    }

    #[test]
    fn start_of_data_sda_loader() {
        // load address 0x0801, line link, line 10, SYS token, "2061", '2'
        let mut data = vec![1u8, 8, 0x0b, 8, 10, 0, 0x9E, b'2', b'2'];
        data.resize(2048, 0);
        let mut bits = BitReader::new(&data, 0);
        assert_eq!(start_of_data(&mut bits), Some(4 * BLOCK));
    }

    #[test]
    fn sda_c128_loader_is_one_byte_short() {
        let mut data = vec![1u8, 8, 0x0b, 8, 15, 0, 0x9E, b'7', b'7'];
        data.resize(4096, 0);
        let mut bits = BitReader::new(&data, 0);
        assert_eq!(start_of_data(&mut bits), Some(9 * BLOCK - 1));
    }

    #[test]
    fn stored_entries_round_trip() {
        let mut archive = stored_entry(b"FIRST", b"hello commodore");
        // pad to the declared block boundary, then a second entry
        archive.resize(BLOCK, 0x1A);
        archive.extend_from_slice(&stored_entry(b"SECOND", &[0xA5; 300]));

        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        read_arc(&archive, &mut sink, &mut diag).expect("decode failed");

        assert_eq!(sink.files.len(), 2);
        assert_eq!(sink.files[0].0, Filename::new(b"FIRST", Filetype::Prg, 0));
        assert_eq!(sink.files[0].1, b"hello commodore");
        assert_eq!(sink.files[1].0, Filename::new(b"SECOND", Filetype::Prg, 0));
        assert_eq!(sink.files[1].1, vec![0xA5; 300]);
    }

    /// Append `count` bits of `value`, most significant first, in the
    /// order the bit reader consumes them
    fn push_bits(out: &mut Vec<u8>, fill: &mut u8, value: u32, count: u8) {
        for i in (0..count).rev() {
            if *fill == 0 {
                out.push(0);
            }
            if (value >> i) & 1 != 0 {
                let last = out.last_mut().unwrap();
                *last |= 1 << *fill;
            }
            *fill = (*fill + 1) % 8;
        }
    }

    #[test]
    fn one_pass_crunch_reads_trailing_checksum_and_size() {
        // version 2, mode 5: the checksum and size follow the
        // end-of-stream code
        let mut out = Vec::new();
        out.push(2); // version
        out.push(5); // mode: crunch in one pass
        out.extend_from_slice(&[0, 0]); // checksum lives in the trailer
        out.extend_from_slice(&[0, 0, 0]); // so does the size
        out.extend_from_slice(&[0, 0]); // blocks are recomputed
        out.push(b'P');
        out.push(4);
        out.extend_from_slice(b"TEST");
        out.push(0); // record length
        out.extend_from_slice(&[0, 0]); // date

        // "HI" as 9-bit literal codes, then the end code
        let mut fill = 0u8;
        for code in [u32::from(b'H'), u32::from(b'I'), 256] {
            push_bits(&mut out, &mut fill, code, 9);
        }
        // trailer: 16-bit checksum, 24-bit size, 16 unused bits
        let check = u16::from(b'H' ^ 1) + u16::from(b'I' ^ 2);
        push_bits(&mut out, &mut fill, u32::from(check), 16);
        push_bits(&mut out, &mut fill, 2, 24);
        push_bits(&mut out, &mut fill, 0, 16);

        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        read_arc(&out, &mut sink, &mut diag).expect("decode failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, Filename::new(b"TEST", Filetype::Prg, 0));
        assert_eq!(sink.files[0].1, b"HI");
    }

    #[test]
    fn packed_runs_expand() {
        // version 2, mode 1 (packed), control character read from
        // the header
        let payload: Vec<u8> = vec![0xEE; 40];
        let mut check = 0u16;
        let mut crc2 = 0u8;
        for c in &payload {
            crc2 = crc2.wrapping_add(1);
            check = check.wrapping_add(u16::from(c ^ crc2));
        }

        let mut out = Vec::new();
        out.push(2); // version
        out.push(1); // mode: packed
        out.extend_from_slice(&check.to_le_bytes());
        out.extend_from_slice(&[40, 0, 0]); // size
        out.extend_from_slice(&1u16.to_le_bytes()); // blocks
        out.push(b'S');
        out.push(1);
        out.push(b'R');
        out.push(0); // record length
        out.extend_from_slice(&[0, 0]); // date
        out.push(0xFE); // control character
        out.extend_from_slice(&[0xFE, 40, 0xEE]); // a 40-byte run

        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        read_arc(&out, &mut sink, &mut diag).expect("decode failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0.filetype, Filetype::Seq);
        assert_eq!(sink.files[0].1, payload);
    }
}
