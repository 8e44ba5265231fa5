//! Lempel-Zev decompression for crunched ARC entries
//!
//! Codes start at 9 bits and grow to 12; there is no table reset.
//! Code 256 marks the end of the entry and code 257 is reserved.
//! Decoded strings are recovered back-to-front through a bounded
//! stack; overflowing or underflowing that stack aborts the whole
//! decode.

use crate::container::bitstream::BitReader;

/// Number of string table entries (12-bit codes)
const TABLE_SIZE: usize = 4096;

/// End-of-entry code
const END_CODE: u16 = 256;

/// Capacity of the byte-reversing stack
const STACK_SIZE: usize = 512;

/// Stack handling failures.  These abort the entire archive decode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackError {
    /// The decoded string outgrew the stack
    Overflow,
    /// A byte was popped from an empty stack
    Underflow,
}

/// One step of decompression
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Output {
    /// A decompressed byte
    Byte(u8),
    /// The end-of-entry code was read
    End,
}

enum State {
    /// Nothing read yet for this entry
    Init,
    /// Ready to fetch the next code
    Fetch,
    /// Emitting the bytes of a decomposed string
    Drain,
}

/// Decompressor state for one crunched entry
pub struct Lzw {
    /// String table: prefix code and extension byte per code
    table: Vec<(u16, u8)>,
    /// Byte-reversing stack
    stack: Vec<u8>,
    state: State,
    /// Number of codes currently defined
    ncodes: u16,
    /// Previous code
    oldcode: u16,
    /// Code just read
    incode: u16,
    /// First byte of the previously emitted string
    finchar: u8,
    /// Last byte emitted from the current string
    kay: u8,
    /// Current code size in bits
    cdlen: u8,
    /// Grow the code size when this many codes have been read
    wtcl: u32,
    /// Countdown copy of `wtcl`
    wttcl: u32,
}

impl Lzw {
    /// A decompressor ready for a new entry
    pub fn new() -> Lzw {
        Lzw {
            table: vec![(0, 0); TABLE_SIZE],
            stack: Vec::with_capacity(STACK_SIZE),
            state: State::Init,
            ncodes: 258,
            oldcode: 0,
            incode: 0,
            finchar: 0,
            kay: 0,
            cdlen: 9,
            wtcl: 256,
            wttcl: 254,
        }
    }

    /// Read the next code, most significant bit first, and grow the
    /// code size when the current width is used up.
    fn get_code(&mut self, bits: &mut BitReader) -> u16 {
        let mut code = 0u16;
        for _ in 0..self.cdlen {
            code = (code << 1) | u16::from(bits.bit());
        }

        if self.cdlen < 12 {
            self.wttcl -= 1;
            if self.wttcl == 0 {
                self.wtcl <<= 1;
                self.cdlen += 1;
                self.wttcl = self.wtcl;
            }
        }

        code
    }

    fn push(&mut self, c: u8) -> Result<(), StackError> {
        if self.stack.len() >= STACK_SIZE {
            return Err(StackError::Overflow);
        }
        self.stack.push(c);
        Ok(())
    }

    /// Decompress one byte, or report the end of the entry
    pub fn next(&mut self, bits: &mut BitReader) -> Result<Output, StackError> {
        loop {
            match self.state {
                State::Init => {
                    self.stack.clear();
                    self.ncodes = 258;
                    self.wtcl = 256;
                    // two reserved codes eat into the first window
                    self.wttcl = 254;
                    self.cdlen = 9;

                    self.oldcode = self.get_code(bits);
                    if self.oldcode == END_CODE {
                        // a zero length file
                        return Ok(Output::End);
                    }

                    self.kay = (self.oldcode & 0xFF) as u8;
                    self.finchar = self.kay;
                    self.state = State::Fetch;
                    return Ok(Output::Byte(self.kay));
                }

                State::Fetch => {
                    self.incode = self.get_code(bits);

                    if self.incode == END_CODE {
                        self.state = State::Init;
                        return Ok(Output::End);
                    }

                    let mut code = self.incode;

                    if self.incode >= self.ncodes {
                        // code not yet defined: the string is the
                        // previous string extended with its own first
                        // byte
                        self.kay = self.finchar;
                        let k = self.kay;
                        self.push(k)?;
                        code = self.oldcode;
                        self.incode = self.ncodes;
                    }

                    while code > 255 {
                        let (prefix, ext) = self.table[code as usize];
                        self.push(ext)?;
                        code = prefix;
                    }

                    self.kay = code as u8;
                    self.finchar = self.kay;
                    self.state = State::Drain;
                    return Ok(Output::Byte(self.kay));
                }

                State::Drain => {
                    match self.stack.pop() {
                        Some(c) => return Ok(Output::Byte(c)),
                        None => {
                            if (self.ncodes as usize) < TABLE_SIZE {
                                self.table[self.ncodes as usize] = (self.oldcode, self.kay);
                                self.ncodes += 1;
                            }
                            self.oldcode = self.incode;
                            self.state = State::Fetch;
                            // fall through to fetch the next code
                        }
                    }
                }
            }
        }
    }
}

impl Default for Lzw {
    fn default() -> Self {
        Lzw::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Lzw, Output, StackError};
    use crate::container::bitstream::BitReader;

    /// Pack 9-bit codes least-significant-bit-first into bytes, the
    /// way the bit reader consumes them.  Codes themselves are sent
    /// most significant bit first.
    fn pack_codes(codes: &[u16]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut fill = 0u8;
        for code in codes {
            for i in (0..9).rev() {
                if fill == 0 {
                    out.push(0);
                }
                if (code >> i) & 1 != 0 {
                    let last = out.last_mut().unwrap();
                    *last |= 1 << fill;
                }
                fill = (fill + 1) % 8;
            }
        }
        out
    }

    fn decode_all(data: &[u8]) -> Result<Vec<u8>, StackError> {
        let mut bits = BitReader::new(data, 0);
        let mut lzw = Lzw::new();
        let mut out = Vec::new();
        loop {
            match lzw.next(&mut bits)? {
                Output::Byte(c) => out.push(c),
                Output::End => return Ok(out),
            }
        }
    }

    #[test]
    fn literal_codes_decode_to_bytes() {
        let data = pack_codes(&[b'a' as u16, b'b' as u16, b'c' as u16, 256]);
        assert_eq!(decode_all(&data).unwrap(), b"abc");
    }

    #[test]
    fn table_strings_expand() {
        // "ab" defines code 258 = (a,b); reusing it yields "abab"
        let data = pack_codes(&[b'a' as u16, b'b' as u16, 258, 256]);
        assert_eq!(decode_all(&data).unwrap(), b"abab");
    }

    #[test]
    fn undefined_code_special_case() {
        // "aa" then code 259 (= next slot): classic KwKwK case,
        // expands to the previous string plus its first byte
        let data = pack_codes(&[b'a' as u16, b'a' as u16, 259, 256]);
        assert_eq!(decode_all(&data).unwrap(), b"aaaa");
    }

    #[test]
    fn empty_entry() {
        let data = pack_codes(&[256]);
        assert_eq!(decode_all(&data).unwrap(), b"");
    }
}
