//! Host file system input and output
//!
//! Files read from the host get their Commodore name and type from
//! the host file name (`picture,p`, `notes.seq`, `data.l80`) or from
//! a PC64 container header.  Files written to the host get a
//! converted name with a type suffix; the PC64 and ISO 9660 policies
//! additionally truncate the base name to eight characters.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::path::Path;

use nom::bytes::complete::{tag, take};
use nom::number::complete::le_u8;
use nom::IResult;

use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::file::write_file;
use crate::petscii::{ascii_to_petscii, Filename, Filetype};

/// Host file naming policies
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostFormat {
    /// converted name plus type suffix, `~n` on collision
    Native,
    /// PC64 container files (.P00, .S00 etc.)
    Pc64,
    /// ISO 9660 compliant names, `.nnn` on collision
    Iso9660,
}

/// The character of the file base name that ends it: either of the
/// path separators in use on the supported hosts.
fn is_path_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// The base name of a host path
fn basename(path: &str) -> &str {
    match path.rfind(is_path_separator) {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Convert a PETSCII file name to host file name characters.
/// Slashes become periods so the name cannot escape into another
/// directory.
fn filename_to_host(name: &Filename) -> Vec<u8> {
    let stem = name.stem();
    let stem = if stem.is_empty() {
        &name.name[..1]
    } else {
        stem
    };

    stem.iter()
        .map(|c| match *c {
            b'/' => b'.',
            0x41..=0x5A => c - 0x41 + b'a',
            0xC1..=0xDA => c - 0xC1 + b'A',
            c if (c & 127) < 32 => b'-',
            c if c > 0xDA => b'+',
            c => c,
        })
        .collect()
}

/// The host name suffix for a Commodore file type
fn file_suffix(name: &Filename) -> String {
    match name.filetype {
        Filetype::Del => String::from(".del"),
        Filetype::Seq => String::from(".seq"),
        Filetype::Prg => String::from(".prg"),
        Filetype::Usr => String::from(".usr"),
        Filetype::Rel => format!(".l{:02X}", name.record_length),
        Filetype::Cbm => String::from(".cbm"),
    }
}

/// Marker for a character removed during ISO 9660 truncation
const REMOVED: u8 = 0;

fn is_vowel(c: u8) -> bool {
    matches!(c, b'a' | b'e' | b'i' | b'o' | b'u')
}

/// Truncate a converted file name to an ISO 9660 compliant 8
/// character base.
///
/// Characters are dropped from the end in rounds of increasing
/// severity: underscores first, then vowels, then letters, then
/// anything; the leading character always survives.
fn truncate_name(name: &[u8]) -> Vec<u8> {
    let mut name: Vec<u8> = name
        .iter()
        .map(|c| match *c {
            b'a'..=b'z' | b'0'..=b'9' => *c,
            b'A'..=b'Z' => *c - b'A' + b'a',
            0xC1..=0xDA => *c - 0xC1 + b'a',
            _ => b'_',
        })
        .collect();

    let mut efflen = name.len();

    if efflen > 8 {
        // remove underscores from the end
        for i in (1..name.len()).rev() {
            if name[i] == b'_' {
                name[i] = REMOVED;
                efflen -= 1;
                if efflen <= 8 {
                    break;
                }
            }
        }
    }

    if efflen > 8 {
        // remove vowels from the end, sparing the leading run
        if let Some(first) = name.iter().position(|c| !is_vowel(*c)) {
            for i in ((first + 1)..name.len()).rev() {
                if is_vowel(name[i]) {
                    name[i] = REMOVED;
                    efflen -= 1;
                    if efflen <= 8 {
                        break;
                    }
                }
            }
        }
    }

    if efflen > 8 {
        // remove letters from the end
        for i in (1..name.len()).rev() {
            if name[i].is_ascii_lowercase() {
                name[i] = REMOVED;
                efflen -= 1;
                if efflen <= 8 {
                    break;
                }
            }
        }
    }

    if efflen > 8 {
        // remove anything from the end
        for i in (1..name.len()).rev() {
            if name[i] != REMOVED {
                name[i] = REMOVED;
                efflen -= 1;
                if efflen <= 8 {
                    break;
                }
            }
        }
    }

    name.retain(|c| *c != REMOVED);

    if name.is_empty() {
        name.push(b'_');
    }

    name
}

fn to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|c| char::from(*c)).collect()
}

/// A write sink that stores each file as a host file
pub struct HostSink {
    /// The naming policy
    pub format: HostFormat,
}

impl HostSink {
    fn write_native(
        &self,
        name: &Filename,
        data: &[u8],
        diag: &mut Diagnostics,
    ) -> Result<String, Error> {
        let base = to_string(&filename_to_host(name));
        let suffix = file_suffix(name);

        // try the plain file name first
        let plain = format!("{}{}", base, suffix);
        if !Path::new(&plain).exists() {
            write_file(&plain, data)?;
            return Ok(plain);
        }

        for i in 0..10000 {
            let candidate = format!("{}~{}{}", base, i, suffix);
            if !Path::new(&candidate).exists() {
                write_file(&candidate, data)?;
                return Ok(candidate);
            }
        }

        diag.error(Some(name), "out of file name space");
        Err(invalid("out of file name space"))
    }

    fn write_pc64(
        &self,
        name: &Filename,
        data: &[u8],
        diag: &mut Diagnostics,
    ) -> Result<String, Error> {
        let base = to_string(&truncate_name(&filename_to_host(name)));
        let mut suffix = file_suffix(name);
        if name.filetype == Filetype::Rel {
            // relative containers use .rXX
            suffix.replace_range(1..2, "r");
        }

        for i in 0..100 {
            let candidate = format!("{}{}{:02}", base, &suffix[..2], i);
            if !Path::new(&candidate).exists() {
                let mut contents = Vec::with_capacity(26 + data.len());
                contents.extend_from_slice(b"C64File\0");
                contents.extend_from_slice(&name.name);
                contents.push(0);
                contents.push(name.record_length);
                contents.extend_from_slice(data);

                write_file(&candidate, &contents)?;
                return Ok(candidate);
            }
        }

        diag.error(Some(name), "out of file name space");
        Err(invalid("out of file name space"))
    }

    fn write_9660(
        &self,
        name: &Filename,
        data: &[u8],
        diag: &mut Diagnostics,
    ) -> Result<String, Error> {
        let base = to_string(&truncate_name(&filename_to_host(name)));
        let suffix = file_suffix(name);

        // try the basic file name
        let plain = format!("{}{}", base, suffix);
        if !Path::new(&plain).exists() {
            write_file(&plain, data)?;
            return Ok(plain);
        }

        // then with .000-style file names
        for i in 0..1000 {
            let candidate = format!("{}.{:03}", base, i);
            if !Path::new(&candidate).exists() {
                write_file(&candidate, data)?;
                return Ok(candidate);
            }
        }

        diag.error(Some(name), "out of file name space");
        Err(invalid("out of file name space"))
    }
}

impl FileSink for HostSink {
    fn write_file(
        &mut self,
        name: &Filename,
        data: &[u8],
        diag: &mut Diagnostics,
    ) -> Result<(), Error> {
        let written = match self.format {
            HostFormat::Native => self.write_native(name, data, diag),
            HostFormat::Pc64 => self.write_pc64(name, data, diag),
            HostFormat::Iso9660 => self.write_9660(name, data, diag),
        }?;

        diag.info(
            Some(name),
            &format!("Writing {} bytes to \"{}\"", data.len(), written),
        );
        Ok(())
    }
}

/// Determine a Commodore name and type from a host file name.
fn name_from_host(filename: &str, diag: &mut Diagnostics) -> Filename {
    let base = {
        let base = basename(filename);
        if base.is_empty() {
            diag.warning(None, "Null file name, changed to null.prg");
            "null.prg"
        } else {
            base
        }
    };

    let bytes = base.as_bytes();
    let n = bytes.len();

    // `,p` style two-character suffixes
    if n >= 3 && bytes[n - 2] == b',' {
        let filetype = match bytes[n - 1] {
            b'd' | b'D' => Some(Filetype::Del),
            b's' | b'S' => Some(Filetype::Seq),
            b'p' | b'P' => Some(Filetype::Prg),
            b'u' | b'U' => Some(Filetype::Usr),
            _ => None,
        };
        if let Some(filetype) = filetype {
            return host_to_filename(&bytes[..n - 2], filetype, 0);
        }
    }

    // `.prg` style four-character suffixes
    if n >= 5 && (bytes[n - 4] == b'.' || bytes[n - 4] == b',') {
        let suffix = &bytes[n - 3..];
        let stem = &bytes[..n - 4];

        match suffix {
            b"del" | b"DEL" => return host_to_filename(stem, Filetype::Del, 0),
            b"seq" | b"SEQ" => return host_to_filename(stem, Filetype::Seq, 0),
            // CVT for GEOS Convert files
            b"prg" | b"PRG" | b"cvt" | b"CVT" => return host_to_filename(stem, Filetype::Prg, 0),
            b"usr" => return host_to_filename(stem, Filetype::Usr, 0),
            b"rel" | b"REL" => {
                diag.warning(None, "unknown record length");
                return host_to_filename(stem, Filetype::Rel, 0);
            }
            _ => {
                if suffix[0] == b'l' {
                    if let Ok(record_length) =
                        u8::from_str_radix(std::str::from_utf8(&suffix[1..]).unwrap_or(""), 16)
                    {
                        return host_to_filename(stem, Filetype::Rel, record_length);
                    }
                }
            }
        }
    }

    diag.warning(None, "Unknown type, defaulting to PRG");
    host_to_filename(bytes, Filetype::Prg, 0)
}

fn host_to_filename(stem: &[u8], filetype: Filetype, record_length: u8) -> Filename {
    let converted: Vec<u8> = stem.iter().map(|c| ascii_to_petscii(*c)).collect();
    Filename::new(&converted, filetype, record_length)
}

/// Read a file in the native format of the host system
///
/// # Arguments
///
/// - `data` - the file contents
/// - `filename` - host system name of the file
/// - `sink` - destination for the file
/// - `diag` - diagnostic output
pub fn read_native(
    data: &[u8],
    filename: &str,
    sink: &mut dyn FileSink,
    diag: &mut Diagnostics,
) -> Result<(), Error> {
    let name = name_from_host(filename, diag);
    sink.write_file(&name, data, diag)
}

/// Parse a PC64 container: the magic, the name, and the record length
fn pc64_header_parser(i: &[u8]) -> IResult<&[u8], ([u8; 16], u8)> {
    let (i, _magic) = tag(b"C64File\0".as_slice())(i)?;
    let (i, name) = take(16_usize)(i)?;
    let (i, _zero) = le_u8(i)?;
    let (i, record_length) = le_u8(i)?;

    let mut name_buf = [0u8; 16];
    name_buf.copy_from_slice(name);

    Ok((i, (name_buf, record_length)))
}

/// Read a PC64 file (.P00, .S00 etc.)
///
/// # Arguments
///
/// - `data` - the file contents
/// - `filename` - host system name of the file
/// - `sink` - destination for the contained file
/// - `diag` - diagnostic output
pub fn read_pc64(
    data: &[u8],
    filename: &str,
    sink: &mut dyn FileSink,
    diag: &mut Diagnostics,
) -> Result<(), Error> {
    // determine the file type from the suffix
    let bytes = filename.as_bytes();
    if bytes.len() < 5 {
        diag.error(None, "No PC64 file name suffix");
        return Err(invalid("no PC64 file name suffix"));
    }

    let suffix = &bytes[bytes.len() - 4..];
    let filetype = if suffix[0] != b'.' || !suffix[2].is_ascii_digit() || !suffix[3].is_ascii_digit()
    {
        None
    } else {
        match suffix[1].to_ascii_lowercase() {
            b'd' => Some(Filetype::Del),
            b's' => Some(Filetype::Seq),
            b'p' => Some(Filetype::Prg),
            b'u' => Some(Filetype::Usr),
            b'r' => Some(Filetype::Rel),
            _ => None,
        }
    };

    let filetype = match filetype {
        Some(filetype) => filetype,
        None => {
            diag.error(None, "Unknown PC64 file type suffix");
            return Err(invalid("unknown PC64 file type suffix"));
        }
    };

    if data.len() < 26 {
        diag.error(None, "short file");
        return Err(invalid("short PC64 file"));
    }

    let (payload, (name_buf, record_length)) = match pc64_header_parser(data) {
        Ok(parsed) => parsed,
        Err(_) => {
            diag.error(None, "Invalid PC64 header");
            return Err(invalid("invalid PC64 header"));
        }
    };

    let name = Filename {
        name: name_buf,
        filetype,
        record_length,
    };

    sink.write_file(&name, payload, diag)
}

#[cfg(test)]
mod tests {
    use super::{basename, name_from_host, read_pc64, truncate_name};
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
    fn basenames_accept_both_separators() {
        assert_eq!(basename("/a/b/c.prg"), "c.prg");
        assert_eq!(basename("dir\\file.seq"), "file.seq");
        assert_eq!(basename("plain"), "plain");
    }

    #[test]
    fn types_from_host_names() {
        let mut diag = Diagnostics::new();

        let name = name_from_host("hello.prg", &mut diag);
        assert_eq!(name.filetype, Filetype::Prg);
        assert_eq!(name.printable(), "hello,prg");

        let name = name_from_host("data,s", &mut diag);
        assert_eq!(name.filetype, Filetype::Seq);

        let name = name_from_host("records.l50", &mut diag);
        assert_eq!(name.filetype, Filetype::Rel);
        assert_eq!(name.record_length, 0x50);

        let name = name_from_host("mystery", &mut diag);
        assert_eq!(name.filetype, Filetype::Prg);
        assert_eq!(name.printable(), "mystery,prg");

        // GEOS Convert files carry PRG payloads
        let name = name_from_host("geopaint.cvt", &mut diag);
        assert_eq!(name.filetype, Filetype::Prg);
    }

    #[test]
    fn truncation_ladder() {
        // underscores go first, then vowels from the end
        assert_eq!(truncate_name(b"some_long_name"), b"somlngnm".to_vec());
        // vowels spare the leading run
        assert_eq!(truncate_name(b"anexampletoolong").len(), 8);
        // short names pass through
        assert_eq!(truncate_name(b"short"), b"short".to_vec());
        // upper case is folded
        assert_eq!(truncate_name(b"UPPER"), b"upper".to_vec());
        assert_eq!(truncate_name(b""), b"_".to_vec());
    }

    #[test]
    fn pc64_files_parse() {
        let mut contents = Vec::new();
        contents.extend_from_slice(b"C64File\0");
        contents.extend_from_slice(b"NOTES\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0");
        contents.push(0);
        contents.push(0);
        contents.extend_from_slice(b"the payload");

        let mut sink = Collector { files: Vec::new() };
        let mut diag = Diagnostics::new();
        read_pc64(&contents, "notes.s00", &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, Filename::new(b"NOTES", Filetype::Seq, 0));
        assert_eq!(sink.files[0].1, b"the payload");

        let mut diag = Diagnostics::new();
        assert!(read_pc64(&contents, "notes.xyz", &mut sink, &mut diag).is_err());
        assert!(read_pc64(b"C64File\0", "notes.p00", &mut sink, &mut diag).is_err());
    }
}
