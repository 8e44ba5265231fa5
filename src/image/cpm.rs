//! The C128 CP/M filesystem over a disk image
//!
//! CP/M sees the disk through a translation table that maps logical
//! sectors to physical ones with a drive-specific skew.  Files are
//! made of allocation units of 8 (1541/1571) or 16 (1581) 128-byte
//! records, referenced from directory extents by 8- or 16-bit block
//! numbers.

use log::debug;

use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::petscii::{Filename, Filetype};
use crate::rounddiv;

use super::{DirEntMode, Image, ImageType};

/// A CP/M directory entry occupies 32 bytes
const ENTRY_SIZE: usize = 32;

/// Marker byte of an unused directory entry
const UNUSED: u8 = 0xE5;

/// A CP/M disk directory entry
#[derive(Clone, Copy)]
struct CpmDirEnt {
    /// user area 0-0xF, or 0xE5 for an unused entry
    area: u8,
    /// file base name (bits 0..6 of each byte)
    basename: [u8; 8],
    /// file suffix (bits 0..6 of each byte)
    suffix: [u8; 3],
    /// number of this directory extent
    extent: u8,
    /// number of 128-byte records in this extent (max 0x80)
    blocks: u8,
    /// file block pointers, 8- or 16-bit
    block: [u8; 16],
}

impl CpmDirEnt {
    fn parse(raw: &[u8]) -> CpmDirEnt {
        let mut basename = [0u8; 8];
        basename.copy_from_slice(&raw[1..9]);
        let mut suffix = [0u8; 3];
        suffix.copy_from_slice(&raw[9..12]);
        let mut block = [0u8; 16];
        block.copy_from_slice(&raw[16..32]);

        CpmDirEnt {
            area: raw[0],
            basename,
            suffix,
            extent: raw[12],
            blocks: raw[15],
            block,
        }
    }

    fn store(&self, raw: &mut [u8]) {
        raw.fill(0);
        raw[0] = self.area;
        raw[1..9].copy_from_slice(&self.basename);
        raw[9..12].copy_from_slice(&self.suffix);
        raw[12] = self.extent;
        raw[15] = self.blocks;
        raw[16..32].copy_from_slice(&self.block);
    }

    /// The allocation block number at index `i` of the pointer list
    fn block_pointer(&self, au: usize, i: usize) -> usize {
        if au == 8 {
            self.block[i] as usize
        } else {
            self.block[2 * i] as usize + ((self.block[2 * i + 1] as usize) << 8)
        }
    }

    fn set_block_pointer(&mut self, au: usize, i: usize, value: usize) {
        if au == 8 {
            self.block[i] = value as u8;
        } else {
            self.block[2 * i] = value as u8;
            self.block[2 * i + 1] = (value >> 8) as u8;
        }
    }

    /// True if the base name and suffix match another entry's
    fn same_name(&self, other: &CpmDirEnt) -> bool {
        self.basename == other.basename && self.suffix == other.suffix
    }

    /// True if the user area, base name and suffix all match
    fn same_file(&self, other: &CpmDirEnt) -> bool {
        self.area == other.area && self.same_name(other)
    }
}

/// The CP/M sector translation table: allocation unit size, number of
/// usable sectors, and the image byte offset of every logical sector.
struct TransTable {
    /// allocation unit size, in 128-byte records
    au: usize,
    /// byte offsets of the usable sectors, in logical order
    sectors: Vec<usize>,
}

/// Generate the CP/M translation table for an image
fn trans_table(image: &Image) -> Option<TransTable> {
    let geom = image.geometry();

    let mut track = 1usize;
    let mut sector = 10usize;
    let mut sector_count = 2usize;

    let (au, usable) = match image.image_type {
        ImageType::Im1541 => (8usize, 680usize),
        ImageType::Im1571 => (8, 1360),
        ImageType::Im1581 => {
            sector = 0;
            sector_count = 0;
            (16, 3180)
        }
    };

    let mut table = Vec::with_capacity(usable);
    let mut track_base = 0usize;

    for _ in 0..usable {
        table.push(track_base + (sector << 8));

        match image.image_type {
            ImageType::Im1541 => {
                sector = (sector + 5) % geom.sectors(track as u8) as usize;
                sector_count += 1;
                if sector_count == geom.sectors(track as u8) as usize {
                    track_base += (geom.sectors(track as u8) as usize) << 8;
                    track += 1;
                    if track == geom.dir_track as usize {
                        sector_count = 1;
                        sector = 5;
                    } else {
                        sector_count = 0;
                        sector = 0;
                    }
                }
            }
            ImageType::Im1571 => {
                sector = (sector + 5) % geom.sectors(track as u8) as usize;
                sector_count += 1;
                if sector_count == geom.sectors(track as u8) as usize {
                    track_base += (geom.sectors(track as u8) as usize) << 8;
                    track += 1;
                    if track == 36 {
                        sector_count = 2;
                        sector = 10;
                    } else if track % 36 == geom.dir_track as usize {
                        sector_count = 1;
                        sector = 5;
                    } else {
                        sector_count = 0;
                        sector = 0;
                    }
                }
            }
            ImageType::Im1581 => {
                sector = (sector + 1) % 40;
                sector_count += 1;
                if sector_count == 40 {
                    track_base += 40 << 8;
                    track += 1;
                    let start = if track == geom.dir_track as usize { 20 } else { 0 };
                    sector_count = start;
                    sector = start;
                }
            }
        }
    }

    Some(TransTable { au, sectors: table })
}

/// Convert a CP/M directory entry to a PETSCII file name
fn cpm_convert_name(dirent: &CpmDirEnt) -> Filename {
    let mut cpmname = Vec::with_capacity(13);

    for c in dirent.basename.iter() {
        cpmname.push(c & 0x7F);
    }
    while cpmname.last() == Some(&b' ') {
        cpmname.pop();
    }

    cpmname.push(b'.');
    for c in dirent.suffix.iter() {
        cpmname.push(c & 0x7F);
    }
    while cpmname.last() == Some(&b' ') {
        cpmname.pop();
    }
    if cpmname.last() == Some(&b'.') {
        cpmname.pop();
    }

    // convert the ASCII name to PETSCII
    let mut name = [0xA0u8; 16];
    for (i, c) in cpmname.iter().take(16).enumerate() {
        name[i] = if c.is_ascii_uppercase() {
            c - b'A' + 0xC1
        } else if c.is_ascii_lowercase() {
            c - b'a' + 0x41
        } else {
            *c
        };
    }

    Filename {
        name,
        filetype: Filetype::Prg,
        record_length: 0,
    }
}

/// Convert a PETSCII file name to CP/M basename and suffix fields
fn cpm_name_fields(name: &Filename) -> ([u8; 8], [u8; 3]) {
    let mut basename = [b' '; 8];
    let mut suffix = [b' '; 3];

    let convert = |c: u8| -> u8 {
        if (0x41..=0x5A).contains(&c) {
            // upper case only
            c - 0x41 + b'A'
        } else if (0xC1..=0xDA).contains(&c) {
            c - 0xC1 + b'A'
        } else if (c & 0x7F) < 32 || c == b' ' {
            b'-' // control characters and space
        } else if c < 127 {
            c
        } else {
            b'+' // graphics characters
        }
    };

    let mut i = 0usize;
    while i < 16 && i < 8 {
        let c = name.name[i];
        if c == b'.' || c == 0xA0 || c == 0 {
            break;
        }
        if i > 0 && c == b' ' {
            // stop at the first space
            break;
        }
        basename[i] = convert(c);
        i += 1;
    }

    if i < 16 && name.name[i] != b' ' {
        i += 1;
        let mut j = 0usize;
        while j < 3 && i < 16 {
            let c = name.name[i];
            if (c & 0x7F) == b' ' {
                break;
            }
            suffix[j] = convert(c);
            i += 1;
            j += 1;
        }
    }

    (basename, suffix)
}

/// Write a file into a CP/M disk image
///
/// # Arguments
///
/// - `name` - native (PETSCII) name of the file
/// - `data` - the contents of the file
/// - `image` - the disk image
/// - `diag` - diagnostic output
pub fn write_cpm_image(
    name: &Filename,
    data: &[u8],
    image: &mut Image,
    diag: &mut Diagnostics,
) -> Result<(), Error> {
    let trans = trans_table(image).ok_or_else(|| invalid("unknown CP/M disk image type"))?;
    let au = trans.au;
    let sectors = trans.sectors.len();
    let total_aus = 2 * sectors / au;

    let mut allocated = vec![false; total_aus];
    let mut blocks_free = 2 * (sectors / au - 1);

    // convert the file name
    let (basename, suffix) = cpm_name_fields(name);
    let cpmname = CpmDirEnt {
        area: 0,
        basename,
        suffix,
        extent: 0,
        blocks: 0,
        block: [0; 16],
    };

    // read the directory entries
    let mut dirent: Vec<[u8; ENTRY_SIZE]> = Vec::with_capacity(au * 8);
    for d in 0..au {
        let offset = trans.sectors[d];
        for slot in 0..8 {
            let mut raw = [0u8; ENTRY_SIZE];
            raw.copy_from_slice(
                &image.buf[offset + slot * ENTRY_SIZE..offset + (slot + 1) * ENTRY_SIZE],
            );
            dirent.push(raw);
        }
    }

    // traverse the directory, compacting live entries to the front
    // and collecting the allocation state
    let mut slot = 0usize;
    let mut found = false;

    let mut d = 0usize;
    while d < au * 8 {
        let entry = CpmDirEnt::parse(&dirent[d]);

        if entry.area == UNUSED || dirent[d][..12] == [0u8; 12] {
            d += 1;
            continue;
        }

        if entry.same_name(&cpmname) {
            if image.dirent_mode == DirEntMode::OnlyCreate {
                return Err(Error::file_exists());
            }

            // overwrite the file: drop its old extents
            found = true;
            d += 1;
            continue;
        }

        if d != slot {
            dirent.copy_within(d..au * 8, slot);
        }
        let d_now = slot;
        slot += 1;

        let entry = CpmDirEnt::parse(&dirent[d_now]);
        for i in 0..rounddiv(entry.blocks as usize, au) {
            let pointer = entry.block_pointer(au, i);
            if pointer < 2 || pointer >= total_aus {
                let fname = cpm_convert_name(&entry);
                diag.warning(
                    Some(&fname),
                    &format!(
                        "Illegal block address in block {} of extent 0x{:02x}",
                        i, entry.extent
                    ),
                );
            } else if allocated[pointer] {
                let fname = cpm_convert_name(&entry);
                diag.warning(
                    Some(&fname),
                    &format!("Sector 0x{:02x} allocated multiple times", pointer),
                );
            } else {
                allocated[pointer] = true;
                blocks_free = blocks_free.saturating_sub(1);
            }
        }

        d = d_now + 1;
    }

    // see if the file was found
    if !found && image.dirent_mode == DirEntMode::DontCreate {
        return Err(invalid("file not found in the CP/M directory"));
    }

    // clear the empty directory entries
    for raw in dirent.iter_mut().skip(slot) {
        raw.fill(UNUSED);
    }

    // ensure that enough free space is available
    if slot >= 8 * au
        || data.len() > (8 * au - slot) * au / 2 * 16 * 128
        || data.len() > blocks_free * au * 128
    {
        return Err(Error::no_space());
    }

    // write the file
    {
        let mut record = 0usize; // 128-byte records written
        let mut records_left = rounddiv(data.len(), 128);
        let mut free_block = 2usize;
        let mut de_slot = slot;

        while records_left > 0 {
            let mut de = cpmname;
            de.extent = (record / 128) as u8;
            de.blocks = records_left.min(128) as u8;
            records_left -= de.blocks as usize;

            for j in 0..de.blocks as usize {
                if j % au == 0 {
                    // get the next free allocation unit
                    while free_block < allocated.len() && allocated[free_block] {
                        free_block += 1;
                    }
                    if free_block >= allocated.len() {
                        return Err(Error::no_space());
                    }
                    allocated[free_block] = true;
                    de.set_block_pointer(au, j / au, free_block);

                    // pad it with EOF characters
                    for k in 0..au / 2 {
                        let offset = trans.sectors[(au / 2) * free_block + k];
                        image.buf[offset..offset + 256].fill(0x1A);
                    }
                }

                // copy the record
                let offset =
                    trans.sectors[(au / 2) * free_block + ((j / 2) % (au / 2))] + 128 * (j % 2);
                let start = 128 * record;
                let end = (start + 128).min(data.len());
                image.buf[offset..offset + (end - start)].copy_from_slice(&data[start..end]);

                record += 1;
            }

            de.store(&mut dirent[de_slot]);
            de_slot += 1;
        }
    }

    // write the directory entries back
    for d in 0..au {
        let offset = trans.sectors[d];
        for s in 0..8 {
            image.buf[offset + s * ENTRY_SIZE..offset + (s + 1) * ENTRY_SIZE]
                .copy_from_slice(&dirent[d * 8 + s]);
        }
    }

    debug!("wrote {} to the CP/M directory", name);

    Ok(())
}

/// Read a disk image in C128 CP/M format and extract all its files
///
/// # Arguments
///
/// - `data` - the disk image contents
/// - `sink` - destination for the contained files
/// - `diag` - diagnostic output
pub fn read_cpm_image(
    data: &[u8],
    sink: &mut dyn FileSink,
    diag: &mut Diagnostics,
) -> Result<(), Error> {
    let image = match Image::from_bytes(data) {
        Ok(image) => image,
        Err(e) => {
            diag.error(None, "Unknown CP/M disk image type");
            return Err(e);
        }
    };

    let trans = trans_table(&image).ok_or_else(|| invalid("unknown CP/M disk image type"))?;
    let au = trans.au;
    let sectors = trans.sectors.len();

    let entry_at = |d: usize| -> CpmDirEnt {
        let offset = trans.sectors[d / 8] + (d % 8) * ENTRY_SIZE;
        CpmDirEnt::parse(&image.buf[offset..offset + ENTRY_SIZE])
    };

    // traverse through the directory and extract the files
    let mut d = 0usize;
    while d < au * 8 {
        let directory = entry_at(d);

        if directory.area == UNUSED {
            d += 1;
            continue; // unused entry
        }

        let name = cpm_convert_name(&directory);

        if directory.extent != 0 {
            diag.warning(
                Some(&name),
                &format!(
                    "starting with non-zero extent 0x{:02x}, file ignored",
                    directory.extent
                ),
            );
            d += 1;
            continue;
        }

        // search for following extents
        let mut extents = 0usize;
        let mut length = 0usize;
        for i in d..au * 8 {
            let dir = entry_at(i);
            if !dir.same_file(&directory) || dir.extent as usize != extents || dir.blocks > 128 {
                break;
            }
            extents += 1;
            length += dir.blocks as usize;
            if dir.blocks < 128 {
                break;
            }
        }

        if extents == 0 {
            diag.warning(Some(&name), "error in directory entry, file skipped");
            d += 1;
            continue;
        }

        if directory.area != 0 {
            diag.warning(
                Some(&name),
                &format!("user area code 0x{:02x} ignored", directory.area),
            );
        }

        let mut buf = Vec::with_capacity(length * 128);
        let mut bad_block = false;

        'extents: for i in d..d + extents {
            let dir = entry_at(i);
            for j in 0..dir.blocks as usize {
                let sect = (au / 2) * dir.block_pointer(au, j / au) + ((j / 2) % (au / 2));

                if sect >= sectors {
                    diag.error(
                        Some(&name),
                        &format!(
                            "Illegal block address in block {} of extent 0x{:02x}",
                            j, dir.extent
                        ),
                    );
                    bad_block = true;
                    break 'extents;
                }

                let offset = trans.sectors[sect] + 128 * (j % 2);
                buf.extend_from_slice(&image.buf[offset..offset + 128]);
            }
        }

        if bad_block {
            d += extents;
            continue;
        }

        // remove trailing EOF characters from the last block
        let mut end = buf.len();
        while end > 0 && buf[end - 1] == 0x1A {
            end -= 1;
        }
        buf.truncate(end);

        sink.write_file(&name, &buf, diag)?;

        d += extents;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_cpm_image, trans_table, write_cpm_image};
    use crate::container::FileSink;
    use crate::diag::Diagnostics;
    use crate::error::Error;
    use crate::image::{DirEntMode, DiskGeometry, Image, ImageType};
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

    fn blank_cpm(image_type: ImageType) -> Image {
        let geom = DiskGeometry::get(image_type);
        // a blank CP/M disk is all 0xE5
        let mut image = Image::from_bytes(&vec![0xE5u8; geom.blocks * 256]).unwrap();
        image.dirent_mode = DirEntMode::OnlyCreate;
        image
    }

    #[test]
    fn translation_tables_have_the_right_shape() {
        for (image_type, au, sectors) in [
            (ImageType::Im1541, 8usize, 680usize),
            (ImageType::Im1571, 8, 1360),
            (ImageType::Im1581, 16, 3180),
        ] {
            let image = blank_cpm(image_type);
            let trans = trans_table(&image).unwrap();
            assert_eq!(trans.au, au);
            assert_eq!(trans.sectors.len(), sectors);

            let limit = image.buf.len();
            for offset in &trans.sectors {
                assert!(offset + 256 <= limit);
            }
        }
    }

    #[test]
    fn cpm_round_trip_1541() {
        let mut image = blank_cpm(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        let name = Filename::from_ascii("README.TXT", Filetype::Prg, 0);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 25) as u8 + b'a').collect();

        write_cpm_image(&name, &data, &mut image, &mut diag).expect("write failed");

        let mut sink = Collector { files: Vec::new() };
        read_cpm_image(&image.buf, &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0.printable(), "README.TXT,prg");
        assert_eq!(sink.files[0].1, data);
    }

    #[test]
    fn cpm_round_trip_1581_multi_extent() {
        let mut image = blank_cpm(ImageType::Im1581);
        let mut diag = Diagnostics::new();

        let name = Filename::from_ascii("BIG.BIN", Filetype::Prg, 0);
        // more than one extent: over 16 kilobytes
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 201) as u8 + 1).collect();

        write_cpm_image(&name, &data, &mut image, &mut diag).expect("write failed");

        let mut sink = Collector { files: Vec::new() };
        read_cpm_image(&image.buf, &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].1, data);
    }

    #[test]
    fn duplicate_cpm_name_is_rejected() {
        let mut image = blank_cpm(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        let name = Filename::from_ascii("DUP.DAT", Filetype::Prg, 0);
        write_cpm_image(&name, b"one", &mut image, &mut diag).unwrap();
        let err = write_cpm_image(&name, b"two", &mut image, &mut diag).unwrap_err();
        assert!(err.is_file_exists());
    }
}
