#![warn(missing_docs)]
#![warn(unsafe_code)]
//!
//! CBM DOS disk images
//!
//! An [`Image`] holds a complete disk image in memory: a contiguous
//! sector buffer plus the active directory track and the 1581
//! partition limits.  The filesystem operations (block allocation,
//! file chains, the directory) live in [`dos`]; the C128 CP/M view of
//! the same sector buffer lives in [`cpm`].

use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind as IoErrorKind;

use log::debug;

use crate::error::{invalid, Error};
use crate::petscii::Filename;

pub mod cpm;
pub mod dos;
pub mod geometry;

pub use geometry::{DiskGeometry, ImageType};

/// Behaviour of a directory entry lookup when the name is missing
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirEntMode {
    /// only try to find the file name
    DontCreate,
    /// only create a new slot
    OnlyCreate,
    /// create the directory entry if it does not exist
    FindOrCreate,
}

/// Disk ID bytes used when formatting a fresh image
const DISK_ID: [u8; 2] = [b'9', b'8'];

/// Disk title written when formatting a fresh image
const DISK_TITLE: &[u8; 16] = b"CBM CONVERT 1.0 ";

/// A disk image
pub struct Image {
    /// type of disk image
    pub image_type: ImageType,
    /// directory entry lookup behaviour
    pub dirent_mode: DirEntMode,
    /// (active) directory track number
    pub dir_track: u8,
    /// disk image file name on the host system
    pub path: String,
    /// disk image data
    pub buf: Vec<u8>,
    /// lower limits of partitions (for the 1581)
    pub part_bots: [u8; 80],
    /// upper limits of partitions (for the 1581)
    pub part_tops: [u8; 80],
    /// parent partitions (for the 1581)
    pub part_upper: [u8; 80],
}

impl Display for Image {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} image \"{}\"", self.image_type, self.path)
    }
}

impl Image {
    /// Open an existing disk image or create a freshly formatted one.
    ///
    /// # Arguments
    ///
    /// - `path` - name of the disk image on the host system
    /// - `image_type` - type of the disk image
    /// - `dirent_mode` - directory entry handling
    pub fn open(
        path: &str,
        image_type: ImageType,
        dirent_mode: DirEntMode,
    ) -> Result<Image, Error> {
        let geom = DiskGeometry::get(image_type);

        let mut image = Image {
            image_type,
            dirent_mode,
            dir_track: geom.dir_track,
            path: path.to_string(),
            buf: vec![0; geom.blocks * 256],
            part_bots: [0; 80],
            part_tops: [0; 80],
            part_upper: [0; 80],
        };

        image.part_tops[image.dir_track as usize - 1] = geom.tracks;
        image.part_bots[image.dir_track as usize - 1] = 1;
        image.part_upper[image.dir_track as usize - 1] = 0;

        match fs::read(path) {
            Ok(data) => {
                if data.len() != geom.blocks * 256 {
                    return Err(invalid(format!(
                        "\"{}\" is not a {} image",
                        path, image_type
                    )));
                }
                image.buf.copy_from_slice(&data);
                debug!("opened {} image \"{}\"", image_type, path);
            }
            // it is OK if the file was not found
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                image.format();
                debug!("formatted new {} image \"{}\"", image_type, path);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(image)
    }

    /// Build an image around existing in-memory contents, determining
    /// the drive type from the size.
    pub fn from_bytes(data: &[u8]) -> Result<Image, Error> {
        if data.len() % 256 != 0 {
            return Err(invalid("unknown disk image type"));
        }

        let geom = DiskGeometry::from_blocks(data.len() / 256)
            .ok_or_else(|| invalid("unknown disk image type"))?;

        let mut image = Image {
            image_type: geom.image_type,
            dirent_mode: DirEntMode::DontCreate,
            dir_track: geom.dir_track,
            path: String::new(),
            buf: data.to_vec(),
            part_bots: [0; 80],
            part_tops: [0; 80],
            part_upper: [0; 80],
        };

        image.part_tops[image.dir_track as usize - 1] = geom.tracks;
        image.part_bots[image.dir_track as usize - 1] = 1;

        Ok(image)
    }

    /// Write the image back to its host file
    pub fn close(&self) -> Result<(), Error> {
        match fs::write(&self.path, &self.buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::StorageFull => Err(Error::no_space()),
            Err(e) => Err(e.into()),
        }
    }

    /// The geometry of this image
    pub fn geometry(&self) -> &'static DiskGeometry {
        DiskGeometry::get(self.image_type)
    }

    /// Byte offset of the block in the specified track and sector, or
    /// None for an illegal address
    pub fn block_offset(&self, track: u8, sector: u8) -> Option<usize> {
        let geom = self.geometry();

        if track < 1 || track > geom.tracks || sector >= geom.sectors(track) {
            return None; // illegal track or sector
        }

        let mut block = 0usize;
        for t in 1..track {
            block += geom.sectors(t) as usize;
        }
        block += sector as usize;

        Some(block << 8)
    }

    /// Borrow the block at the specified track and sector
    pub fn block(&self, track: u8, sector: u8) -> Option<&[u8]> {
        let offset = self.block_offset(track, sector)?;
        Some(&self.buf[offset..offset + 256])
    }

    /// Mutably borrow the block at the specified track and sector
    pub fn block_mut(&mut self, track: u8, sector: u8) -> Option<&mut [u8]> {
        let offset = self.block_offset(track, sector)?;
        Some(&mut self.buf[offset..offset + 256])
    }
}

/// Location of a directory entry: the byte offset of its directory
/// block plus the slot index within the block
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirEntLoc {
    /// byte offset of the directory block in the image buffer
    pub block: usize,
    /// slot number, 0..8
    pub slot: usize,
}

impl DirEntLoc {
    /// Byte offset of the 32-byte slot
    pub fn offset(&self) -> usize {
        self.block + self.slot * 32
    }
}

/// A disk directory entry, as stored in a 32-byte directory slot.
///
/// The side-sector fields double as the GEOS info block address, and
/// the record length doubles as the GEOS VLIR flag; which reading
/// applies depends on the GEOS type byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirEntry {
    /// track of the next directory block (first slot of a block only)
    pub next_track: u8,
    /// sector of the next directory block (first slot of a block only)
    pub next_sector: u8,
    /// Commodore file type
    pub file_type: u8,
    /// track of the first file data block
    pub first_track: u8,
    /// sector of the first file data block
    pub first_sector: u8,
    /// Commodore file name
    pub name: [u8; 16],
    /// track of the first side sector, or of the GEOS info block
    pub ss_track: u8,
    /// sector of the first side sector, or of the GEOS info block
    pub ss_sector: u8,
    /// relative file record length, or GEOS format (1=VLIR)
    pub record_length: u8,
    /// GEOS file type and time stamp (otherwise unused bytes)
    pub geos: [u8; 6],
    /// the file's total block count
    pub blocks: u16,
}

impl DirEntry {
    /// Decode a 32-byte directory slot
    pub fn parse(raw: &[u8]) -> DirEntry {
        let mut name = [0u8; 16];
        name.copy_from_slice(&raw[5..21]);
        let mut geos = [0u8; 6];
        geos.copy_from_slice(&raw[24..30]);

        DirEntry {
            next_track: raw[0],
            next_sector: raw[1],
            file_type: raw[2],
            first_track: raw[3],
            first_sector: raw[4],
            name,
            ss_track: raw[21],
            ss_sector: raw[22],
            record_length: raw[23],
            geos,
            blocks: u16::from(raw[30]) | u16::from(raw[31]) << 8,
        }
    }

    /// Encode into a 32-byte directory slot
    pub fn store(&self, raw: &mut [u8]) {
        raw[0] = self.next_track;
        raw[1] = self.next_sector;
        raw[2] = self.file_type;
        raw[3] = self.first_track;
        raw[4] = self.first_sector;
        raw[5..21].copy_from_slice(&self.name);
        raw[21] = self.ss_track;
        raw[22] = self.ss_sector;
        raw[23] = self.record_length;
        raw[24..30].copy_from_slice(&self.geos);
        raw[30] = self.blocks as u8;
        raw[31] = (self.blocks >> 8) as u8;
    }
}

impl Image {
    /// Read the directory entry at a location
    pub fn dirent(&self, loc: DirEntLoc) -> DirEntry {
        let offset = loc.offset();
        DirEntry::parse(&self.buf[offset..offset + 32])
    }

    /// Write a directory entry back to its location
    pub fn set_dirent(&mut self, loc: DirEntLoc, entry: &DirEntry) {
        let offset = loc.offset();
        entry.store(&mut self.buf[offset..offset + 32]);
    }

    /// The Commodore file name recorded in a directory entry
    pub fn dirent_filename(&self, entry: &DirEntry) -> Filename {
        use crate::petscii::Filetype;
        Filename {
            name: entry.name,
            filetype: self.filetype_of(entry).unwrap_or(Filetype::Del),
            record_length: entry.record_length,
        }
    }

    /// Format the image: wipe all sectors and lay down an empty BAM
    /// and directory.
    pub fn format(&mut self) {
        let geom = self.geometry();
        let dir_track = self.dir_track;

        // clear all sectors
        self.buf.fill(0);

        match self.image_type {
            ImageType::Im1541 | ImageType::Im1571 => {
                let two_sided = self.image_type == ImageType::Im1571;
                let bam = self.block_offset(dir_track, 0).unwrap();
                let buf = &mut self.buf;

                // track/sector links: the BAM chains to the first
                // directory block
                buf[bam] = dir_track;
                buf[bam + 1] = 1;
                buf[bam + 0x100] = 0;
                buf[bam + 0x101] = 0xFF;
                // format identifier
                buf[bam + 2] = geom.format_id;
                buf[bam + 3] = if two_sided { 0x80 } else { 0x00 };
                // disk title and header padding
                buf[bam + 0x90..bam + 0xA0].copy_from_slice(DISK_TITLE);
                buf[bam + 0xA0..bam + 0xAB].fill(0xA0);
                // format specifier and disk ID
                buf[bam + 0xA5] = b'2';
                buf[bam + 0xA6] = geom.format_id;
                buf[bam + 0xA2] = DISK_ID[0];
                buf[bam + 0xA3] = DISK_ID[1];

                // free all first-side blocks
                for c in buf[bam + 4..bam + 4 + (35 << 2)].iter_mut() {
                    *c = 0xFF;
                }
                for track in 1..=35u8 {
                    // the amount of free blocks on each track, and
                    // the bits of the non-existent sectors
                    let sectors = geom.sectors(track);
                    buf[bam + ((track as usize) << 2)] = sectors;
                    for sector in sectors..24 {
                        buf[bam + ((track as usize) << 2) + 1 + (sector as usize >> 3)] &=
                            !(1 << (sector & 7));
                    }
                }

                if two_sided {
                    // free counts of the back half live in the BAM
                    // sector, the bitmap in a block of its own
                    let bam2 = self.block_offset(dir_track + 35, 0).unwrap();
                    let buf = &mut self.buf;

                    for c in buf[bam2..bam2 + 35 * 3].iter_mut() {
                        *c = 0xFF;
                    }
                    for track in 0..35u8 {
                        let sectors = geom.sectors(track + 36);
                        buf[bam + 0xDC + track as usize + 1] = sectors;
                        for sector in sectors..24 {
                            buf[bam2 + track as usize * 3 + (sector as usize >> 3)] &=
                                !(1 << (sector & 7));
                        }
                    }
                }

                // allocate the BAM and directory blocks
                let (mut t, mut s) = (dir_track, 0);
                self.alloc_block(&mut t, &mut s);
                let (mut t, mut s) = (dir_track, 1);
                self.alloc_block(&mut t, &mut s);
                if two_sided {
                    let (mut t, mut s) = (dir_track + 35, 0);
                    self.alloc_block(&mut t, &mut s);
                }
            }

            ImageType::Im1581 => {
                self.part_tops[dir_track as usize - 1] = geom.tracks;
                self.part_bots[dir_track as usize - 1] = 1;
                self.part_upper[dir_track as usize - 1] = 0;

                let header = self.block_offset(dir_track, 0).unwrap();
                let buf = &mut self.buf;

                // header chains to the first directory block; the two
                // BAM blocks form a chain of their own
                buf[header] = dir_track;
                buf[header + 1] = 3;
                buf[header + 0x100] = dir_track;
                buf[header + 0x101] = 2;
                buf[header + 0x200] = 0;
                buf[header + 0x201] = 0xFF;
                buf[header + 0x300] = 0;
                buf[header + 0x301] = 0xFF;

                // format identifier
                buf[header + 2] = geom.format_id;
                buf[header + 3] = 0;
                // disk title and header padding
                buf[header + 0x04..header + 0x14].copy_from_slice(DISK_TITLE);
                buf[header + 0x14..header + 0x1F].fill(0xA0);
                // format specifier and disk ID
                buf[header + 0x19] = b'3';
                buf[header + 0x1A] = geom.format_id;
                buf[header + 0x16] = DISK_ID[0];
                buf[header + 0x17] = DISK_ID[1];

                for (bam, range) in [
                    (header + 0x100, 1..=40u8),
                    (header + 0x200, 41..=80u8),
                ] {
                    buf[bam + 2] = geom.format_id;
                    buf[bam + 3] = !geom.format_id;
                    buf[bam + 4] = DISK_ID[0];
                    buf[bam + 5] = DISK_ID[1];
                    buf[bam + 6] = 192; // I/O byte
                    buf[bam + 7] = 0; // auto loader flag

                    for track in range {
                        let entry = bam + 16 + ((track - 1) % 40) as usize * 6;
                        if track == dir_track {
                            // header, both BAM blocks and the first
                            // directory block are reserved
                            buf[entry] = 36;
                            buf[entry + 1] = 0xF0;
                        } else {
                            buf[entry] = 40;
                            buf[entry + 1] = 0xFF;
                        }
                        buf[entry + 2..entry + 6].fill(0xFF);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DirEntry, Image, ImageType};
    use pretty_assertions::assert_eq;

    fn blank(image_type: ImageType) -> Image {
        let geom = super::DiskGeometry::get(image_type);
        let mut image = Image::from_bytes(&vec![0u8; geom.blocks * 256]).unwrap();
        image.format();
        image
    }

    #[test]
    fn block_offsets_follow_zone_bands() {
        let image = blank(ImageType::Im1541);
        assert_eq!(image.block_offset(1, 0), Some(0));
        assert_eq!(image.block_offset(1, 20), Some(20 * 256));
        assert_eq!(image.block_offset(2, 0), Some(21 * 256));
        // track 18 starts after 17 tracks of 21 sectors
        assert_eq!(image.block_offset(18, 0), Some(17 * 21 * 256));
        assert_eq!(image.block_offset(18, 19), None);
        assert_eq!(image.block_offset(36, 0), None);
        assert_eq!(image.block_offset(0, 0), None);
    }

    #[test]
    fn fresh_1541_has_664_blocks_free() {
        let image = blank(ImageType::Im1541);
        let bam = image.block_offset(18, 0).unwrap();

        assert_eq!(image.buf[bam + 2], b'A');
        assert_eq!(&image.buf[bam + 0x90..bam + 0xA0], super::DISK_TITLE);
        // 17 blocks left on the directory track
        assert_eq!(image.buf[bam + (18 << 2)], 17);
        assert_eq!(image.blocks_free(), 681);
        // the drive would report 664, not counting the directory track
        assert_eq!(image.blocks_free() - 17, 664);
    }

    #[test]
    fn fresh_1571_frees_both_sides() {
        let image = blank(ImageType::Im1571);
        // two blocks reserved on the front, one (the back-side BAM)
        // on the back
        assert_eq!(image.blocks_free(), 2 * 683 - 3);
        assert!(!image.is_free_block(18, 0));
        assert!(!image.is_free_block(18, 1));
        assert!(!image.is_free_block(53, 0));
        assert!(image.is_free_block(36, 0));
        assert!(image.is_free_block(70, 16));
    }

    #[test]
    fn fresh_1581_reserves_the_directory_chain() {
        let image = blank(ImageType::Im1581);
        assert_eq!(image.blocks_free(), 80 * 40 - 4);
        for sector in 0..4 {
            assert!(!image.is_free_block(40, sector));
        }
        assert!(image.is_free_block(40, 4));
        assert!(image.is_free_block(41, 0));
        assert!(image.is_free_block(80, 39));
    }

    #[test]
    fn dirent_round_trips_through_storage() {
        let entry = DirEntry {
            next_track: 18,
            next_sector: 4,
            file_type: 0x82,
            first_track: 17,
            first_sector: 0,
            name: *b"HOWTO\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0\xA0",
            ss_track: 0,
            ss_sector: 0,
            record_length: 0,
            geos: [0; 6],
            blocks: 0x1234,
        };

        let mut raw = [0u8; 32];
        entry.store(&mut raw);
        let back = DirEntry::parse(&raw);
        assert_eq!(back.next_track, 18);
        assert_eq!(back.file_type, 0x82);
        assert_eq!(back.name, entry.name);
        assert_eq!(back.blocks, 0x1234);
    }
}
