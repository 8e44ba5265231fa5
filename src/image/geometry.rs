//! Disk geometry for the supported Commodore drives
//!
//! Data from the 1541/1571/1581 drive manuals: zone-banded sector
//! counts on the 5.25" drives, a flat 40 sectors per track on the
//! 1581.

use std::fmt::{Display, Formatter, Result};

/// Disk image types
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageType {
    /// 35-track 1541, 3040 or 4040 disk image
    Im1541,
    /// 70-track 1571 disk image
    Im1571,
    /// 80-track 1581 disk image
    Im1581,
}

impl Display for ImageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            ImageType::Im1541 => write!(f, "1541"),
            ImageType::Im1571 => write!(f, "1571"),
            ImageType::Im1581 => write!(f, "1581"),
        }
    }
}

/// Disk geometry information
pub struct DiskGeometry {
    /// disk image type identifier
    pub image_type: ImageType,
    /// disk image size in 256-byte blocks
    pub blocks: usize,
    /// format specifier byte
    pub format_id: u8,
    /// number of BAM blocks at the start of the directory chain
    pub bam_blocks: usize,
    /// directory track number
    pub dir_track: u8,
    /// number of disk tracks
    pub tracks: u8,
    /// number of sectors per track, indexed by track - 1
    sectors: &'static [u8],
    /// sector interleave (number of sectors to advance), per track
    interleave: &'static [u8],
}

/// table of sectors per track on the 1541
static SECT_1541: [u8; 35] = [
    21, 21, 21, 21, 21, 21, 21, 21, 21, // tracks  1 .. 9
    21, 21, 21, 21, 21, 21, 21, 21, // tracks 10 .. 17
    19, 19, 19, 19, 19, 19, 19, // tracks 18 .. 24
    18, 18, 18, 18, 18, 18, // tracks 25 .. 30
    17, 17, 17, 17, 17, // tracks 31 .. 35
];

/// table of sectors per track on the 1571
static SECT_1571: [u8; 70] = [
    21, 21, 21, 21, 21, 21, 21, 21, 21, // tracks  1 .. 9
    21, 21, 21, 21, 21, 21, 21, 21, // tracks 10 .. 17
    19, 19, 19, 19, 19, 19, 19, // tracks 18 .. 24
    18, 18, 18, 18, 18, 18, // tracks 25 .. 30
    17, 17, 17, 17, 17, // tracks 31 .. 35
    21, 21, 21, 21, 21, 21, 21, 21, 21, // tracks 36 .. 44
    21, 21, 21, 21, 21, 21, 21, 21, // tracks 45 .. 52
    19, 19, 19, 19, 19, 19, 19, // tracks 53 .. 59
    18, 18, 18, 18, 18, 18, // tracks 60 .. 65
    17, 17, 17, 17, 17, // tracks 66 .. 70
];

/// table of sectors per track on the 1581
static SECT_1581: [u8; 80] = [40; 80];

/// table of interleave per track on the 1541
static INT_1541: [u8; 35] = [
    10, 10, 10, 10, 10, 10, 10, 10, 10, // tracks  1 .. 9
    10, 10, 10, 10, 10, 10, 10, 10, // tracks 10 .. 17
    3, 10, 10, 10, 10, 10, 10, // tracks 18 .. 24
    10, 10, 10, 10, 10, 10, // tracks 25 .. 30
    10, 10, 10, 10, 10, // tracks 31 .. 35
];

/// table of interleave per track on the 1571
static INT_1571: [u8; 70] = [
    10, 10, 10, 10, 10, 10, 10, 10, 10, // tracks  1 .. 9
    10, 10, 10, 10, 10, 10, 10, 10, // tracks 10 .. 17
    3, 10, 10, 10, 10, 10, 10, // tracks 18 .. 24
    10, 10, 10, 10, 10, 10, // tracks 25 .. 30
    10, 10, 10, 10, 10, // tracks 31 .. 35
    10, 10, 10, 10, 10, 10, 10, 10, 10, // tracks 36 .. 44
    10, 10, 10, 10, 10, 10, 10, 10, // tracks 45 .. 52
    3, 10, 10, 10, 10, 10, 10, // tracks 53 .. 59
    10, 10, 10, 10, 10, 10, // tracks 60 .. 65
    10, 10, 10, 10, 10, // tracks 66 .. 70
];

/// table of interleave per track on the 1581
static INT_1581: [u8; 80] = [1; 80];

/// The disk geometry database
static DISK_GEOMETRY: [DiskGeometry; 3] = [
    DiskGeometry {
        image_type: ImageType::Im1541,
        blocks: 683,
        format_id: b'A',
        bam_blocks: 1,
        dir_track: 18,
        tracks: 35,
        sectors: &SECT_1541,
        interleave: &INT_1541,
    },
    DiskGeometry {
        image_type: ImageType::Im1571,
        blocks: 1366,
        format_id: b'A',
        bam_blocks: 1,
        dir_track: 18,
        tracks: 70,
        sectors: &SECT_1571,
        interleave: &INT_1571,
    },
    DiskGeometry {
        image_type: ImageType::Im1581,
        blocks: 3200,
        format_id: b'D',
        // the actual BAM blocks are in a separate chain
        bam_blocks: 1,
        dir_track: 40,
        tracks: 80,
        sectors: &SECT_1581,
        interleave: &INT_1581,
    },
];

impl DiskGeometry {
    /// Determine the geometry for a disk image type
    pub fn get(image_type: ImageType) -> &'static DiskGeometry {
        DISK_GEOMETRY
            .iter()
            .find(|g| g.image_type == image_type)
            .unwrap()
    }

    /// Determine the geometry from an image size in blocks, if any
    /// drive matches
    pub fn from_blocks(blocks: usize) -> Option<&'static DiskGeometry> {
        DISK_GEOMETRY.iter().find(|g| g.blocks == blocks)
    }

    /// Number of sectors on a track, or 0 for an illegal track
    pub fn sectors(&self, track: u8) -> u8 {
        if track < 1 {
            return 0;
        }
        self.sectors.get(track as usize - 1).copied().unwrap_or(0)
    }

    /// Sector interleave on a track
    pub fn interleave(&self, track: u8) -> u8 {
        if track < 1 {
            return 0;
        }
        self.interleave.get(track as usize - 1).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{DiskGeometry, ImageType};

    #[test]
    fn block_totals_match_sector_tables() {
        for image_type in [ImageType::Im1541, ImageType::Im1571, ImageType::Im1581] {
            let geom = DiskGeometry::get(image_type);
            let total: usize = (1..=geom.tracks).map(|t| geom.sectors(t) as usize).sum();
            assert_eq!(total, geom.blocks);
        }
    }

    #[test]
    fn zone_boundaries() {
        let geom = DiskGeometry::get(ImageType::Im1541);
        assert_eq!(geom.sectors(17), 21);
        assert_eq!(geom.sectors(18), 19);
        assert_eq!(geom.sectors(25), 18);
        assert_eq!(geom.sectors(31), 17);
        assert_eq!(geom.sectors(36), 0);
        assert_eq!(geom.interleave(18), 3);
        assert_eq!(geom.interleave(17), 10);
    }

    #[test]
    fn geometry_from_size() {
        assert_eq!(
            DiskGeometry::from_blocks(683).map(|g| g.image_type),
            Some(ImageType::Im1541)
        );
        assert_eq!(
            DiskGeometry::from_blocks(1366).map(|g| g.image_type),
            Some(ImageType::Im1571)
        );
        assert_eq!(
            DiskGeometry::from_blocks(3200).map(|g| g.image_type),
            Some(ImageType::Im1581)
        );
        assert!(DiskGeometry::from_blocks(684).is_none());
    }
}
