//! The CBM DOS filesystem over a disk image
//!
//! Everything here works on the sector buffer of an [`Image`]: the
//! Block Availability Map, file chains (each data block starts with
//! the track and sector of the next one), the directory, relative
//! file side sectors, and GEOS files in both their on-disk and
//! Convert transport forms.
//!
//! Every multi-step mutation snapshots the BAM first and restores it
//! on any failure, so a caller never observes a half-written file in
//! the allocation map.

use log::debug;

use crate::container::FileSink;
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::petscii::{Filename, Filetype};
use crate::rounddiv;

use super::{DirEntLoc, DirEntry, Image, ImageType};

/// Payload bytes per data block
const BLOCK: usize = 254;

/// Data chain entries per side sector
const SS_ENTRIES: usize = 120;

/// Signature inside a GEOS Convert header
const CONVERT_TAG: &[u8; 21] = b" formatted GEOS file ";

/// Header written when converting a GEOS file off a disk,
/// including its terminating NUL
const CONVERT_HEADER: &[u8; 29] = b"PRG formatted GEOS file V1.0\0";

impl Image {
    /// Determine the file type of a directory entry, or None for an
    /// illegal type byte.  `CBM` partitions only exist on the 1581.
    pub fn filetype_of(&self, entry: &DirEntry) -> Option<Filetype> {
        let filetype = Filetype::from_code(entry.file_type)?;

        if filetype == Filetype::Cbm && self.image_type != ImageType::Im1581 {
            return None;
        }

        Some(filetype)
    }

    /// Determine whether a directory entry represents a GEOS file
    pub fn is_geos_dirent(&self, entry: &DirEntry) -> bool {
        let filetype = entry.file_type & 0x8F;

        (0x80..0x84).contains(&filetype)
            && entry.geos[0] != 0
            && (entry.record_length == 0 || entry.record_length == 1)
    }

    /// Determine if the block at the specified track and sector is
    /// free
    pub fn is_free_block(&self, track: u8, sector: u8) -> bool {
        let geom = self.geometry();

        if track < 1 || track > geom.tracks || sector >= geom.sectors(track) {
            return false; // illegal track or sector
        }

        let bit = 1 << (sector & 7);

        match self.image_type {
            ImageType::Im1571 if track > 35 => {
                let tr = (track - 36) as usize;
                match self.block_offset(self.dir_track + 35, 0) {
                    Some(bam) => self.buf[bam + tr * 3 + (sector as usize >> 3)] & bit != 0,
                    None => false,
                }
            }
            ImageType::Im1541 | ImageType::Im1571 => {
                match self.block_offset(self.dir_track, 0) {
                    Some(bam) => {
                        self.buf[bam + ((track as usize) << 2) + 1 + (sector as usize >> 3)] & bit
                            != 0
                    }
                    None => false,
                }
            }
            ImageType::Im1581 => {
                let dt = self.dir_track as usize - 1;
                if track > self.part_tops[dt] || track < self.part_bots[dt] {
                    return false;
                }

                let mut bam = match self.block_offset(self.dir_track, 1) {
                    Some(bam) => bam,
                    None => return false,
                };

                let mut track = track;
                if track > 40 {
                    bam = match self.block_offset(self.buf[bam], self.buf[bam + 1]) {
                        Some(bam) => bam,
                        None => return false,
                    };
                    track -= 40;
                }

                self.buf[bam + 16 + (track as usize - 1) * 6 + (sector as usize >> 3) + 1] & bit
                    != 0
            }
        }
    }

    /// Find the next free block closest to the specified track and
    /// sector.
    ///
    /// The search runs from the current track away from the directory
    /// track to the edge of the active partition, stepping sectors by
    /// the track interleave, then through the other half of the disk,
    /// and finally over the directory track itself.
    pub fn find_next_free(&self, track: &mut u8, sector: &mut u8) -> bool {
        let geom = self.geometry();
        let dt = self.dir_track as i32;
        let top = i32::from(self.part_tops[self.dir_track as usize - 1]);
        let bot = i32::from(self.part_bots[self.dir_track as usize - 1]);

        let mut t = i32::from(*track);
        let mut s = i32::from(*sector);

        if t < 1 || t > i32::from(geom.tracks) || s >= i32::from(geom.sectors(t as u8)) {
            return false;
        }

        let probe = |t: i32, s: &mut i32| -> bool {
            let sectors = i32::from(geom.sectors(t as u8));
            let interleave = i32::from(geom.interleave(t as u8));
            for _ in 0..sectors {
                if self.is_free_block(t as u8, *s as u8) {
                    return true;
                }
                *s = (*s + interleave) % sectors;
            }
            false
        };

        if t >= dt {
            // search from the current track upwards
            while t <= top {
                if probe(t, &mut s) {
                    *track = t as u8;
                    *sector = s as u8;
                    return true;
                }
                t += 1;
            }

            // then from the directory track downwards
            t = dt - 1;
            while t >= bot {
                if probe(t, &mut s) {
                    *track = t as u8;
                    *sector = s as u8;
                    return true;
                }
                t -= 1;
            }
        } else {
            // search from the current track downwards
            while t >= bot {
                if probe(t, &mut s) {
                    *track = t as u8;
                    *sector = s as u8;
                    return true;
                }
                t -= 1;
            }

            // then from the directory track upwards
            t = dt + 1;
            while t <= top {
                if probe(t, &mut s) {
                    *track = t as u8;
                    *sector = s as u8;
                    return true;
                }
                t += 1;
            }

            // last resort: the directory track itself
            if probe(dt, &mut s) {
                *track = dt as u8;
                *sector = s as u8;
                return true;
            }
        }

        false
    }

    /// Allocate the block at the specified track and sector, then
    /// advance the track and sector to the next candidate.
    ///
    /// Fails if the block is already allocated.
    pub fn alloc_block(&mut self, track: &mut u8, sector: &mut u8) -> bool {
        let geom = self.geometry();

        if *track < 1 || *track > geom.tracks || *sector >= geom.sectors(*track) {
            return false; // illegal track or sector
        }

        let bit = 1u8 << (*sector & 7);

        match self.image_type {
            ImageType::Im1571 if *track > 35 => {
                let tr = (*track - 35) as usize;
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return false,
                };
                let bam2 = match self.block_offset(self.dir_track + 35, 0) {
                    Some(bam2) => bam2,
                    None => return false,
                };
                let index = bam2 + (tr - 1) * 3 + (*sector as usize >> 3);

                if self.buf[index] & bit == 0 {
                    return false; // already allocated
                }

                self.buf[bam + 0xDC + tr] -= 1;
                self.buf[index] &= !bit;
            }
            ImageType::Im1541 | ImageType::Im1571 => {
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return false,
                };
                let index = bam + ((*track as usize) << 2) + 1 + (*sector as usize >> 3);

                if self.buf[index] & bit == 0 {
                    return false; // already allocated
                }

                self.buf[bam + ((*track as usize) << 2)] -= 1;
                self.buf[index] &= !bit;
            }
            ImageType::Im1581 => {
                let dt = self.dir_track as usize - 1;
                if *track > self.part_tops[dt] || *track < self.part_bots[dt] {
                    return false;
                }

                let bam_chain = match self.map_inode(self.dir_track, 1, None, None) {
                    Some(chain) if chain.len() == 2 => chain,
                    _ => return false,
                };

                let (bam, offset) = if *track > 40 {
                    (bam_chain[1], (*track - 40) as usize)
                } else {
                    (bam_chain[0], *track as usize)
                };

                let index = bam + 16 + (offset - 1) * 6 + (*sector as usize >> 3) + 1;

                if self.buf[index] & bit == 0 {
                    return false; // already allocated
                }

                self.buf[bam + 16 + (offset - 1) * 6] -= 1;
                self.buf[index] &= !bit;
            }
        }

        // find the next block candidate
        self.find_next_free(track, sector);
        true
    }

    /// Free the block at the specified track and sector.
    ///
    /// Fails if the block is already free.
    pub fn free_block(&mut self, track: u8, sector: u8) -> bool {
        let geom = self.geometry();

        if track < 1 || track > geom.tracks || sector >= geom.sectors(track) {
            return false; // illegal track or sector
        }

        if self.is_free_block(track, sector) {
            return false; // already freed
        }

        let bit = 1u8 << (sector & 7);

        match self.image_type {
            ImageType::Im1571 if track > 35 => {
                let tr = (track - 35) as usize;
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return false,
                };
                let bam2 = match self.block_offset(self.dir_track + 35, 0) {
                    Some(bam2) => bam2,
                    None => return false,
                };

                self.buf[bam + 0xDC + tr] += 1;
                self.buf[bam2 + (tr - 1) * 3 + (sector as usize >> 3)] |= bit;
                true
            }
            ImageType::Im1541 | ImageType::Im1571 => {
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return false,
                };

                self.buf[bam + ((track as usize) << 2)] += 1;
                self.buf[bam + ((track as usize) << 2) + 1 + (sector as usize >> 3)] |= bit;
                true
            }
            ImageType::Im1581 => {
                let dt = self.dir_track as usize - 1;
                if track > self.part_tops[dt] || track < self.part_bots[dt] {
                    return false;
                }

                let bam_chain = match self.map_inode(self.dir_track, 1, None, None) {
                    Some(chain) if chain.len() == 2 => chain,
                    _ => return false,
                };

                let (bam, offset) = if track > 40 {
                    (bam_chain[1], (track - 40) as usize)
                } else {
                    (bam_chain[0], track as usize)
                };

                self.buf[bam + 16 + (offset - 1) * 6] += 1;
                self.buf[bam + 16 + (offset - 1) * 6 + (sector as usize >> 3) + 1] |= bit;
                true
            }
        }
    }

    /// Build the block pointer table of the file starting at the
    /// specified track and sector: the byte offset of every block on
    /// its chain.
    ///
    /// A chain that runs over a free block fails the mapping, unless
    /// a diagnostic context is supplied, in which case the free block
    /// is reported and traversal continues.
    pub fn map_inode(
        &self,
        track: u8,
        sector: u8,
        mut diag: Option<&mut Diagnostics>,
        name: Option<&Filename>,
    ) -> Option<Vec<usize>> {
        let geom = self.geometry();

        // determine the number of blocks
        let (mut t, mut s) = (track, sector);
        let mut size = 0usize;
        while t != 0 {
            if size > geom.blocks {
                return None; // endless file
            }

            let offset = self.block_offset(t, s)?;

            if self.is_free_block(t, s) {
                match diag.as_deref_mut() {
                    None => return None,
                    Some(diag) => diag.warning(
                        name,
                        &format!(
                            "Unallocated block {},{} reachable from {},{}",
                            t, s, track, sector
                        ),
                    ),
                }
            }

            t = self.buf[offset];
            s = self.buf[offset + 1];
            size += 1;
        }

        if size == 0 {
            return None;
        }

        // set up the block pointer table
        let mut table = Vec::with_capacity(size);
        let (mut t, mut s) = (track, sector);
        while t != 0 {
            let offset = self.block_offset(t, s)?;
            table.push(offset);
            t = self.buf[offset];
            s = self.buf[offset + 1];
        }

        Some(table)
    }

    /// Read the file starting at the specified track and sector.
    ///
    /// Interior blocks contribute 254 payload bytes; the terminal
    /// block's link sector field holds its used byte count plus one.
    pub fn read_inode(&self, track: u8, sector: u8) -> Option<Vec<u8>> {
        let geom = self.geometry();

        // determine the file size
        let (mut t, mut s) = (track, sector);
        let mut size = 0usize;
        while t != 0 {
            if size > BLOCK * geom.blocks {
                return None; // endless file
            }

            let offset = self.block_offset(t, s)?;

            if self.is_free_block(t, s) {
                return None;
            }

            t = self.buf[offset];
            s = self.buf[offset + 1];
            size += BLOCK;
        }

        if size == 0 || s < 2 {
            // the last byte pointer must be at least 2
            return None;
        }

        let mut buf = Vec::with_capacity(size + s as usize - 255);

        // read the file
        let (mut t, mut s) = (track, sector);
        while t != 0 {
            let offset = self.block_offset(t, s)?;
            t = self.buf[offset];
            s = self.buf[offset + 1];
            let used = if t != 0 { BLOCK } else { s as usize - 1 };
            buf.extend_from_slice(&self.buf[offset + 2..offset + 2 + used]);
        }

        Some(buf)
    }

    /// Make a back-up copy of the Block Availability Map
    pub fn backup_bam(&self) -> Option<Vec<u8>> {
        match self.image_type {
            ImageType::Im1541 => {
                let bam = self.block_offset(self.dir_track, 0)?;
                Some(self.buf[bam + 4..bam + 4 + (35 << 2)].to_vec())
            }
            ImageType::Im1571 => {
                let bam = self.block_offset(self.dir_track, 0)?;
                let bam2 = self.block_offset(self.dir_track + 35, 0)?;

                let mut backup = Vec::with_capacity(280);
                backup.extend_from_slice(&self.buf[bam + 4..bam + 4 + (35 << 2)]);
                backup.extend_from_slice(&self.buf[bam + 0xDD..bam + 0xDD + 35]);
                backup.extend_from_slice(&self.buf[bam2..bam2 + 35 * 3]);
                Some(backup)
            }
            ImageType::Im1581 => {
                let chain = self.map_inode(self.dir_track, 1, None, None)?;
                if chain.len() != 2 {
                    return None;
                }

                let mut backup = Vec::with_capacity(512);
                backup.extend_from_slice(&self.buf[chain[0]..chain[0] + 256]);
                backup.extend_from_slice(&self.buf[chain[1]..chain[1] + 256]);
                Some(backup)
            }
        }
    }

    /// Restore a back-up copy of the Block Availability Map
    pub fn restore_bam(&mut self, backup: &[u8]) -> bool {
        match self.image_type {
            ImageType::Im1541 => {
                if backup.len() != 35 << 2 {
                    return false;
                }
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return false,
                };
                self.buf[bam + 4..bam + 4 + (35 << 2)].copy_from_slice(backup);
                true
            }
            ImageType::Im1571 => {
                if backup.len() != 280 {
                    return false;
                }
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return false,
                };
                let bam2 = match self.block_offset(self.dir_track + 35, 0) {
                    Some(bam2) => bam2,
                    None => return false,
                };
                self.buf[bam + 4..bam + 4 + (35 << 2)].copy_from_slice(&backup[..140]);
                self.buf[bam + 0xDD..bam + 0xDD + 35].copy_from_slice(&backup[140..175]);
                self.buf[bam2..bam2 + 35 * 3].copy_from_slice(&backup[175..]);
                true
            }
            ImageType::Im1581 => {
                if backup.len() != 512 {
                    return false;
                }
                let chain = match self.map_inode(self.dir_track, 1, None, None) {
                    Some(chain) if chain.len() == 2 => chain,
                    _ => return false,
                };
                self.buf[chain[0]..chain[0] + 256].copy_from_slice(&backup[..256]);
                self.buf[chain[1]..chain[1] + 256].copy_from_slice(&backup[256..]);
                true
            }
        }
    }

    /// Write a file chain starting from the specified track and
    /// sector, allocating blocks as it goes.  The BAM is restored on
    /// any failure.
    pub fn write_inode(&mut self, track: u8, sector: u8, data: &[u8]) -> Result<(), Error> {
        let backup = self
            .backup_bam()
            .ok_or_else(|| invalid("cannot back up the BAM"))?;

        let (mut t, mut s) = (track, sector);
        let mut count = 0usize;

        while count < data.len() {
            let offset = match self.block_offset(t, s) {
                Some(offset) => offset,
                None => {
                    self.restore_bam(&backup);
                    return Err(invalid("illegal block on file chain"));
                }
            };

            // allocating advances (t, s) to the next candidate
            if !self.alloc_block(&mut t, &mut s) {
                self.restore_bam(&backup);
                return Err(Error::no_space());
            }

            if count + BLOCK < data.len() {
                // not yet the last block
                self.buf[offset] = t;
                self.buf[offset + 1] = s;
                self.buf[offset + 2..offset + 256].copy_from_slice(&data[count..count + BLOCK]);
            } else {
                let used = data.len() - count;
                self.buf[offset] = 0;
                self.buf[offset + 1] = (used + 1) as u8;
                self.buf[offset + 2..offset + 2 + used].copy_from_slice(&data[count..]);
            }

            count += BLOCK;
        }

        Ok(())
    }

    /// Wipe out the file starting at the specified track and sector.
    ///
    /// With `do_it` false this is a dry run: it only verifies that
    /// the whole chain is allocated and addressable.
    pub fn delete_inode(&mut self, track: u8, sector: u8, do_it: bool) -> Result<(), Error> {
        let geom = self.geometry();

        // make sure that the whole file has been allocated
        let (mut t, mut s) = (track, sector);
        let mut count = 0usize;
        while t != 0 {
            if count > geom.blocks {
                return Err(invalid("endless file chain"));
            }
            let offset = self
                .block_offset(t, s)
                .ok_or_else(|| invalid("illegal block on file chain"))?;
            if self.is_free_block(t, s) {
                return Err(invalid("file chain runs over a free block"));
            }
            t = self.buf[offset];
            s = self.buf[offset + 1];
            count += 1;
        }

        if do_it {
            // free the space allocated by the file
            let (mut t, mut s) = (track, sector);
            while t != 0 {
                let offset = self.block_offset(t, s).unwrap();
                let next_t = self.buf[offset];
                let next_s = self.buf[offset + 1];
                self.free_block(t, s);
                // clear the block
                self.buf[offset..offset + 256].fill(0);
                t = next_t;
                s = next_s;
            }
        }

        Ok(())
    }

    /// Determine the number of free blocks on the disk image
    pub fn blocks_free(&self) -> usize {
        let geom = self.geometry();
        let mut sum = 0usize;

        match self.image_type {
            ImageType::Im1541 => {
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return 0,
                };
                for track in 1..=geom.tracks as usize {
                    sum += self.buf[bam + (track << 2)] as usize;
                }
            }
            ImageType::Im1571 => {
                let bam = match self.block_offset(self.dir_track, 0) {
                    Some(bam) => bam,
                    None => return 0,
                };
                for track in 1..=35usize {
                    sum += self.buf[bam + (track << 2)] as usize;
                    sum += self.buf[bam + 0xDC + track] as usize;
                }
            }
            ImageType::Im1581 => {
                let chain = match self.map_inode(self.dir_track, 1, None, None) {
                    Some(chain) if chain.len() == 2 => chain,
                    _ => return 0,
                };
                let dt = self.dir_track as usize - 1;
                for track in self.part_bots[dt]..=self.part_tops[dt].min(40) {
                    sum += self.buf[chain[0] + 16 + (track as usize - 1) * 6] as usize;
                }
                for track in 41..=self.part_tops[dt] {
                    if track < self.part_bots[dt] {
                        continue;
                    }
                    sum += self.buf[chain[1] + 16 + (track as usize - 41) * 6] as usize;
                }
            }
        }

        sum
    }

    /// Find the directory entry of a file, or a fresh slot for it.
    ///
    /// Matching is by full 16-byte name equality.  On a miss the
    /// behaviour depends on the image's [`super::DirEntMode`]: either
    /// fail, or claim the first unused slot, growing the directory by
    /// a block if none is free.  A claimed slot is returned cleared.
    pub fn get_dir_ent(&mut self, name: &Filename) -> Option<DirEntLoc> {
        let geom = self.geometry();
        let mut directory = self.map_inode(self.dir_track, 0, None, None)?;

        // the directory must hold the BAM blocks and at least one
        // directory sector
        if directory.len() < geom.bam_blocks {
            return None;
        }

        let mut freeslot: Option<DirEntLoc> = None;
        let mut block = geom.bam_blocks;
        let mut i = 0usize;

        loop {
            let boff = directory[block];
            let limit = if self.buf[boff] != 0 {
                256
            } else {
                self.buf[boff + 1] as usize
            };

            i = 0;
            while i < 8 && i * 32 < limit {
                let loc = DirEntLoc {
                    block: boff,
                    slot: i,
                };

                if freeslot.is_none() && self.buf[loc.offset() + 2] == 0 {
                    // null file type, an unused slot
                    freeslot = Some(loc);
                }

                if self.buf[loc.offset() + 5..loc.offset() + 21] == name.name {
                    return Some(loc);
                }

                i += 1;
            }

            if self.buf[boff] == 0 || block + 1 >= directory.len() {
                break;
            }
            block += 1;
        }

        // the name was not found in the directory
        if self.dirent_mode == super::DirEntMode::DontCreate {
            return None;
        }

        let slot = match freeslot {
            Some(slot) => slot,
            None if i < 8 => {
                // grow the directory by growing its last sector
                let boff = directory[block];
                let next_sector = self.buf[boff + 1];
                self.buf[boff + 1] = 32u8.wrapping_mul(1 + next_sector / 32);
                DirEntLoc {
                    block: boff,
                    slot: i,
                }
            }
            None => {
                // allocate a new directory block
                let boff = directory[block];

                let mut track = self.dir_track;
                let mut sector = geom.bam_blocks as u8;
                if !self.find_next_free(&mut track, &mut sector) {
                    return None;
                }

                self.buf[boff] = track;
                self.buf[boff + 1] = sector;

                let (mut t, mut s) = (track, sector);
                if !self.alloc_block(&mut t, &mut s) {
                    self.buf[boff] = 0;
                    self.buf[boff + 1] = 0xFF;
                    return None;
                }

                // remap the directory from the disk image
                let old_len = directory.len();
                directory = self.map_inode(self.dir_track, 0, None, None)?;
                let new_boff = *directory.get(old_len)?;

                // initialize the new directory block
                self.buf[new_boff..new_boff + 256].fill(0);
                self.buf[new_boff + 1] = 0xFF;

                DirEntLoc {
                    block: new_boff,
                    slot: 0,
                }
            }
        };

        // clear the directory entry, preserving the block link in the
        // first slot
        let offset = slot.offset();
        if slot.slot != 0 {
            self.buf[offset..offset + 32].fill(0);
        } else {
            self.buf[offset + 2..offset + 32].fill(0);
        }

        Some(slot)
    }

    /// Remove a directory entry and free the blocks it points to
    pub fn delete_dir_ent(&mut self, loc: DirEntLoc) -> Result<(), Error> {
        let entry = self.dirent(loc);

        if self.is_geos_dirent(&entry) {
            // check that the inodes can be deleted
            self.delete_inode(entry.first_track, entry.first_sector, false)?;
            self.delete_inode(entry.ss_track, entry.ss_sector, false)?;

            if entry.record_length == 1 {
                // a VLIR file: every record chain goes too
                let vlir_offset = self
                    .block_offset(entry.first_track, entry.first_sector)
                    .ok_or_else(|| invalid("illegal VLIR block address"))?;
                let vlir: Vec<u8> = self.buf[vlir_offset..vlir_offset + 256].to_vec();

                for record in 1..128 {
                    if vlir[2 * record] != 0 {
                        self.delete_inode(vlir[2 * record], vlir[2 * record + 1], false)?;
                    }
                }

                for record in 1..128 {
                    if vlir[2 * record] != 0 {
                        let _ = self.delete_inode(vlir[2 * record], vlir[2 * record + 1], true);
                    }
                }
            }

            // delete the info block and the file
            let _ = self.delete_inode(entry.ss_track, entry.ss_sector, true);
            let _ = self.delete_inode(entry.first_track, entry.first_sector, true);
            self.buf[loc.offset() + 2] = 0;
            return Ok(());
        }

        if self.filetype_of(&entry) == Some(Filetype::Rel) {
            self.delete_inode(entry.first_track, entry.first_sector, false)?;
            self.delete_inode(entry.ss_track, entry.ss_sector, true)?;
        }

        self.delete_inode(entry.first_track, entry.first_sector, true)?;

        // nuke the directory entry
        self.buf[loc.offset() + 2] = 0;
        Ok(())
    }

    /// Set up the side sector file for a relative file whose data
    /// chain has already been written.
    ///
    /// # Arguments
    ///
    /// - `loc` - the directory entry, with the side sector start
    ///   candidate and record length filled in
    /// - `blocks` - number of data blocks in the file
    /// - `diag` - diagnostic output
    pub fn setup_side_sectors(
        &mut self,
        loc: DirEntLoc,
        blocks: usize,
        diag: &mut Diagnostics,
    ) -> Result<(), Error> {
        if self.image_type == ImageType::Im1581 {
            // no super side sector support
            return Err(invalid("relative files on the 1581 are not supported"));
        }

        let sscount = rounddiv(blocks, SS_ENTRIES);

        if sscount < 1 {
            return Err(invalid("empty relative file"));
        }

        if sscount > 6 || self.blocks_free() < sscount {
            // too many side sector blocks
            return Err(Error::no_space());
        }

        let mut entry = self.dirent(loc);

        let (mut t, mut s) = (entry.ss_track, entry.ss_sector);
        if !self.find_next_free(&mut t, &mut s) {
            return Err(Error::no_space());
        }
        entry.ss_track = t;
        entry.ss_sector = s;
        self.set_dirent(loc, &entry);

        let sslength = 14 + BLOCK * (sscount - 1) + 2 * (blocks % SS_ENTRIES);
        self.write_inode(t, s, &vec![0u8; sslength])?;

        let name = self.dirent_filename(&entry);

        let datafile = self
            .map_inode(
                entry.first_track,
                entry.first_sector,
                Some(&mut *diag),
                Some(&name),
            )
            .ok_or_else(|| invalid("cannot map the data chain"))?;
        if datafile.len() != blocks {
            return Err(invalid("data chain length mismatch"));
        }

        let sidesect = self
            .map_inode(t, s, Some(&mut *diag), Some(&name))
            .ok_or_else(|| invalid("cannot map the side sectors"))?;
        if sidesect.len() != sscount {
            return Err(invalid("side sector chain length mismatch"));
        }

        // each side sector carries its index, the record length, and
        // the addresses of all side sectors
        for ss in 0..sscount {
            let offset = sidesect[ss];
            self.buf[offset + 2] = ss as u8;
            self.buf[offset + 3] = entry.record_length;
            self.buf[offset + 4] = entry.ss_track;
            self.buf[offset + 5] = entry.ss_sector;

            for i in 1..sscount {
                let prev = sidesect[i - 1];
                let (link_t, link_s) = (self.buf[prev], self.buf[prev + 1]);
                self.buf[offset + 4 + i * 2] = link_t;
                self.buf[offset + 5 + i * 2] = link_s;
            }
        }

        // the data block table, 120 entries per side sector
        let (mut track, mut sector) = (entry.first_track, entry.first_sector);
        let mut ssentry = 0usize;
        while track != 0 {
            let ss = ssentry / SS_ENTRIES;
            if ss >= sscount {
                return Err(invalid("data chain longer than the side sectors"));
            }

            let offset = sidesect[ss];
            self.buf[offset + 16 + (ssentry % SS_ENTRIES) * 2] = track;
            self.buf[offset + 17 + (ssentry % SS_ENTRIES) * 2] = sector;

            let data_offset = datafile[ssentry];
            track = self.buf[data_offset];
            sector = self.buf[data_offset + 1];
            ssentry += 1;
        }

        Ok(())
    }

    /// Check if the side sectors of a relative file are intact
    pub fn check_side_sectors(&self, loc: DirEntLoc, diag: &mut Diagnostics) -> bool {
        let entry = self.dirent(loc);

        if self.filetype_of(&entry) != Some(Filetype::Rel) {
            return false;
        }

        let name = self.dirent_filename(&entry);

        // map the data file and the side sectors
        let datafile = match self.map_inode(
            entry.first_track,
            entry.first_sector,
            Some(&mut *diag),
            Some(&name),
        ) {
            Some(datafile) => datafile,
            None => return false,
        };

        let sidesect = match self.map_inode(
            entry.ss_track,
            entry.ss_sector,
            Some(&mut *diag),
            Some(&name),
        ) {
            Some(sidesect) => sidesect,
            None => return false,
        };

        let blocks = datafile.len();
        let sscount = sidesect.len();

        // check the block counts
        let last_length = i64::from(self.buf[sidesect[sscount - 1] + 1]);
        if sscount != rounddiv(blocks, SS_ENTRIES)
            || blocks + sscount != entry.blocks as usize
            || blocks as i64 != (SS_ENTRIES * (sscount - 1)) as i64 + (last_length - 15) / 2
        {
            return false;
        }

        // check the side sector links
        for ss in 0..sscount {
            let offset = sidesect[ss];
            if self.buf[offset + 2] != ss as u8
                || self.buf[offset + 3] != entry.record_length
                || self.buf[offset + 4] != entry.ss_track
                || self.buf[offset + 5] != entry.ss_sector
            {
                return false;
            }

            for i in 1..sscount {
                let prev = sidesect[i - 1];
                if self.buf[offset + 4 + i * 2] != self.buf[prev]
                    || self.buf[offset + 5 + i * 2] != self.buf[prev + 1]
                {
                    return false;
                }
            }
        }

        // check the links to the data file
        let (mut track, mut sector) = (entry.first_track, entry.first_sector);
        let mut ssentry = 0usize;
        while track != 0 {
            let ss = ssentry / SS_ENTRIES;

            if ss >= sscount {
                return false;
            }
            let offset = sidesect[ss];
            if self.buf[offset + 16 + (ssentry % SS_ENTRIES) * 2] != track
                || self.buf[offset + 17 + (ssentry % SS_ENTRIES) * 2] != sector
            {
                return false;
            }

            let data_offset = datafile[ssentry];
            track = self.buf[data_offset];
            sector = self.buf[data_offset + 1];
            ssentry += 1;
        }

        true
    }
}

/// Outcome of trying to handle a file as GEOS
enum Geos {
    /// The file was handled
    Done,
    /// The file is not a valid GEOS file; fall back to the plain path
    NotGeos,
}

/// Write a GEOS Convert file onto the disk, if `data` is one.
fn try_write_geos(
    image: &mut Image,
    data: &[u8],
    diag: &mut Diagnostics,
) -> Result<Geos, Error> {
    if data.len() <= 2 * BLOCK || &data[33..54] != CONVERT_TAG {
        return Ok(Geos::NotGeos);
    }

    // the Convert header is a directory entry without its block link
    let mut raw = [0u8; 32];
    raw[2..32].copy_from_slice(&data[..30]);
    let mut cvt = DirEntry::parse(&raw);

    let geosname = Filename {
        name: cvt.name,
        filetype: image.filetype_of(&cvt).unwrap_or(Filetype::Del),
        record_length: 0,
    };

    let info = &data[BLOCK..2 * BLOCK];

    if !image.is_geos_dirent(&cvt) || info[..3] != [0x03, 0x15, 0xBF] {
        return Ok(Geos::NotGeos);
    }

    let is_vlir = cvt.record_length == 1;

    let len = if is_vlir {
        if data.len() < 3 * BLOCK {
            return Ok(Geos::NotGeos);
        }
        let vlir = &data[2 * BLOCK..3 * BLOCK];
        let mut len = 3 * BLOCK;

        for record in 0..127 {
            let blocks = vlir[2 * record] as usize;
            let last_block_len = vlir[2 * record + 1] as usize;

            if blocks == 0 {
                if last_block_len != 0 && last_block_len != 0xFF {
                    return Ok(Geos::NotGeos);
                }
            } else if last_block_len < 2 {
                return Ok(Geos::NotGeos);
            } else {
                len = BLOCK * (rounddiv(len, BLOCK) + blocks - 1) + last_block_len - 1;
            }
        }

        if len > data.len() {
            diag.warning(
                Some(&geosname),
                &format!("{} bytes too short file", len - data.len()),
            );
            return Ok(Geos::NotGeos);
        }
        len
    } else {
        data.len()
    };

    if (info[0x42] ^ cvt.file_type) & 0x8F != 0 {
        diag.warning(
            Some(&geosname),
            &format!("file types differ: ${:02x} ${:02x}", info[0x42], cvt.file_type),
        );
    }

    if info[0x43] != cvt.geos[0] {
        diag.warning(
            Some(&geosname),
            &format!("GEOS file types differ: ${:02x} ${:02x}", info[0x43], cvt.geos[0]),
        );
    }

    if info[0x44] != cvt.record_length {
        diag.warning(
            Some(&geosname),
            &format!("VLIR flags differ: ${:02x} ${:02x}", info[0x44], cvt.record_length),
        );
    }

    if len != data.len() {
        diag.warning(
            Some(&geosname),
            &format!("File size mismatch: {} extraneous bytes", data.len() - len),
        );
    }

    if rounddiv(len, BLOCK) - 1 != cvt.blocks as usize {
        cvt.blocks = (rounddiv(len, BLOCK) - 1) as u16;
        diag.warning(Some(&geosname), "invalid block count");
    }

    let loc = match image.get_dir_ent(&geosname) {
        Some(loc) => loc,
        None => return Err(Error::no_space()),
    };

    let mut entry = image.dirent(loc);

    if entry.file_type != 0 {
        if image.dirent_mode == super::DirEntMode::OnlyCreate {
            return Err(Error::file_exists());
        }

        // delete the old file
        if image.delete_dir_ent(loc).is_err() {
            diag.error(Some(&geosname), "Could not delete existing file.");
            return Err(invalid("could not delete existing file"));
        }
        entry = image.dirent(loc);
    }

    if image.blocks_free() < rounddiv(len, BLOCK) - 1 {
        return Err(Error::no_space());
    }

    // take over the directory entry from the Convert header
    entry.file_type = 0;
    entry.first_track = 0;
    entry.first_sector = 0;
    entry.name = cvt.name;
    entry.record_length = cvt.record_length;
    entry.geos = cvt.geos;
    entry.blocks = cvt.blocks;
    entry.ss_track = image.dir_track + 1;
    entry.ss_sector = 0;
    image.set_dirent(loc, &entry);

    // back up the old BAM
    let backup = match image.backup_bam() {
        Some(backup) => backup,
        None => {
            diag.error(Some(&geosname), "Backing up the BAM failed.");
            return Err(invalid("backing up the BAM failed"));
        }
    };

    // the info block goes first
    let (mut t, mut s) = (entry.ss_track, entry.ss_sector);
    if !image.find_next_free(&mut t, &mut s) {
        return Err(Error::no_space());
    }
    entry.ss_track = t;
    entry.ss_sector = s;
    image.set_dirent(loc, &entry);

    if let Err(e) = image.write_inode(t, s, &data[BLOCK..2 * BLOCK]) {
        image.restore_bam(&backup);
        diag.error(Some(&geosname), "Writing the info sector failed.");
        return Err(e);
    }

    if is_vlir {
        let mut vlir = [0u8; BLOCK];
        vlir.copy_from_slice(&data[2 * BLOCK..3 * BLOCK]);

        let mut src = 3 * BLOCK;
        let (mut ct, mut cs) = (entry.ss_track, entry.ss_sector);

        for record in 0..127 {
            let blocks = data[2 * BLOCK + 2 * record] as usize;
            let last_block_len = data[2 * BLOCK + 2 * record + 1] as usize;

            if blocks == 0 {
                continue;
            }

            if !image.find_next_free(&mut ct, &mut cs) {
                image.restore_bam(&backup);
                return Err(Error::no_space());
            }

            vlir[record * 2] = ct;
            vlir[record * 2 + 1] = cs;

            let chain_len = BLOCK * (blocks - 1) + last_block_len - 1;
            let chain = match data.get(src..src + chain_len) {
                Some(chain) => chain,
                None => {
                    image.restore_bam(&backup);
                    return Err(invalid("truncated VLIR record"));
                }
            };

            if let Err(e) = image.write_inode(ct, cs, chain) {
                image.restore_bam(&backup);
                diag.error(Some(&geosname), "Writing a VLIR node failed.");
                return Err(e);
            }

            src += BLOCK * blocks;
        }

        // finally the VLIR index block itself
        entry.first_track = entry.ss_track;
        entry.first_sector = entry.ss_sector;
        if !image.find_next_free(&mut entry.first_track, &mut entry.first_sector) {
            image.restore_bam(&backup);
            return Err(Error::no_space());
        }

        if let Err(e) = image.write_inode(entry.first_track, entry.first_sector, &vlir) {
            image.restore_bam(&backup);
            diag.error(Some(&geosname), "Writing the VLIR block failed.");
            return Err(e);
        }
    } else {
        entry.first_track = entry.ss_track;
        entry.first_sector = entry.ss_sector;
        if !image.find_next_free(&mut entry.first_track, &mut entry.first_sector) {
            image.restore_bam(&backup);
            return Err(Error::no_space());
        }

        if let Err(e) =
            image.write_inode(entry.first_track, entry.first_sector, &data[2 * BLOCK..])
        {
            image.restore_bam(&backup);
            diag.error(Some(&geosname), "Writing the data sectors failed.");
            return Err(e);
        }
    }

    entry.file_type = data[0];
    image.set_dirent(loc, &entry);

    Ok(Geos::Done)
}

/// Read a GEOS file off the disk and emit it in Convert form.
fn try_read_geos(
    image: &mut Image,
    loc: DirEntLoc,
    sink: &mut dyn FileSink,
    diag: &mut Diagnostics,
) -> Result<Geos, Error> {
    let geom = image.geometry();
    let mut entry = image.dirent(loc);
    let is_vlir = entry.record_length == 1;

    // the GEOS name uses the opposite letter cases
    let mut name_buf = entry.name;
    for c in name_buf.iter_mut() {
        if (b'A'..=b'Z').contains(c) {
            *c = *c - b'A' + 0xC1;
        } else if (b'a'..=b'z').contains(c) {
            *c = *c - b'a' + 0x41;
        }
    }
    let name = Filename {
        name: name_buf,
        filetype: Filetype::Prg,
        record_length: entry.record_length,
    };

    let info_offset = match image.block_offset(entry.ss_track, entry.ss_sector) {
        Some(offset) => offset,
        None => return Ok(Geos::NotGeos),
    };
    if image.buf[info_offset..info_offset + 5] != [0x00, 0xFF, 0x03, 0x15, 0xBF] {
        return Ok(Geos::NotGeos); // invalid info block
    }
    let info: Vec<u8> = image.buf[info_offset..info_offset + 256].to_vec();

    let mut vlir = Vec::new();
    let mut length;

    if is_vlir {
        let vlir_offset = match image.block_offset(entry.first_track, entry.first_sector) {
            Some(offset) => offset,
            None => return Ok(Geos::NotGeos),
        };
        vlir = image.buf[vlir_offset..vlir_offset + 256].to_vec();
        if vlir[0] != 0 || vlir[1] != 0xFF {
            return Ok(Geos::NotGeos);
        }

        // see if the VLIR block is valid and determine the length
        length = 0;
        for record in 1..128usize {
            let (vt, vs) = (vlir[2 * record], vlir[2 * record + 1]);
            if vt == 0 {
                continue;
            }
            if vt > geom.tracks || vs >= geom.sectors(vt) {
                return Ok(Geos::NotGeos);
            }
            let chain = match image.read_inode(vt, vs) {
                Some(chain) if !chain.is_empty() => chain,
                _ => return Ok(Geos::NotGeos),
            };
            length = BLOCK * rounddiv(length, BLOCK) + chain.len();
        }
    } else {
        length = match image.read_inode(entry.first_track, entry.first_sector) {
            Some(chain) if !chain.is_empty() => chain.len(),
            _ => return Ok(Geos::NotGeos),
        };
    }

    if (info[0x44] ^ entry.file_type) & 0x8F != 0 {
        diag.warning(
            Some(&name),
            &format!("file types differ: ${:02x} ${:02x}", info[0x44], entry.file_type),
        );
    }

    if info[0x45] != entry.geos[0] {
        diag.warning(
            Some(&name),
            &format!("GEOS file types differ: ${:02x} ${:02x}", info[0x45], entry.geos[0]),
        );
    }

    if info[0x46] != entry.record_length {
        diag.warning(
            Some(&name),
            &format!("VLIR flags differ: ${:02x} ${:02x}", info[0x46], entry.record_length),
        );
    }

    let expected_blocks = rounddiv(length, BLOCK) + 1 + usize::from(is_vlir);
    if expected_blocks != entry.blocks as usize {
        entry.blocks = expected_blocks as u16;
        image.set_dirent(loc, &entry);
        diag.warning(Some(&name), "invalid block count");
    }

    // assemble the Convert file: header, info block, VLIR index,
    // record chains
    let mut buf = vec![0u8; 2 * BLOCK];

    let mut raw = [0u8; 32];
    entry.store(&mut raw);
    buf[..30].copy_from_slice(&raw[2..]);
    buf[30..30 + CONVERT_HEADER.len()].copy_from_slice(CONVERT_HEADER);
    // clear the track/sector information from the header
    buf[1] = 0;
    buf[2] = 0;
    buf[0x13] = 0;
    buf[0x14] = 0;

    buf[BLOCK..2 * BLOCK].copy_from_slice(&info[2..256]);

    if is_vlir {
        buf.extend_from_slice(&vlir[2..256]);

        let mut ended = false;
        let mut was_ended = false;

        for record in 1..128usize {
            let (vt, vs) = (vlir[2 * record], vlir[2 * record + 1]);

            if vt != 0 {
                let chain = match image.read_inode(vt, vs) {
                    Some(chain) if !chain.is_empty() => chain,
                    _ => {
                        diag.error(Some(&name), "unable to read VLIR chain!");
                        break;
                    }
                };

                buf.resize(BLOCK * rounddiv(buf.len(), BLOCK), 0);
                buf.extend_from_slice(&chain);

                if ended && !was_ended {
                    diag.warning(Some(&name), "false EOF in VLIR sector");
                    was_ended = true;
                }

                // record the chain's block count and the used bytes
                // of its last block
                buf[(253 + record) * 2] = rounddiv(chain.len(), BLOCK) as u8;
                buf[(253 + record) * 2 + 1] = if chain.len() % BLOCK != 0 {
                    (chain.len() % BLOCK + 1) as u8
                } else {
                    0xFF
                };
            } else {
                match vs {
                    0 => ended = true,
                    0xFF => {
                        if ended && !was_ended {
                            diag.warning(Some(&name), "false EOF in VLIR sector");
                            was_ended = true;
                        }
                    }
                    _ => {
                        buf[(253 + record) * 2] = 0;
                        let corrected = if ended { 0 } else { 0xFF };
                        buf[(253 + record) * 2 + 1] = corrected;
                        diag.warning(
                            Some(&name),
                            &format!(
                                "invalid VLIR pointer $00{:02x}, corrected to $00{:02x}",
                                vs, corrected
                            ),
                        );
                    }
                }
            }
        }
    } else {
        let chain = image
            .read_inode(entry.first_track, entry.first_sector)
            .unwrap_or_default();
        buf.extend_from_slice(&chain);
    }

    sink.write_file(&name, &buf, diag)?;
    Ok(Geos::Done)
}

/// Write a file into a disk image in CBM DOS format
///
/// # Arguments
///
/// - `name` - native (PETSCII) name of the file
/// - `data` - the contents of the file
/// - `image` - the disk image
/// - `diag` - diagnostic output
pub fn write_image(
    name: &Filename,
    data: &[u8],
    image: &mut Image,
    diag: &mut Diagnostics,
) -> Result<(), Error> {
    // see if it is a GEOS Convert file
    if matches!(
        name.filetype,
        Filetype::Del | Filetype::Seq | Filetype::Prg | Filetype::Usr
    ) {
        match try_write_geos(image, data, diag)? {
            Geos::Done => return Ok(()),
            Geos::NotGeos => {
                if data.len() > 2 * BLOCK && data.get(33..54) == Some(&CONVERT_TAG[..]) {
                    diag.warning(Some(name), "not a valid GEOS (Convert) file");
                }
            }
        }
    }

    let loc = match image.get_dir_ent(name) {
        Some(loc) => loc,
        None => return Err(Error::no_space()),
    };

    let mut entry = image.dirent(loc);

    if entry.file_type != 0 {
        if image.dirent_mode == super::DirEntMode::OnlyCreate {
            return Err(Error::file_exists());
        }

        // delete the old file
        if image.delete_dir_ent(loc).is_err() {
            diag.error(Some(name), "Could not delete existing file.");
            return Err(invalid("could not delete existing file"));
        }
        entry = image.dirent(loc);
    }

    // check that there is enough space for the file
    let data_blocks = rounddiv(data.len(), BLOCK);
    let needed = data_blocks
        + if name.filetype == Filetype::Rel {
            rounddiv(data_blocks, SS_ENTRIES)
        } else {
            0
        };

    if image.blocks_free() < needed {
        return Err(Error::no_space());
    }

    entry.name = name.name;
    entry.first_track = image.dir_track + 1;
    entry.first_sector = 0;

    if !image.find_next_free(&mut entry.first_track, &mut entry.first_sector) {
        return Err(Error::no_space());
    }

    let mut blocks = data_blocks;
    if name.filetype == Filetype::Rel {
        entry.record_length = name.record_length;
        blocks += rounddiv(blocks, SS_ENTRIES);
    }
    entry.blocks = blocks as u16;
    image.set_dirent(loc, &entry);

    // back up the old BAM
    let backup = match image.backup_bam() {
        Some(backup) => backup,
        None => {
            diag.error(Some(name), "Backing up the BAM failed.");
            return Err(invalid("backing up the BAM failed"));
        }
    };

    if let Err(e) = image.write_inode(entry.first_track, entry.first_sector, data) {
        image.restore_bam(&backup);
        diag.error(Some(name), "Writing the data bytes failed.");
        return Err(e);
    }

    match name.filetype {
        Filetype::Rel => {
            // the side sectors start near the data
            entry.ss_track = image.dir_track + 1;
            entry.ss_sector = 0;
            image.set_dirent(loc, &entry);

            if let Err(e) = image.setup_side_sectors(loc, data_blocks, diag) {
                image.restore_bam(&backup);
                diag.error(Some(name), "Could not set up the side sectors.");
                return Err(e);
            }

            entry = image.dirent(loc);
        }
        Filetype::Del | Filetype::Seq | Filetype::Prg | Filetype::Usr => {}
        Filetype::Cbm => {
            image.restore_bam(&backup);
            diag.error(Some(name), "Unsupported file type.");
            return Err(invalid("unsupported file type"));
        }
    }

    entry.file_type = name.filetype.code();
    image.set_dirent(loc, &entry);

    debug!("wrote {} ({} blocks)", name, blocks);

    Ok(())
}

/// Read a disk image in CBM DOS format and extract all its files
///
/// # Arguments
///
/// - `data` - the disk image contents
/// - `sink` - destination for the contained files
/// - `diag` - diagnostic output
pub fn read_image(data: &[u8], sink: &mut dyn FileSink, diag: &mut Diagnostics) -> Result<(), Error> {
    let mut image = match Image::from_bytes(data) {
        Ok(image) => image,
        Err(e) => {
            diag.error(None, "Unknown disk image type");
            return Err(e);
        }
    };

    let geom = image.geometry();

    let directory = match image.map_inode(image.dir_track, 0, Some(&mut *diag), None) {
        Some(directory) => directory,
        None => {
            diag.error(
                None,
                &format!("Could not read the directory on track {}.", image.dir_track),
            );
            return Err(invalid("unreadable directory"));
        }
    };

    if directory.len() < geom.bam_blocks {
        diag.error(None, "Directory too short.");
        return Err(invalid("directory too short"));
    }

    // traverse through the directory
    let mut block = geom.bam_blocks;
    loop {
        for slot in 0..8 {
            let loc = DirEntLoc {
                block: directory[block],
                slot,
            };
            let entry = image.dirent(loc);
            let name = image.dirent_filename(&entry);

            if image.is_geos_dirent(&entry) {
                match try_read_geos(&mut image, loc, sink, diag)? {
                    Geos::Done => continue,
                    Geos::NotGeos => diag.warning(Some(&name), "not a valid GEOS file"),
                }
            }

            match image.filetype_of(&entry) {
                Some(
                    Filetype::Del | Filetype::Seq | Filetype::Prg | Filetype::Usr | Filetype::Rel,
                ) => {
                    if name.filetype == Filetype::Rel && !image.check_side_sectors(loc, diag) {
                        diag.warning(Some(&name), "error in side sector data");
                    }

                    match image.read_inode(entry.first_track, entry.first_sector) {
                        None => diag.error(Some(&name), "could not read file"),
                        Some(contents) => {
                            if name.filetype != Filetype::Rel
                                && rounddiv(contents.len(), BLOCK) != entry.blocks as usize
                            {
                                diag.warning(Some(&name), "invalid block count");
                            }

                            sink.write_file(&name, &contents, diag)?;
                        }
                    }
                }

                Some(Filetype::Cbm) => {
                    diag.error(Some(&name), "skipping partition");
                }

                None => {
                    if entry.file_type != 0 {
                        diag.error(
                            Some(&name),
                            &format!("unknown file type ${:02x}, skipping", entry.file_type),
                        );
                    }
                }
            }
        }

        if image.buf[directory[block]] == 0 || block + 1 >= directory.len() {
            break;
        }
        block += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_image, write_image, BLOCK};
    use crate::container::FileSink;
    use crate::diag::Diagnostics;
    use crate::error::Error;
    use crate::image::{DirEntMode, DiskGeometry, Image, ImageType};
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

    fn blank(image_type: ImageType) -> Image {
        let geom = DiskGeometry::get(image_type);
        let mut image = Image::from_bytes(&vec![0u8; geom.blocks * 256]).unwrap();
        image.format();
        image.dirent_mode = DirEntMode::OnlyCreate;
        image
    }

    /// The per-track free counter must equal the number of set bits
    /// in the track's bitmap.
    fn assert_bam_consistent(image: &Image) {
        let geom = image.geometry();
        for track in 1..=geom.tracks {
            let mut free = 0usize;
            for sector in 0..geom.sectors(track) {
                if image.is_free_block(track, sector) {
                    free += 1;
                }
            }

            let counter = match image.image_type {
                ImageType::Im1541 => {
                    let bam = image.block_offset(18, 0).unwrap();
                    image.buf[bam + ((track as usize) << 2)] as usize
                }
                ImageType::Im1571 => {
                    let bam = image.block_offset(18, 0).unwrap();
                    if track > 35 {
                        image.buf[bam + 0xDC + track as usize - 35] as usize
                    } else {
                        image.buf[bam + ((track as usize) << 2)] as usize
                    }
                }
                ImageType::Im1581 => {
                    let bam1 = image.block_offset(40, 1).unwrap();
                    let bam2 = image.block_offset(40, 2).unwrap();
                    if track > 40 {
                        image.buf[bam2 + 16 + (track as usize - 41) * 6] as usize
                    } else {
                        image.buf[bam1 + 16 + (track as usize - 1) * 6] as usize
                    }
                }
            };

            assert_eq!(counter, free, "track {} counter", track);
        }
    }

    #[test]
    fn write_prg_round_trip() {
        for image_type in [ImageType::Im1541, ImageType::Im1571, ImageType::Im1581] {
            let mut image = blank(image_type);
            let mut diag = Diagnostics::new();

            let name = Filename::new(b"TEST", Filetype::Prg, 0);
            write_image(&name, &[1, 2, 3], &mut image, &mut diag).expect("write failed");

            assert_bam_consistent(&image);

            let mut sink = Collector { files: Vec::new() };
            read_image(&image.buf, &mut sink, &mut diag).expect("read failed");

            assert_eq!(sink.files.len(), 1);
            assert_eq!(sink.files[0].0, name);
            assert_eq!(sink.files[0].1, vec![1, 2, 3]);

            // a three byte file is one block
            let loc = image.get_dir_ent(&name).expect("entry vanished");
            assert_eq!(image.dirent(loc).blocks, 1);
        }
    }

    #[test]
    fn large_files_span_tracks() {
        let mut image = blank(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let name = Filename::new(b"BIG", Filetype::Seq, 0);
        write_image(&name, &data, &mut image, &mut diag).expect("write failed");

        assert_bam_consistent(&image);

        let mut sink = Collector { files: Vec::new() };
        read_image(&image.buf, &mut sink, &mut diag).expect("read failed");
        assert_eq!(sink.files[0].1, data);
    }

    #[test]
    fn relative_file_with_two_side_sectors() {
        let mut image = blank(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        let data = vec![0x42u8; 200 * BLOCK];
        let name = Filename::new(b"R", Filetype::Rel, 4);
        write_image(&name, &data, &mut image, &mut diag).expect("write failed");

        let loc = image.get_dir_ent(&name).expect("entry vanished");
        let entry = image.dirent(loc);

        // 200 data blocks plus two side sectors
        assert_eq!(entry.blocks, 202);
        assert_eq!(entry.record_length, 4);

        let side = image
            .map_inode(entry.ss_track, entry.ss_sector, None, None)
            .expect("side sectors unreadable");
        assert_eq!(side.len(), 2);

        assert!(image.check_side_sectors(loc, &mut diag));
        assert_bam_consistent(&image);

        let mut sink = Collector { files: Vec::new() };
        read_image(&image.buf, &mut sink, &mut diag).expect("read failed");
        assert_eq!(sink.files[0].0, name);
        assert_eq!(sink.files[0].1, data);
    }

    #[test]
    fn rel_on_1581_fails_cleanly() {
        let mut image = blank(ImageType::Im1581);
        let mut diag = Diagnostics::new();

        let free_before = image.blocks_free();
        let name = Filename::new(b"R", Filetype::Rel, 10);
        let result = write_image(&name, &[0u8; 600], &mut image, &mut diag);

        assert!(result.is_err());
        // the BAM snapshot was restored
        assert_eq!(image.blocks_free(), free_before);
        assert_bam_consistent(&image);
    }

    #[test]
    fn out_of_space_restores_the_bam() {
        let mut image = blank(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        let name = Filename::new(b"HUGE", Filetype::Prg, 0);
        let free_before = image.blocks_free();
        // larger than the disk
        let data = vec![0u8; 700 * BLOCK];
        let err = write_image(&name, &data, &mut image, &mut diag).unwrap_err();

        assert!(err.is_no_space());
        assert_eq!(image.blocks_free(), free_before);
        assert_bam_consistent(&image);
    }

    #[test]
    fn duplicate_name_reported_when_not_overwriting() {
        let mut image = blank(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        let name = Filename::new(b"TWICE", Filetype::Prg, 0);
        write_image(&name, &[1], &mut image, &mut diag).unwrap();
        let err = write_image(&name, &[2], &mut image, &mut diag).unwrap_err();
        assert!(err.is_file_exists());

        // overwriting is allowed with find-or-create
        image.dirent_mode = DirEntMode::FindOrCreate;
        write_image(&name, &[2, 3], &mut image, &mut diag).unwrap();

        let mut sink = Collector { files: Vec::new() };
        read_image(&image.buf, &mut sink, &mut diag).unwrap();
        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].1, vec![2, 3]);
        assert_bam_consistent(&image);
    }

    #[test]
    fn directory_grows_past_one_block() {
        let mut image = blank(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        for i in 0..10u8 {
            let name = Filename::new(&[b'F', b'0' + i], Filetype::Prg, 0);
            write_image(&name, &[i], &mut image, &mut diag).expect("write failed");
        }

        let directory = image.map_inode(18, 0, None, None).unwrap();
        // BAM block plus two directory blocks
        assert_eq!(directory.len(), 3);
        assert_bam_consistent(&image);

        let mut sink = Collector { files: Vec::new() };
        read_image(&image.buf, &mut sink, &mut diag).unwrap();
        assert_eq!(sink.files.len(), 10);
    }

    #[test]
    fn geos_sequential_round_trip() {
        let mut image = blank(ImageType::Im1541);
        let mut diag = Diagnostics::new();

        // build a Convert file: directory header, info block, data
        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let mut cvt = vec![0u8; 2 * BLOCK];
        cvt[0] = 0x83; // USR
        cvt[3..11].copy_from_slice(b"GEOSAPP\xA0");
        for c in cvt[11..19].iter_mut() {
            *c = 0xA0;
        }
        cvt[21] = 0; // sequential
        cvt[22] = 7; // GEOS file type: application
        cvt[28] = (rounddiv(2 * BLOCK + payload.len(), BLOCK) - 1) as u8;
        cvt[30..59].copy_from_slice(super::CONVERT_HEADER);

        // info block
        cvt[BLOCK] = 0x03;
        cvt[BLOCK + 1] = 0x15;
        cvt[BLOCK + 2] = 0xBF;
        cvt[BLOCK + 0x42] = 0x83;
        cvt[BLOCK + 0x43] = 7;
        cvt[BLOCK + 0x44] = 0;

        cvt.extend_from_slice(&payload);

        let name = Filename::new(b"geosapp", Filetype::Usr, 0);
        write_image(&name, &cvt, &mut image, &mut diag).expect("write failed");
        assert_bam_consistent(&image);

        let mut sink = Collector { files: Vec::new() };
        read_image(&image.buf, &mut sink, &mut diag).expect("read failed");

        assert_eq!(sink.files.len(), 1);
        let (out_name, out_data) = &sink.files[0];
        assert_eq!(out_name.filetype, Filetype::Prg);
        assert_eq!(&out_data[30..59], super::CONVERT_HEADER);
        // the info block survives
        assert_eq!(out_data[BLOCK], 0x03);
        assert_eq!(out_data[BLOCK + 1], 0x15);
        assert_eq!(out_data[BLOCK + 2], 0xBF);
        // and so does the payload
        assert_eq!(&out_data[2 * BLOCK..], &payload[..]);
    }
}
