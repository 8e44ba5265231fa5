//! Conversion orchestration
//!
//! A [`Converter`] pipes one input reader into the single active
//! write sink: host files, an in-memory archive serialized at the
//! end of the run, or a disk image.  When an image sink runs out of
//! space (or hits a duplicate name, under the strictest policy) the
//! converter can close the image, derive the next image name by
//! incrementing a digit in its base name, and retry on a fresh disk.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::archive::Archive;
use crate::container::{arc, arkive, c2n, lynx, t64, FileSink};
use crate::diag::Diagnostics;
use crate::error::{invalid, Error};
use crate::file::{read_file, write_file};
use crate::host::{read_native, read_pc64, HostSink};
use crate::image::{cpm, dos, Image};
use crate::petscii::Filename;

/// The supported input container formats
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputFormat {
    /// raw host files
    Native,
    /// PC64 container files (.P00 etc.)
    Pc64,
    /// ARC/SDA archives
    Arc,
    /// Arkive archives
    Arkive,
    /// Lynx archives
    Lynx,
    /// T64 tape archives
    T64,
    /// C2N tape streams
    C2n,
    /// CBM DOS disk images
    Image,
    /// C128 CP/M disk images
    CpmImage,
}

/// Disk image changing policy
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum ChangeDisks {
    /// never change disk images
    Never,
    /// change images when out of space
    Sometimes,
    /// change images when out of space or on a duplicate file name
    Always,
}

/// The archive serialization formats
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArchiveKind {
    /// a Lynx archive
    Lynx,
    /// a C2N tape stream
    C2n,
}

/// The active write sink of a conversion run
pub enum Sink {
    /// individual host files
    Host(HostSink),
    /// an in-memory archive, written to `path` when the run finishes
    Archive {
        /// the collected files
        archive: Archive,
        /// the serialization format
        kind: ArchiveKind,
        /// host file name of the archive
        path: String,
    },
    /// a disk image
    Image {
        /// the open image
        image: Image,
        /// use the CP/M filesystem instead of CBM DOS
        cpm: bool,
    },
}

/// A conversion run: one sink plus the disk changing policy
pub struct Converter {
    /// the active write sink
    pub sink: Sink,
    /// the disk image changing policy
    pub change_disks: ChangeDisks,
}

/// Derive the next image file name by incrementing the first digit
/// found left of the extension in the base name, carrying through
/// '9' to '0'.  A non-digit stops the carry and fails.
fn next_image_name(path: &str) -> Option<String> {
    let mut bytes: Vec<u8> = path.bytes().collect();

    let start = path
        .rfind(|c| c == '/' || c == '\\')
        .map_or(0, |i| i + 1);
    let dot = bytes[start..]
        .iter()
        .position(|c| *c == b'.')
        .map_or(bytes.len(), |i| start + i);

    let mut i = dot;
    loop {
        if i == 0 {
            return None;
        }
        i -= 1;
        match bytes[i] {
            b'0'..=b'8' => {
                bytes[i] += 1;
                break;
            }
            b'9' => bytes[i] = b'0',
            _ => return None,
        }
    }

    String::from_utf8(bytes).ok()
}

impl Converter {
    /// Read one input file and feed its contents to the sink
    ///
    /// # Arguments
    ///
    /// - `path` - host system name of the input file
    /// - `format` - the container format to read it as
    /// - `diag` - diagnostic output
    pub fn convert_file(
        &mut self,
        path: &str,
        format: InputFormat,
        diag: &mut Diagnostics,
    ) -> Result<(), Error> {
        let data = read_file(path)?;
        diag.set_input(path);

        match format {
            InputFormat::Native => read_native(&data, path, self, diag),
            InputFormat::Pc64 => read_pc64(&data, path, self, diag),
            InputFormat::Arc => arc::read_arc(&data, self, diag),
            InputFormat::Arkive => arkive::read_arkive(&data, self, diag),
            InputFormat::Lynx => lynx::read_lynx(&data, self, diag),
            InputFormat::T64 => t64::read_t64(&data, self, diag),
            InputFormat::C2n => c2n::read_c2n(&data, self, diag),
            InputFormat::Image => dos::read_image(&data, self, diag),
            InputFormat::CpmImage => cpm::read_cpm_image(&data, self, diag),
        }
    }

    /// Flush the sink: write back the disk image, or serialize the
    /// collected archive.
    pub fn finish(&mut self, diag: &mut Diagnostics) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Host(_) => Ok(()),

            Sink::Image { image, .. } => match image.close() {
                Ok(()) => {
                    diag.info(None, &format!("Wrote image file \"{}\"", image.path));
                    Ok(())
                }
                Err(e) if e.is_no_space() => {
                    diag.error(
                        None,
                        &format!("Out of space while writing image file \"{}\"!", image.path),
                    );
                    Err(e)
                }
                Err(e) => {
                    diag.error(
                        None,
                        &format!("Unexpected error while writing image \"{}\"!", image.path),
                    );
                    Err(e)
                }
            },

            Sink::Archive {
                archive,
                kind,
                path,
            } => {
                let bytes = match kind {
                    ArchiveKind::Lynx => lynx::archive_lynx(archive)?,
                    ArchiveKind::C2n => c2n::archive_c2n(archive)?,
                };
                write_file(path, &bytes)?;
                diag.info(None, &format!("Wrote archive file \"{}\"", path));
                Ok(())
            }
        }
    }

    /// Close the full image, roll the file name over and retry the
    /// write once on a fresh image.
    fn change_disks_and_retry(
        &mut self,
        name: &Filename,
        data: &[u8],
        file_exists: bool,
        diag: &mut Diagnostics,
    ) -> Result<(), Error> {
        diag.warning(
            Some(name),
            if file_exists {
                "non-unique file name, changing disk images..."
            } else {
                "out of space, changing disk images..."
            },
        );

        let (image, cpm) = match &mut self.sink {
            Sink::Image { image, cpm } => (image, *cpm),
            _ => return Err(invalid("no image to change")),
        };

        match image.close() {
            Err(e) if e.is_no_space() => {
                diag.error(Some(name), "out of space");
                return Err(e);
            }
            Err(e) => {
                diag.error(Some(name), "failed");
                return Err(e);
            }
            Ok(()) => {}
        }

        diag.info(Some(name), &format!("wrote old image \"{}\"", image.path));

        let new_path = match next_image_name(&image.path) {
            Some(new_path) => new_path,
            None => {
                diag.error(Some(name), "Could not generate unique image file name");
                return Err(invalid("could not generate unique image file name"));
            }
        };

        diag.info(Some(name), &format!("Continuing to image \"{}\"...", new_path));

        *image = match Image::open(&new_path, image.image_type, image.dirent_mode) {
            Ok(new_image) => new_image,
            Err(e) => {
                diag.error(
                    Some(name),
                    &format!("failed while creating image \"{}\"", new_path),
                );
                return Err(e);
            }
        };

        let result = if cpm {
            cpm::write_cpm_image(name, data, image, diag)
        } else {
            dos::write_image(name, data, image, diag)
        };

        match &result {
            Ok(()) => diag.info(
                Some(name),
                &format!("OK, wrote {} bytes to image \"{}\"", data.len(), image.path),
            ),
            Err(e) => {
                let reason = if e.is_no_space() {
                    "out of space"
                } else if e.is_file_exists() {
                    "duplicate file name"
                } else {
                    "failed"
                };
                diag.error(
                    Some(name),
                    &format!("{} while writing to \"{}\", giving up.", reason, image.path),
                );
            }
        }

        result
    }
}

impl FileSink for Converter {
    fn write_file(
        &mut self,
        name: &Filename,
        data: &[u8],
        diag: &mut Diagnostics,
    ) -> Result<(), Error> {
        if data.is_empty() {
            diag.error(Some(name), "Not writing zero length file");
            return Err(invalid("zero length file"));
        }

        // the image result is handled after the sink borrow ends, so
        // a disk change can reopen the sink
        let image_result = match &mut self.sink {
            Sink::Host(host) => return host.write_file(name, data, diag),

            Sink::Archive { archive, path, .. } => {
                return match archive.write_file(name, data, diag) {
                    Ok(()) => {
                        diag.info(
                            Some(name),
                            &format!("Wrote {} bytes to archive \"{}\"", data.len(), path),
                        );
                        Ok(())
                    }
                    Err(e) if e.is_file_exists() => {
                        diag.error(Some(name), "non-unique file name!");
                        Err(e)
                    }
                    Err(e) if e.is_no_space() => {
                        diag.error(Some(name), "out of space!");
                        Err(e)
                    }
                    Err(e) => {
                        diag.error(Some(name), "Write failed!");
                        Err(e)
                    }
                }
            }

            Sink::Image { image, cpm } => {
                let result = if *cpm {
                    cpm::write_cpm_image(name, data, image, diag)
                } else {
                    dos::write_image(name, data, image, diag)
                };

                if result.is_ok() {
                    diag.info(
                        Some(name),
                        &format!("Wrote {} bytes to image \"{}\"", data.len(), image.path),
                    );
                }
                result
            }
        };

        match image_result {
            Ok(()) => Ok(()),
            Err(e) if e.is_file_exists() => {
                if self.change_disks < ChangeDisks::Always {
                    diag.error(Some(name), "non-unique file name!");
                    return Err(e);
                }
                self.change_disks_and_retry(name, data, true, diag)
            }
            Err(e) if e.is_no_space() => {
                if self.change_disks < ChangeDisks::Sometimes {
                    diag.error(Some(name), "out of space!");
                    return Err(e);
                }
                self.change_disks_and_retry(name, data, false, diag)
            }
            Err(e) => {
                diag.error(Some(name), "Write failed!");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{next_image_name, ChangeDisks, Converter, Sink};
    use crate::container::FileSink;
    use crate::diag::Diagnostics;
    use crate::image::{DirEntMode, Image, ImageType};
    use crate::petscii::{Filename, Filetype};
    use pretty_assertions::assert_eq;

    #[test]
    fn image_names_roll_over() {
        assert_eq!(next_image_name("disk1.d64"), Some(String::from("disk2.d64")));
        assert_eq!(next_image_name("d19.d64"), Some(String::from("d20.d64")));
        assert_eq!(next_image_name("d29.d64"), Some(String::from("d30.d64")));
        assert_eq!(
            next_image_name("dir5/disk1.d64"),
            Some(String::from("dir5/disk2.d64"))
        );
        // exactly one digit changes unless a nine carries
        assert_eq!(next_image_name("a41.d64"), Some(String::from("a42.d64")));
        // a carry that runs off the digits fails
        assert_eq!(next_image_name("disk9.d64"), None);
        assert_eq!(next_image_name("d99.d64"), None);
        // no digit in the base name fails
        assert_eq!(next_image_name("disk.d64"), None);
        assert_eq!(next_image_name("1disk.d64"), None);
    }

    #[test]
    fn disk_change_moves_to_the_next_image() {
        let dir = std::env::temp_dir().join(format!("cbm-convert-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let first = dir.join("out1.d64");
        let second = dir.join("out2.d64");

        let image = Image::open(
            first.to_str().unwrap(),
            ImageType::Im1541,
            DirEntMode::OnlyCreate,
        )
        .unwrap();

        let mut converter = Converter {
            sink: Sink::Image { image, cpm: false },
            change_disks: ChangeDisks::Sometimes,
        };
        let mut diag = Diagnostics::new();

        // two files of 400 blocks cannot share one 664 block disk
        let data = vec![0x11u8; 400 * 254];
        let name_a = Filename::new(b"A", Filetype::Prg, 0);
        let name_b = Filename::new(b"B", Filetype::Prg, 0);

        converter.write_file(&name_a, &data, &mut diag).unwrap();
        converter.write_file(&name_b, &data, &mut diag).unwrap();
        converter.finish(&mut diag).unwrap();

        assert!(first.exists());
        assert!(second.exists());

        match &converter.sink {
            Sink::Image { image, .. } => {
                assert_eq!(image.path, second.to_str().unwrap());
            }
            _ => panic!("sink changed shape"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn never_change_disks_reports_no_space() {
        let dir = std::env::temp_dir().join(format!("cbm-convert-keep-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("only1.d64");

        let image = Image::open(
            path.to_str().unwrap(),
            ImageType::Im1541,
            DirEntMode::OnlyCreate,
        )
        .unwrap();

        let mut converter = Converter {
            sink: Sink::Image { image, cpm: false },
            change_disks: ChangeDisks::Never,
        };
        let mut diag = Diagnostics::new();

        let data = vec![0x22u8; 700 * 254];
        let name = Filename::new(b"TOO BIG", Filetype::Prg, 0);
        let err = converter.write_file(&name, &data, &mut diag).unwrap_err();
        assert!(err.is_no_space());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
