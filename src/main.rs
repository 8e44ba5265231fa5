#![warn(missing_docs)]
#![warn(unsafe_code)]
//! Commodore file format converter
//!
//! Reads files from any supported container (archives, tape images,
//! disk images, host files) and writes them to exactly one sink:
//! host files, a Lynx or C2N archive, or a disk image.
use std::process::exit;

use clap::Parser;
use log::LevelFilter;

use cbm_convert::archive::Archive;
use cbm_convert::config::load_settings;
use cbm_convert::convert::{ArchiveKind, ChangeDisks, Converter, InputFormat, Sink};
use cbm_convert::diag::Diagnostics;
use cbm_convert::error::ErrorKind;
use cbm_convert::host::{HostFormat, HostSink};
use cbm_convert::image::{DirEntMode, Image, ImageType};

/// Command line arguments of the converter
#[derive(Parser, Debug)]
#[clap(about = "Commodore archive converter", version)]
struct Args {
    /// Input files are in native (raw) format
    #[clap(short = 'n', group = "input")]
    native: bool,
    /// Input files are in PC64 format (.P00, .S00 etc.)
    #[clap(short = 'p', group = "input")]
    pc64: bool,
    /// Input files are in ARC/SDA format
    #[clap(short = 'a', group = "input")]
    arc: bool,
    /// Input files are in Arkive format
    #[clap(short = 'k', group = "input")]
    arkive: bool,
    /// Input files are in Lynx format
    #[clap(short = 'l', group = "input")]
    lynx: bool,
    /// Input files are in T64 format
    #[clap(short = 't', group = "input")]
    t64: bool,
    /// Input files are in Commodore C2N tape format
    #[clap(short = 'c', group = "input")]
    c2n: bool,
    /// Input files are disk images
    #[clap(short = 'd', group = "input")]
    disk: bool,
    /// Input files are C128 CP/M disk images
    #[clap(short = 'm', group = "input")]
    cpm: bool,

    /// Create ISO 9660 compliant file names
    #[clap(short = 'I', group = "output")]
    iso9660: bool,
    /// Output files in PC64 format
    #[clap(short = 'P', group = "output")]
    pc64_output: bool,
    /// Output files in native format
    #[clap(short = 'N', group = "output")]
    native_output: bool,
    /// Output files to a Lynx archive
    #[clap(short = 'L', group = "output", value_name = "ARCHIVE")]
    lynx_output: Option<String>,
    /// Output files to a Commodore C2N archive
    #[clap(short = 'C', group = "output", value_name = "ARCHIVE")]
    c2n_output: Option<String>,
    /// Write to a disk image: drive type 4 (1541), 7 (1571) or
    /// 8 (1581), with `o` appended to overwrite existing files
    #[clap(short = 'D', group = "output", num_args = 2, value_names = ["TYPE", "IMAGE"])]
    image_output: Option<Vec<String>>,
    /// Write to a CP/M disk image (drive types as for -D)
    #[clap(short = 'M', group = "output", num_args = 2, value_names = ["TYPE", "IMAGE"])]
    cpm_output: Option<Vec<String>>,

    /// Verbosity: 0 errors only, 1 adds warnings, 2 everything
    #[clap(short = 'v', value_name = "LEVEL")]
    verbose: Option<u8>,
    /// Disk change policy: 0 never, 1 when out of space, 2 also on
    /// duplicate file names
    #[clap(short = 'i', value_name = "POLICY")]
    change_disks: Option<u8>,

    /// The files to convert
    #[clap(required = true)]
    files: Vec<String>,
}

/// Decode a `-D`/`-M` drive type specifier like `4`, `7o` or `8`
fn drive_spec(spec: &str) -> Option<(ImageType, DirEntMode)> {
    let mut chars = spec.chars();

    let image_type = match chars.next()? {
        '4' => ImageType::Im1541,
        '7' => ImageType::Im1571,
        '8' => ImageType::Im1581,
        _ => return None,
    };

    let mode = match chars.next() {
        None => DirEntMode::OnlyCreate,
        Some('o') => DirEntMode::FindOrCreate,
        Some(_) => return None,
    };

    if chars.next().is_some() {
        return None;
    }

    Some((image_type, mode))
}

/// Open the image sink named by a `-D` or `-M` option
fn open_image_sink(values: &[String], cpm: bool) -> Result<Sink, String> {
    let (image_type, mode) = drive_spec(&values[0])
        .ok_or_else(|| format!("Bad drive type '{}'", values[0]))?;

    match Image::open(&values[1], image_type, mode) {
        Ok(image) => Ok(Sink::Image { image, cpm }),
        Err(_) => Err(format!(
            "Could not open the {}{} image '{}'.",
            if cpm { "CP/M " } else { "" },
            image_type,
            values[1]
        )),
    }
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        exit(1);
    });

    cbm_convert::init();

    // defaults may come from the settings file or the environment
    let settings = load_settings("config/cbm-convert").ok();
    let setting = |key: &str| -> Option<u8> {
        settings
            .as_ref()
            .and_then(|s| s.get_int(key).ok())
            .and_then(|v| u8::try_from(v).ok())
    };

    let verbosity = args.verbose.or_else(|| setting("verbosity")).unwrap_or(1);
    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        _ => LevelFilter::Info,
    };

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    builder.format_timestamp(None);
    if builder.try_init().is_err() {
        eprintln!("couldn't initialize logger");
    }

    let change_disks = match args
        .change_disks
        .or_else(|| setting("change-disks"))
        .unwrap_or(1)
    {
        0 => ChangeDisks::Never,
        1 => ChangeDisks::Sometimes,
        _ => ChangeDisks::Always,
    };

    let input_format = if args.pc64 {
        InputFormat::Pc64
    } else if args.arc {
        InputFormat::Arc
    } else if args.arkive {
        InputFormat::Arkive
    } else if args.lynx {
        InputFormat::Lynx
    } else if args.t64 {
        InputFormat::T64
    } else if args.c2n {
        InputFormat::C2n
    } else if args.disk {
        InputFormat::Image
    } else if args.cpm {
        InputFormat::CpmImage
    } else {
        let _ = args.native;
        InputFormat::Native
    };

    let sink = if let Some(values) = &args.image_output {
        match open_image_sink(values, false) {
            Ok(sink) => sink,
            Err(message) => {
                eprintln!("{}", message);
                exit(2);
            }
        }
    } else if let Some(values) = &args.cpm_output {
        match open_image_sink(values, true) {
            Ok(sink) => sink,
            Err(message) => {
                eprintln!("{}", message);
                exit(2);
            }
        }
    } else if let Some(path) = &args.lynx_output {
        Sink::Archive {
            archive: Archive::new(),
            kind: ArchiveKind::Lynx,
            path: path.clone(),
        }
    } else if let Some(path) = &args.c2n_output {
        Sink::Archive {
            archive: Archive::new(),
            kind: ArchiveKind::C2n,
            path: path.clone(),
        }
    } else if args.iso9660 {
        Sink::Host(HostSink {
            format: HostFormat::Iso9660,
        })
    } else if args.pc64_output {
        Sink::Host(HostSink {
            format: HostFormat::Pc64,
        })
    } else {
        let _ = args.native_output;
        Sink::Host(HostSink {
            format: HostFormat::Native,
        })
    };

    let is_host = matches!(sink, Sink::Host(_));
    let mut converter = Converter { sink, change_disks };
    let mut diag = Diagnostics::new();
    let mut retval = 0;

    // process the files
    for path in &args.files {
        match converter.convert_file(path, input_format, &mut diag) {
            Ok(()) => diag.info(None, "Archive extracted."),

            Err(e) if matches!(e.kind(), ErrorKind::Io(_)) => {
                eprintln!("'{}': {}", path, e);
                retval = 2;
            }

            Err(e) if e.is_no_space() => {
                diag.error(None, "out of space.");
                if is_host {
                    exit(3);
                }
                break;
            }

            Err(_) => {
                diag.error(None, "unexpected error.");
                retval = 4;
                if is_host {
                    exit(retval);
                }
                break;
            }
        }
    }

    match converter.finish(&mut diag) {
        Ok(()) => {}
        Err(e) if e.is_no_space() => exit(3),
        Err(_) => exit(4),
    }

    exit(retval);
}
