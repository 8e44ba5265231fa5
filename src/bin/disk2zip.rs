#![warn(missing_docs)]
#![warn(unsafe_code)]
//! Convert a 1541 disk image to four Zip-Code files
use std::process::exit;

use clap::Parser;

use cbm_convert::container::zipcode::disk_to_zip;
use cbm_convert::file::{read_file, write_file};

/// Command line arguments of the Zip-Code compressor
#[derive(Parser, Debug)]
#[clap(about = "ZipCode disk image compressor", version)]
struct Args {
    /// Use the four hexadecimal digits as the disk identifier
    #[clap(short = 'i', value_name = "NNMM")]
    id: Option<String>,
    /// The 1541 disk image to compress
    image: String,
    /// Base name for the Zip-Code files (defaults to the image name)
    output: Option<String>,
}

/// Prefix the base name of a path with `<number>!`
fn part_name(path: &str, number: char) -> String {
    let split = path
        .rfind(|c| c == '/' || c == '\\')
        .map_or(0, |i| i + 1);
    format!("{}{}!{}", &path[..split], number, &path[split..])
}

/// Decode the `-i` argument into two ID bytes
fn parse_id(arg: &str) -> Option<[u8; 2]> {
    if arg.len() != 4 || !arg.bytes().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let first = u8::from_str_radix(&arg[..2], 16).ok()?;
    let second = u8::from_str_radix(&arg[2..], 16).ok()?;
    Some([first, second])
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        exit(1);
    });

    env_logger::init();

    let id = match &args.id {
        None => [b'6', b'4'],
        Some(arg) => match parse_id(arg) {
            Some(id) => id,
            None => {
                eprintln!("disk2zip: Bad disk identifier '{}'.", arg);
                exit(1);
            }
        },
    };

    let image = match read_file(&args.image) {
        Ok(image) => image,
        Err(_) => {
            eprintln!("disk2zip: File {} not found.", args.image);
            exit(3);
        }
    };

    let parts = match disk_to_zip(&image, id) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("disk2zip: {}", e);
            exit(4);
        }
    };

    let base = args.output.as_deref().unwrap_or(&args.image);

    for (i, part) in parts.iter().enumerate() {
        let name = part_name(base, char::from(b'1' + i as u8));
        if write_file(&name, part).is_err() {
            eprintln!("disk2zip: Error in opening file {}.", name);
            exit(3);
        }
    }

    exit(0);
}
