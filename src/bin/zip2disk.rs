#![warn(missing_docs)]
#![warn(unsafe_code)]
//! Convert four Zip-Code files to a 1541 disk image
use std::process::exit;

use clap::Parser;

use cbm_convert::container::zipcode::zip_to_disk;
use cbm_convert::file::{read_file, write_file};

/// Command line arguments of the Zip-Code extractor
#[derive(Parser, Debug)]
#[clap(about = "ZipCode disk image extractor", version)]
struct Args {
    /// Base name of the Zip-Code files (without the `1!` prefix)
    zip: String,
    /// Name of the disk image to create (defaults to the base name
    /// with `.d64` appended)
    output: Option<String>,
}

/// Prefix the base name of a path with `<number>!`
fn part_name(path: &str, number: char) -> String {
    let split = path
        .rfind(|c| c == '/' || c == '\\')
        .map_or(0, |i| i + 1);
    format!("{}{}!{}", &path[..split], number, &path[split..])
}

fn main() {
    let args = Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        exit(1);
    });

    env_logger::init();

    let mut parts = Vec::with_capacity(4);
    for number in ['1', '2', '3', '4'] {
        let name = part_name(&args.zip, number);
        match read_file(&name) {
            Ok(part) => parts.push(part),
            Err(_) => {
                eprintln!("zip2disk: File {} not found.", name);
                exit(3);
            }
        }
    }

    let image = match zip_to_disk([&parts[0], &parts[1], &parts[2], &parts[3]]) {
        Ok(image) => image,
        Err(_) => {
            eprintln!("zip2disk: Input is corrupted.");
            exit(4);
        }
    };

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| format!("{}.d64", args.zip));

    if write_file(&output, &image).is_err() {
        eprintln!("zip2disk: Could not create {}.", output);
        exit(3);
    }

    exit(0);
}
