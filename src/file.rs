//! Functions for dealing with host files
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::{fs, result::Result};

use crate::error::Error;

/// Open up a file and read in the data
///
/// # Arguments
///
/// * `filename` - A string reference to a filename to open and read
///
/// # Returns
///   Returns all the data as a u8 vector, or an Err result if there
///   was an error reading the file.
pub fn read_file(filename: &str) -> Result<Vec<u8>, Error> {
    Ok(fs::read(filename)?)
}

/// Write a byte buffer to a host file, creating or truncating it
///
/// # Arguments
///
/// * `filename` - A string reference to a filename to create or overwrite
/// * `data` - The bytes to write
pub fn write_file(filename: &str, data: &[u8]) -> Result<(), Error> {
    Ok(fs::write(filename, data)?)
}
