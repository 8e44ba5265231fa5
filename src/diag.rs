//! Diagnostic output for conversion runs
//!
//! Messages go through the `log` facade.  Each message may carry the
//! Commodore file name it concerns; the name is printed only when it
//! differs from the previous message's name, and the host input path
//! is printed once per input file.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use log::{error, info, warn};

use crate::petscii::Filename;

/// Diagnostic context for one conversion run
#[derive(Default)]
pub struct Diagnostics {
    /// Host path of the input file being processed
    input: Option<String>,
    /// Whether the input path has been printed yet
    announced: bool,
    /// The file name of the previous message
    last_name: Option<Filename>,
}

impl Diagnostics {
    /// Create a fresh diagnostic context
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    /// Start processing a new input file.  The path will be prefixed
    /// to the next message, once.
    pub fn set_input(&mut self, path: &str) {
        self.input = Some(path.to_string());
        self.announced = false;
        self.last_name = None;
    }

    fn prefix(&mut self, name: Option<&Filename>) -> String {
        let mut prefix = String::new();

        if !self.announced {
            if let Some(input) = &self.input {
                prefix.push_str(&format!("`{}': ", input));
            }
            self.announced = true;
        }

        if let Some(name) = name {
            if self.last_name.as_ref() != Some(name) {
                prefix.push_str(&format!("`{}': ", name));
                self.last_name = Some(*name);
            }
        }

        prefix
    }

    /// Report an error
    pub fn error(&mut self, name: Option<&Filename>, message: &str) {
        error!("{}{}", self.prefix(name), message);
    }

    /// Report a warning
    pub fn warning(&mut self, name: Option<&Filename>, message: &str) {
        warn!("{}{}", self.prefix(name), message);
    }

    /// Report an informational message
    pub fn info(&mut self, name: Option<&Filename>, message: &str) {
        info!("{}{}", self.prefix(name), message);
    }
}

#[cfg(test)]
mod tests {
    use super::Diagnostics;
    use crate::petscii::{Filename, Filetype};

    #[test]
    fn name_prefix_deduplicates() {
        let mut diag = Diagnostics::new();
        diag.set_input("test.lnx");
        let name = Filename::new(b"A", Filetype::Prg, 0);

        let first = diag.prefix(Some(&name));
        assert_eq!(first, "`test.lnx': `a,prg': ");
        let second = diag.prefix(Some(&name));
        assert_eq!(second, "");

        let other = Filename::new(b"B", Filetype::Prg, 0);
        let third = diag.prefix(Some(&other));
        assert_eq!(third, "`b,prg': ");
    }

    #[test]
    fn input_announced_once() {
        let mut diag = Diagnostics::new();
        diag.set_input("image.d64");
        assert_eq!(diag.prefix(None), "`image.d64': ");
        assert_eq!(diag.prefix(None), "");
        diag.set_input("next.d64");
        assert_eq!(diag.prefix(None), "`next.d64': ");
    }
}
