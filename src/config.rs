//! Configuration for the cbm-convert crate
#![warn(missing_docs)]
#![warn(unsafe_code)]

/// Build the settings for a run, merging an optional TOML settings
/// file and `CBM_CONVERT_`-prefixed environment variables.
///
/// Settings that the binaries look up: `verbosity` (0, 1 or 2) and
/// `change-disks` (0, 1 or 2).  Missing files are not an error; the
/// defaults are applied by the caller.
pub fn load_settings(config_name: &str) -> Result<config::Config, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(config_name).required(false))
        .add_source(config::Environment::with_prefix("CBM_CONVERT"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::load_settings;

    #[test]
    fn missing_settings_file_is_not_an_error() {
        let settings = load_settings("config/no-such-settings-file")
            .expect("Error loading cbm-convert settings");
        assert!(settings.get_int("verbosity").is_err());
    }
}
