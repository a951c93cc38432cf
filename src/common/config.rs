//! Allows configuration stuff to be read from settings.json
//!
//! Values in the settings file override the defaults handed to [`Config::build`].
//! A missing or unparseable file is not an error, the defaults are used.
use json::JsonValue;
use log::{debug, info, warn};
use regex::Regex;
use std::{
    error::Error,
    fmt,
    fs::File,
    io::{ErrorKind, Write},
};

#[derive(Debug)]
pub struct MissingConfigError {
    key: String,
}

impl fmt::Display for MissingConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Required configuration value '{}' is missing", self.key)
    }
}

impl Error for MissingConfigError {}

pub struct Config {
    filename: String,
    settings: JsonValue,
    defaults: JsonValue,
}

impl Config {
    pub fn build(filename: String, defaults: JsonValue) -> Result<Config, std::io::Error> {
        // Validate filename only contains valid characters and ends in .json
        let filename_regex = Regex::new(r"^[a-zA-Z0-9_\-\.]+\.json$")
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e.to_string()))?;
        if !filename_regex.is_match(&filename) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Invalid filename '{}' - must contain only letters, numbers, underscore, dash, dot and end in .json",
                    filename
                ),
            ));
        }

        let mut config = Config {
            filename,
            settings: json::object! {},
            defaults,
        };

        if let Err(err) = config.load_from_file() {
            warn!("Using default settings: {}", err);
        }

        Ok(config)
    }

    pub fn get_filename(&self) -> &str {
        &self.filename
    }

    fn load_from_file(&mut self) -> std::io::Result<()> {
        let raw_data = std::fs::read_to_string(&self.filename)?;
        match json::parse(&raw_data) {
            Ok(parsed) => {
                self.settings = parsed;
                info!(
                    "Loaded settings from {}: {}",
                    self.filename,
                    self.settings.pretty(2)
                );
            }
            Err(err) => {
                warn!("Failed to parse config file {}: {}", self.filename, err);
            }
        }
        Ok(())
    }

    fn lookup<T>(
        &self,
        key: &str,
        default: Option<T>,
        read: impl Fn(&JsonValue) -> Option<T>,
    ) -> Result<T, MissingConfigError> {
        // settings file wins, then the explicit default, then the config defaults
        if let Some(val) = read(&self.settings[key]) {
            return Ok(val);
        }
        if let Some(def) = default {
            return Ok(def);
        }
        if let Some(val) = read(&self.defaults[key]) {
            return Ok(val);
        }
        Err(MissingConfigError {
            key: key.to_string(),
        })
    }

    pub fn get_str_value(
        &self,
        key: &str,
        default: Option<String>,
    ) -> Result<String, MissingConfigError> {
        self.lookup(key, default, |v| v.as_str().map(String::from))
    }

    pub fn get_bool_value(&self, key: &str, default: Option<bool>) -> Result<bool, MissingConfigError> {
        self.lookup(key, default, |v| v.as_bool())
    }

    pub fn get_u32_value(&self, key: &str, default: Option<u32>) -> Result<u32, MissingConfigError> {
        self.lookup(key, default, |v| v.as_u32())
    }

    pub fn get_f64_value(&self, key: &str, default: Option<f64>) -> Result<f64, MissingConfigError> {
        self.lookup(key, default, |v| v.as_f64())
    }

    pub fn set_value(&mut self, key: &str, val: impl Into<JsonValue>) -> Result<(), String> {
        let json_val = val.into();
        match json_val {
            JsonValue::Short(_)
            | JsonValue::String(_)
            | JsonValue::Boolean(_)
            | JsonValue::Number(_) => {
                self.settings[key] = json_val;
                Ok(())
            }
            _ => Err(format!("Unsupported value type for key: {}", key)),
        }
    }

    pub fn dump(&self) {
        debug!("config dump: {}", self.settings.pretty(2));
    }

    pub fn save_settings(&self) -> std::io::Result<bool> {
        let file_open_result = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.filename.as_str());
        match file_open_result {
            Ok(mut f) => self.flush_to_file(&mut f),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                // no file, create one
                let mut f = File::create(self.filename.as_str())?;
                self.flush_to_file(&mut f)
            }
            Err(error) => Err(error),
        }
    }

    fn flush_to_file(&self, f: &mut File) -> std::io::Result<bool> {
        f.write_all(self.settings.pretty(2).as_bytes())?;
        f.sync_all()?;
        Ok(true)
    }
}
