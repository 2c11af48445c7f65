// src/configfile.rs
// Section/key configuration store with typed getters. Sections are
// populated programmatically (tests, host frontends) or parsed from a
// simple `[section]` / `key = value` text format.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingOption { section: String, option: String },
    InvalidValue { section: String, option: String, value: String },
    OutOfRange { section: String, option: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingOption { section, option } => {
                write!(f, "Option '{}' in section [{}] is not specified", option, section)
            }
            ConfigError::InvalidValue { section, option, value } => {
                write!(f, "Invalid value '{}' for option '{}' in section [{}]", value, option, section)
            }
            ConfigError::OutOfRange { section, option, value } => {
                write!(f, "Value '{}' for option '{}' in section [{}] is out of range", value, option, section)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Configfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `[section]` / `key = value` format. Lines starting
    /// with `#` or `;` are comments.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        let mut current = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_string();
                config.add_section(&current);
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                config.set(&current, key.trim(), value.trim());
            }
        }
        Ok(config)
    }

    pub fn add_section(&mut self, name: &str) {
        self.sections.entry(name.to_string()).or_default();
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value.to_string());
    }

    fn raw(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(option))
            .map(|s| s.as_str())
    }

    pub fn get(
        &self,
        section: &str,
        option: &str,
        default: Option<&str>,
    ) -> Result<String, ConfigError> {
        match self.raw(section, option) {
            Some(v) => Ok(v.to_string()),
            None => default.map(|d| d.to_string()).ok_or(ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            }),
        }
    }

    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f32>,
        minval: Option<f32>,
        maxval: Option<f32>,
    ) -> Result<f32, ConfigError> {
        let value = match self.raw(section, option) {
            Some(v) => v.parse::<f32>().map_err(|_| ConfigError::InvalidValue {
                section: section.to_string(),
                option: option.to_string(),
                value: v.to_string(),
            })?,
            None => default.ok_or(ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })?,
        };
        if minval.map_or(false, |m| value < m) || maxval.map_or(false, |m| value > m) {
            return Err(ConfigError::OutOfRange {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
            });
        }
        Ok(value)
    }

    pub fn getint(
        &self,
        section: &str,
        option: &str,
        default: Option<i32>,
        minval: Option<i32>,
        maxval: Option<i32>,
    ) -> Result<i32, ConfigError> {
        let value = match self.raw(section, option) {
            Some(v) => v.parse::<i32>().map_err(|_| ConfigError::InvalidValue {
                section: section.to_string(),
                option: option.to_string(),
                value: v.to_string(),
            })?,
            None => default.ok_or(ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })?,
        };
        if minval.map_or(false, |m| value < m) || maxval.map_or(false, |m| value > m) {
            return Err(ConfigError::OutOfRange {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
            });
        }
        Ok(value)
    }

    pub fn getboolean(
        &self,
        section: &str,
        option: &str,
        default: Option<bool>,
    ) -> Result<bool, ConfigError> {
        match self.raw(section, option) {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    section: section.to_string(),
                    option: option.to_string(),
                    value: v.to_string(),
                }),
            },
            None => default.ok_or(ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configfile {
        let mut cf = Configfile::new();
        cf.add_section("zprobe");
        cf.set("zprobe", "enable", "true");
        cf.set("zprobe", "slow_feedrate", "5");
        cf.set("zprobe", "debounce_count", "3");
        cf
    }

    #[test]
    fn test_get_with_default() {
        let cf = sample();
        assert_eq!(cf.get("zprobe", "probe_pin", Some("nc")).unwrap(), "nc");
        assert_eq!(cf.get("zprobe", "enable", None).unwrap(), "true");
        assert!(cf.get("zprobe", "missing", None).is_err());
    }

    #[test]
    fn test_getfloat_ranges() {
        let cf = sample();
        assert_eq!(cf.getfloat("zprobe", "slow_feedrate", None, Some(0.0), None).unwrap(), 5.0);
        assert!(matches!(
            cf.getfloat("zprobe", "slow_feedrate", None, Some(10.0), None),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert_eq!(cf.getfloat("zprobe", "fast_feedrate", Some(100.0), None, None).unwrap(), 100.0);
    }

    #[test]
    fn test_getint_and_bool() {
        let cf = sample();
        assert_eq!(cf.getint("zprobe", "debounce_count", Some(0), Some(0), None).unwrap(), 3);
        assert!(cf.getboolean("zprobe", "enable", Some(false)).unwrap());
        assert!(!cf.getboolean("zprobe", "reverse_z", Some(false)).unwrap());
    }

    #[test]
    fn test_parse_text() {
        let cf = Configfile::parse(
            "# comment\n[zprobe]\nenable = true\nprobe_height = 5.0\n\n[endstops]\ngamma_max = 300\n",
        )
        .unwrap();
        assert!(cf.has_section("endstops"));
        assert_eq!(cf.getfloat("endstops", "gamma_max", None, None, None).unwrap(), 300.0);
        assert_eq!(cf.getfloat("zprobe", "probe_height", None, None, None).unwrap(), 5.0);
    }

    #[test]
    fn test_invalid_value_reported() {
        let mut cf = sample();
        cf.set("zprobe", "probe_height", "tall");
        let err = cf.getfloat("zprobe", "probe_height", None, None, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("probe_height"));
    }
}
