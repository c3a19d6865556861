//! Per-unit calibration data for voltage limits and offsets.
//!
//! Calibration is stored per model scope as a tree of
//! `category / channel / range = value`, for example
//!
//! ```ini
//! [gain]
//! ch0\200mV=1.012
//! [offset]
//! ch1\50mV=131
//! ```
//!
//! Gain factors default to `0.0` and offsets to `255`; both mean "not
//! calibrated". Missing or unreadable entries are never fatal.

use crate::specification::{VoltageRange, GAIN_NOT_CALIBRATED, OFFSET_NOT_CALIBRATED};
use config::{Config, FileFormat, Value, ValueKind};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Failed to read calibration file {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("No home directory to look for calibration files in")]
    NoHomeDirectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationCategory {
    Gain,
    Offset,
}

impl CalibrationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationCategory::Gain => "gain",
            CalibrationCategory::Offset => "offset",
        }
    }
}

fn channel_key(channel: usize) -> String {
    format!("ch{}", channel)
}

fn entry_key(category: CalibrationCategory, channel: usize, range: VoltageRange) -> String {
    normalize_key(&format!(
        "{}{}{}",
        category.as_str(),
        channel_key(channel),
        range.as_str()
    ))
}

// Group separators are dropped: the INI reader may already have eaten the
// QSettings `\` between channel and range, and `chN` keeps keys unambiguous.
fn normalize_key(path: &str) -> String {
    path.chars()
        .filter(|c| !matches!(c, '/' | '\\' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Calibration entries of one model scope, keyed by the lowercase
/// concatenation of category, channel and range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalibrationSection {
    entries: BTreeMap<String, String>,
}

impl CalibrationSection {
    pub fn insert(
        &mut self,
        category: CalibrationCategory,
        channel: usize,
        range: VoltageRange,
        value: impl Into<String>,
    ) {
        self.entries
            .insert(entry_key(category, channel, range), value.into());
    }

    pub fn get(
        &self,
        category: CalibrationCategory,
        channel: usize,
        range: VoltageRange,
    ) -> Option<&str> {
        self.entries
            .get(&entry_key(category, channel, range))
            .map(String::as_str)
    }

    /// Gain correction for a cell, `GAIN_NOT_CALIBRATED` if absent or malformed.
    pub fn gain_factor(&self, channel: usize, range: VoltageRange) -> f64 {
        let Some(text) = self.get(CalibrationCategory::Gain, channel, range) else {
            return GAIN_NOT_CALIBRATED;
        };
        text.trim().parse().unwrap_or_else(|_| {
            log::warn!(
                "Ignoring malformed gain calibration for ch{} {}: {:?}",
                channel,
                range,
                text
            );
            GAIN_NOT_CALIBRATED
        })
    }

    /// Stored zero code for a cell, `OFFSET_NOT_CALIBRATED` if absent or malformed.
    pub fn offset(&self, channel: usize, range: VoltageRange) -> i32 {
        let Some(text) = self.get(CalibrationCategory::Offset, channel, range) else {
            return OFFSET_NOT_CALIBRATED;
        };
        text.trim().parse().unwrap_or_else(|_| {
            log::warn!(
                "Ignoring malformed offset calibration for ch{} {}: {:?}",
                channel,
                range,
                text
            );
            OFFSET_NOT_CALIBRATED
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn flatten(&mut self, prefix: &str, table: HashMap<String, Value>) {
        for (key, value) in table {
            let path = format!("{}{}", prefix, normalize_key(&key));
            match value.kind {
                ValueKind::Table(nested) => {
                    self.flatten(&path, nested.into_iter().collect());
                }
                _ => match value.into_string() {
                    Ok(text) => {
                        self.entries.insert(path, text);
                    }
                    Err(e) => log::warn!("Ignoring calibration entry {}: {}", path, e),
                },
            }
        }
    }
}

/// Where calibration sections come from.
pub trait CalibrationSource {
    /// The section for a model scope, or `None` if nothing is stored for it.
    fn section(&self, scope: &str) -> Option<CalibrationSection>;
}

/// Calibration held in memory, keyed by model scope.
#[derive(Debug, Clone, Default)]
pub struct MemoryCalibration {
    sections: HashMap<String, CalibrationSection>,
}

impl MemoryCalibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_section(mut self, scope: &str, section: CalibrationSection) -> Self {
        self.sections.insert(scope.to_string(), section);
        self
    }

    pub fn set(
        &mut self,
        scope: &str,
        category: CalibrationCategory,
        channel: usize,
        range: VoltageRange,
        value: impl Into<String>,
    ) {
        self.sections
            .entry(scope.to_string())
            .or_default()
            .insert(category, channel, range, value);
    }
}

impl CalibrationSource for MemoryCalibration {
    fn section(&self, scope: &str) -> Option<CalibrationSection> {
        self.sections.get(scope).cloned()
    }
}

/// Calibration files in a directory, one `<scope>.conf` (INI) or
/// `<scope>.toml` per model scope.
#[derive(Debug, Clone)]
pub struct FileCalibration {
    directory: PathBuf,
}

impl FileCalibration {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// `~/.config/OpenHantek`, where the calibration tools write their results.
    pub fn user_default() -> Result<Self, CalibrationError> {
        let home = dirs::home_dir().ok_or(CalibrationError::NoHomeDirectory)?;
        Ok(Self::new(home.join(".config").join("OpenHantek")))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn candidate_files(&self, scope: &str) -> [(PathBuf, FileFormat); 2] {
        [
            (self.directory.join(format!("{}.conf", scope)), FileFormat::Ini),
            (self.directory.join(format!("{}.toml", scope)), FileFormat::Toml),
        ]
    }

    /// Load the section for `scope`, `Ok(None)` if no file exists.
    pub fn load(&self, scope: &str) -> Result<Option<CalibrationSection>, CalibrationError> {
        let Some((path, format)) = self
            .candidate_files(scope)
            .into_iter()
            .find(|(path, _)| path.is_file())
        else {
            return Ok(None);
        };

        log::debug!("Reading calibration from {}", path.display());
        let map_err = |source| CalibrationError::Config {
            path: path.clone(),
            source,
        };
        let settings = Config::builder()
            .add_source(config::File::from(path.as_path()).format(format))
            .build()
            .map_err(map_err)?;
        let table = settings
            .try_deserialize::<HashMap<String, Value>>()
            .map_err(map_err)?;

        let mut section = CalibrationSection::default();
        section.flatten("", table);
        Ok(Some(section))
    }
}

impl CalibrationSource for FileCalibration {
    fn section(&self, scope: &str) -> Option<CalibrationSection> {
        match self.load(scope) {
            Ok(section) => section,
            Err(e) => {
                log::warn!("{}; using factory calibration", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn test_section_defaults_to_not_calibrated() {
        let section = CalibrationSection::default();
        assert_eq!(section.gain_factor(0, VoltageRange::MilliVolts20), 0.0);
        assert_eq!(section.offset(1, VoltageRange::MilliVolts5000), 255);
    }

    #[test]
    fn test_section_keys_are_case_insensitive() {
        let mut section = CalibrationSection::default();
        section.insert(CalibrationCategory::Gain, 1, VoltageRange::MilliVolts100, "1.5");
        assert_eq!(
            section.get(CalibrationCategory::Gain, 1, VoltageRange::MilliVolts100),
            Some("1.5")
        );
        assert_eq!(section.gain_factor(1, VoltageRange::MilliVolts100), 1.5);
        assert_eq!(section.gain_factor(0, VoltageRange::MilliVolts100), 0.0);
    }

    #[test]
    fn test_memory_source_scopes_by_model() {
        let mut source = MemoryCalibration::new();
        source.set("modelDSO6022", CalibrationCategory::Offset, 0, VoltageRange::MilliVolts20, "129");
        assert!(source.section("modelDSO6022").is_some());
        assert!(source.section("modelDSO6021").is_none());
    }

    #[test]
    fn test_file_source_reads_qsettings_ini() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "modelDSO6022.conf",
            "[gain]\nch0\\200mV=1.01\nch1\\20mV=0.98\n\n[offset]\nch0\\200mV=131\nch1\\5000mV=garbage\n",
        );

        let source = FileCalibration::new(dir.path());
        let section = source.section("modelDSO6022").unwrap();
        assert_eq!(section.gain_factor(0, VoltageRange::MilliVolts200), 1.01);
        assert_eq!(section.gain_factor(1, VoltageRange::MilliVolts20), 0.98);
        assert_eq!(section.offset(0, VoltageRange::MilliVolts200), 131);
        assert_eq!(section.offset(1, VoltageRange::MilliVolts5000), 255);
    }

    #[test]
    fn test_file_source_reads_nested_toml() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "modelDSO6022.toml",
            "[gain.ch1]\n\"500mV\" = 1.02\n\n[offset.ch0]\n\"1000mV\" = 126\n",
        );

        let section = FileCalibration::new(dir.path())
            .section("modelDSO6022")
            .unwrap();
        assert_eq!(section.gain_factor(1, VoltageRange::MilliVolts500), 1.02);
        assert_eq!(section.offset(0, VoltageRange::MilliVolts1000), 126);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileCalibration::new(dir.path());
        assert!(source.load("modelDSO6022").unwrap().is_none());
        assert!(source.section("modelDSO6022").is_none());
    }

    #[test]
    fn test_unparseable_file_falls_back_to_none() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "modelDSO6022.toml", "[gain\nthis is not toml");

        let source = FileCalibration::new(dir.path());
        assert!(source.load("modelDSO6022").is_err());
        assert!(source.section("modelDSO6022").is_none());
    }
}
