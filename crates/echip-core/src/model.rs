//! Structured machine records stored on a data chip

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// All models on a chip, keyed by model id
pub type MachineMap = BTreeMap<ModelId, MachineObject>;

/// Machine model identifier, written as four hex digits (e.g. `2035`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId(pub u16);

impl ModelId {
    /// Machine family byte (high byte of the id)
    pub fn family(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Whether sets of this model carry a distance value
    pub fn records_distance(self) -> bool {
        self.family() == 0x32
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u16::from_str_radix(s, 16)
            .map(ModelId)
            .map_err(|_| Error::InvalidHex(s.to_string()))
    }
}

impl TryFrom<String> for ModelId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.to_string()
    }
}

/// Firmware format tag of a set, written as eight hex digits
///
/// Later formats add fields; the tag decides which optional fields of a
/// record page are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FormatVersion(pub u32);

impl FormatVersion {
    const TEST_RECORDS: u32 = 0x2F65_79F0;
    const FORCE_UNITS: u32 = 0x318E_4F00;
    const PEAK_POWER: u32 = 0x32BA_5C89;

    /// Repetition sentinels 252–254 mark packed test records.
    pub fn has_test_records(self) -> bool {
        self.0 > Self::TEST_RECORDS
    }

    /// The channel byte carries precision and force unit bits.
    pub fn has_force_units(self) -> bool {
        self.0 > Self::FORCE_UNITS
    }

    /// Peak power, work and distance fields are present.
    pub fn has_peak_power(self) -> bool {
        self.0 > Self::PEAK_POWER
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for FormatVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16)
            .map(FormatVersion)
            .map_err(|_| Error::InvalidHex(s.to_string()))
    }
}

impl TryFrom<String> for FormatVersion {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FormatVersion> for String {
    fn from(v: FormatVersion) -> Self {
        v.to_string()
    }
}

/// One model's stored settings and sets
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineObject {
    /// Seat and range-of-motion settings
    pub position: MachinePosition,
    /// Sets in the order they were recorded
    pub sets: Vec<MachineSet>,
}

/// Machine adjustment positions; `None` when the machine has no such setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachinePosition {
    /// Chest pad position
    pub chest: Option<u8>,
    /// Second range-of-motion limit
    pub rom2: Option<u8>,
    /// First range-of-motion limit
    pub rom1: Option<u8>,
    /// Seat position
    pub seat: Option<u8>,
}

/// Precision of the stored resistance value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Tenths
    Decimal,
    /// Whole units
    Integer,
}

/// Unit of the stored resistance value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceUnit {
    /// Pounds
    #[serde(rename = "lb")]
    Pound,
    /// Kilograms
    #[serde(rename = "kg")]
    Kilogram,
    /// Newtons
    #[serde(rename = "newton")]
    Newton,
    /// Unknown unit code
    #[serde(rename = "other")]
    Other,
}

impl ForceUnit {
    /// Decode the unit bits (5–6) of a channel byte.
    pub fn from_channel(channel: u8) -> Self {
        match channel & 0x60 {
            0x00 => ForceUnit::Pound,
            0x20 => ForceUnit::Kilogram,
            0x40 => ForceUnit::Newton,
            _ => ForceUnit::Other,
        }
    }

    /// Unit bits (5–6) of a channel byte.
    pub fn channel_bits(self) -> u8 {
        match self {
            ForceUnit::Pound => 0x00,
            ForceUnit::Kilogram => 0x20,
            ForceUnit::Newton => 0x40,
            ForceUnit::Other => 0x60,
        }
    }
}

/// Kind of strength test a set recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    /// Six-repetition power test with packed high/low results
    Power6r,
    /// Six-repetition A420 test
    A4206r,
    /// Ten-repetition A420 test
    A42010r,
}

impl TestType {
    /// Decode a repetition sentinel byte.
    pub fn from_sentinel(repetitions: u8) -> Option<Self> {
        match repetitions {
            254 => Some(TestType::Power6r),
            253 => Some(TestType::A4206r),
            252 => Some(TestType::A42010r),
            _ => None,
        }
    }

    /// Repetition byte stored in place of the count.
    pub fn sentinel(self) -> u8 {
        match self {
            TestType::Power6r => 254,
            TestType::A4206r => 253,
            TestType::A42010r => 252,
        }
    }

    /// Repetitions the test consists of.
    pub fn repetitions(self) -> u8 {
        match self {
            TestType::Power6r | TestType::A4206r => 6,
            TestType::A42010r => 10,
        }
    }
}

/// Result of a strength test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineTest {
    /// Which test was run
    #[serde(rename = "type")]
    pub test_type: TestType,
    /// Best repetition
    pub high: Option<TestResult>,
    /// Weakest repetition
    pub low: Option<TestResult>,
}

/// One packed test measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestResult {
    /// Power (13 bits)
    pub power: u16,
    /// Velocity (11 bits)
    pub velocity: u16,
    /// Force (12 bits)
    pub force: u16,
    /// Position (12 bits)
    pub position: u16,
}

/// One recorded exercise set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSet {
    /// Console firmware format tag
    pub version: FormatVersion,
    /// Console serial: `MMDD YYYY HHMM SS` plus channel suffix
    pub serial: String,
    /// When the set was performed
    pub time: DateTime<Utc>,
    /// Resistance in `units`
    pub resistance: f64,
    /// Resistance precision
    pub precision: Precision,
    /// Resistance unit
    pub units: ForceUnit,
    /// Completed repetitions
    pub repetitions: u8,
    /// Peak power
    pub peak: Option<u16>,
    /// Work performed
    pub work: Option<f64>,
    /// Distance travelled (0x32xx models only)
    pub distance: Option<u16>,
    /// Test result, when the set was a test
    pub test: Option<MachineTest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_text() {
        let id: ModelId = "2035".parse().unwrap();
        assert_eq!(id, ModelId(0x2035));
        assert_eq!(id.to_string(), "2035");
        assert_eq!(ModelId(0x0a1f).to_string(), "0A1F");
        assert!("xyz".parse::<ModelId>().is_err());
    }

    #[test]
    fn test_version_thresholds() {
        let v: FormatVersion = "4A415C81".parse().unwrap();
        assert!(v.has_test_records() && v.has_force_units() && v.has_peak_power());

        let old = FormatVersion(0x2F65_79F0);
        assert!(!old.has_test_records());

        let mid = FormatVersion(0x3000_0000);
        assert!(mid.has_test_records());
        assert!(!mid.has_force_units());
    }

    #[test]
    fn test_force_unit_bits() {
        for unit in [
            ForceUnit::Pound,
            ForceUnit::Kilogram,
            ForceUnit::Newton,
            ForceUnit::Other,
        ] {
            assert_eq!(ForceUnit::from_channel(unit.channel_bits() | 0x9F), unit);
        }
    }

    #[test]
    fn test_machine_map_json_keys() {
        let mut map = MachineMap::new();
        map.insert(ModelId(0x2035), MachineObject::default());
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.starts_with("{\"2035\":"));
        let back: MachineMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
