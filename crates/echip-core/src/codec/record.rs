//! Page layouts of directory slots and record pages

use chrono::{DateTime, NaiveDateTime, Utc};
use zerocopy::byteorder::{big_endian, little_endian};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::image::{Page, SLOTS_PER_DIRECTORY};
use crate::model::{
    ForceUnit, FormatVersion, MachineSet, MachineTest, ModelId, Precision, TestResult, TestType,
};

/// Length of the timestamp part of a serial string
pub const SERIAL_PREFIX_LEN: usize = 17;
/// chrono format of the timestamp part of a serial string
pub const SERIAL_TIME_FORMAT: &str = "%m%d %Y %H%M %S";

/// Channel byte bit marking resistance stored in tenths
const DECIMAL_PRECISION: u8 = 0x80;
/// Channel number bits
const CHANNEL_MASK: u8 = 0x1F;
/// Offset added to the channel number in unit-era serial suffixes
const SERIAL_CHANNEL_BASE: u8 = 0x20;

/// Bytes of a packed test result
const PACKED_TEST_SIZE: usize = 6;

/// One directory page: three model slots followed by the page CRC
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct DirectoryPage {
    pub slots: [DirectorySlot; SLOTS_PER_DIRECTORY],
    pub crc: [u8; 2],
}

/// A model entry of a directory page
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct DirectorySlot {
    pub occupied: u8,
    pub model: little_endian::U16,
    /// chest, rom2, rom1, seat
    pub position: [u8; 4],
    /// First record page of the model's chain
    pub head: u8,
    pub reserved: [u8; 2],
}

/// Slot occupancy flag value for a used slot
pub(crate) const SLOT_OCCUPIED: u8 = 1;

/// One record page
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct RecordPage {
    pub time: little_endian::U32,
    pub resistance: little_endian::U16,
    pub repetitions: u8,
    pub model: little_endian::U16,
    pub version: big_endian::U32,
    pub serial_time: little_endian::U32,
    pub channel: u8,
    /// Measurements or packed test results
    pub extra: [u8; 12],
    pub crc: [u8; 2],
}

/// `extra` of an ordinary set
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct Measurements {
    distance: little_endian::U16,
    peak: little_endian::U16,
    /// Work × 64
    work: little_endian::U32,
    reserved: [u8; 4],
}

/// `extra` of a test set
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PackedTest {
    low: [u8; PACKED_TEST_SIZE],
    high: [u8; PACKED_TEST_SIZE],
}

fn unpack_test(p: &[u8; PACKED_TEST_SIZE]) -> TestResult {
    TestResult {
        power: u16::from(p[0]) | (u16::from(p[2] & 0x1F) << 8),
        velocity: u16::from(p[1]) | (u16::from(p[2] & 0xE0) << 3),
        force: u16::from(p[3]) | (u16::from(p[5] & 0xF0) << 4),
        position: u16::from(p[4]) | (u16::from(p[5] & 0x0F) << 8),
    }
}

fn pack_test(r: &TestResult) -> [u8; PACKED_TEST_SIZE] {
    [
        r.power as u8,
        r.velocity as u8,
        (((r.power & 0x1F00) >> 8) | ((r.velocity & 0x0700) >> 3)) as u8,
        r.force as u8,
        r.position as u8,
        (((r.position & 0x0F00) >> 8) | ((r.force & 0x0F00) >> 4)) as u8,
    ]
}

fn datetime(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
}

fn seconds(time: &DateTime<Utc>) -> Result<u32> {
    u32::try_from(time.timestamp()).map_err(|_| Error::TimeOutOfRange(time.to_rfc3339()))
}

/// Serial string of a record: timestamp followed by the channel suffix.
fn format_serial(secs: u32, channel: u8, version: FormatVersion) -> String {
    let mut serial = datetime(secs).format(SERIAL_TIME_FORMAT).to_string();
    if version.has_force_units() {
        serial.push_str(&format!("{:02}", (channel & CHANNEL_MASK) + SERIAL_CHANNEL_BASE));
    } else {
        serial.push_str(&format!("{:x}{:x}", channel >> 4, channel & CHANNEL_MASK));
    }
    serial
}

/// Split a serial string back into its timestamp and channel bits.
fn parse_serial(serial: &str, version: FormatVersion) -> Result<(u32, u8)> {
    let invalid = || Error::InvalidSerial(serial.to_string());

    let split = (serial.get(..SERIAL_PREFIX_LEN), serial.get(SERIAL_PREFIX_LEN..));
    let (prefix, suffix) = match split {
        (Some(prefix), Some(suffix)) => (prefix, suffix),
        _ => return Err(invalid()),
    };
    let time = NaiveDateTime::parse_from_str(prefix, SERIAL_TIME_FORMAT)
        .map_err(|_| invalid())?
        .and_utc();
    let secs = seconds(&time)?;

    let channel = if version.has_force_units() {
        if suffix.len() != 2 {
            return Err(invalid());
        }
        suffix
            .parse::<u8>()
            .ok()
            .and_then(|n| n.checked_sub(SERIAL_CHANNEL_BASE))
            .filter(|n| *n <= CHANNEL_MASK)
            .ok_or_else(invalid)?
    } else {
        if !(2..=3).contains(&suffix.len()) {
            return Err(invalid());
        }
        let (high, low) = suffix.split_at(1);
        let high = u8::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u8::from_str_radix(low, 16)
            .ok()
            .filter(|n| *n <= CHANNEL_MASK)
            .ok_or_else(invalid)?;
        (high << 4) | low
    };

    Ok((secs, channel))
}

/// Decode a record page into a set.
pub(crate) fn decode_set(page: &Page) -> MachineSet {
    let record: RecordPage = zerocopy::transmute!(*page);
    let version = FormatVersion(record.version.get());
    let model = ModelId(record.model.get());

    let mut set = MachineSet {
        version,
        serial: format_serial(record.serial_time.get(), record.channel, version),
        time: datetime(record.time.get()),
        resistance: f64::from(record.resistance.get()),
        precision: Precision::Integer,
        units: ForceUnit::Pound,
        repetitions: record.repetitions,
        peak: None,
        work: None,
        distance: None,
        test: None,
    };

    if version.has_force_units() {
        if record.channel & DECIMAL_PRECISION != 0 {
            set.resistance /= 10.0;
            set.precision = Precision::Decimal;
        }
        set.units = ForceUnit::from_channel(record.channel);
    }

    if !version.has_test_records() {
        return set;
    }

    if let Some(test_type) = TestType::from_sentinel(record.repetitions) {
        let packed: PackedTest = zerocopy::transmute!(record.extra);
        let (low, high) = match test_type {
            TestType::Power6r => (
                Some(unpack_test(&packed.low)),
                Some(unpack_test(&packed.high)),
            ),
            TestType::A4206r | TestType::A42010r => (None, None),
        };
        set.repetitions = test_type.repetitions();
        set.test = Some(MachineTest {
            test_type,
            high,
            low,
        });
    } else if version.has_peak_power() {
        let m: Measurements = zerocopy::transmute!(record.extra);
        set.peak = Some(m.peak.get());
        set.work = Some((f64::from(m.work.get()) / 64.0 * 100.0).round() / 100.0);
        if model.records_distance() {
            set.distance = Some(m.distance.get());
        }
    }

    set
}

/// Encode a set of the given model into a record page (CRC not yet stamped).
pub(crate) fn encode_set(model: ModelId, set: &MachineSet) -> Result<Page> {
    let (serial_time, mut channel) = parse_serial(&set.serial, set.version)?;
    if set.precision == Precision::Decimal {
        channel |= DECIMAL_PRECISION;
    }
    channel |= set.units.channel_bits();

    let resistance = match set.precision {
        Precision::Decimal => set.resistance * 10.0,
        Precision::Integer => set.resistance,
    };

    let extra = match &set.test {
        Some(test) => {
            let mut packed = PackedTest {
                low: [0x55; PACKED_TEST_SIZE],
                high: [0x55, 0x55, 0xFF, 0xFF, 0xFF, 0xFF],
            };
            if let Some(low) = &test.low {
                packed.low = pack_test(low);
            }
            if let Some(high) = &test.high {
                packed.high = pack_test(high);
            }
            zerocopy::transmute!(packed)
        }
        None => {
            let m = Measurements {
                distance: set.distance.unwrap_or(0).into(),
                peak: set.peak.unwrap_or(0).into(),
                work: ((set.work.unwrap_or(0.0) * 64.0).round() as u32).into(),
                reserved: [0xFF; 4],
            };
            zerocopy::transmute!(m)
        }
    };

    let record = RecordPage {
        time: seconds(&set.time)?.into(),
        resistance: (resistance.round() as u16).into(),
        repetitions: set
            .test
            .as_ref()
            .map_or(set.repetitions, |t| t.test_type.sentinel()),
        model: model.0.into(),
        version: set.version.0.into(),
        serial_time: serial_time.into(),
        channel,
        extra,
        crc: [0x55; 2],
    };

    Ok(zerocopy::transmute!(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT_ERA: FormatVersion = FormatVersion(0x4A41_5C81);
    const OLD_ERA: FormatVersion = FormatVersion(0x2000_0000);

    #[test]
    fn test_layout_sizes() {
        assert_eq!(core::mem::size_of::<RecordPage>(), 32);
        assert_eq!(core::mem::size_of::<DirectoryPage>(), 32);
        assert_eq!(core::mem::size_of::<DirectorySlot>(), 10);
    }

    #[test]
    fn test_pack_unpack_limits() {
        let r = TestResult {
            power: 0x1FFF,
            velocity: 0x07FF,
            force: 0x0FFF,
            position: 0x0FFF,
        };
        assert_eq!(pack_test(&r), [0xFF; 6]);
        assert_eq!(unpack_test(&[0xFF; 6]), r);

        let r = TestResult {
            power: 0x1234,
            velocity: 0x0567,
            force: 0x0ABC,
            position: 0x0DEF,
        };
        assert_eq!(unpack_test(&pack_test(&r)), r);
    }

    #[test]
    fn test_serial_unit_era() {
        // 2021-03-04 05:06:07 UTC
        let secs = 1_614_834_367;
        let serial = format_serial(secs, 0x85, UNIT_ERA);
        assert_eq!(serial, "0304 2021 0506 0737");
        assert_eq!(parse_serial(&serial, UNIT_ERA).unwrap(), (secs, 0x05));
    }

    #[test]
    fn test_serial_old_era() {
        let serial = format_serial(0, 0x3A, OLD_ERA);
        assert_eq!(serial, "0101 1970 0000 0031a");
        assert_eq!(parse_serial(&serial, OLD_ERA).unwrap(), (0, 0x3A));

        let serial = format_serial(0, 0x1A, OLD_ERA);
        assert_eq!(serial, "0101 1970 0000 0011a");
        assert_eq!(parse_serial(&serial, OLD_ERA).unwrap(), (0, 0x1A));
    }

    #[test]
    fn test_invalid_serials() {
        for serial in ["", "0304 2021 0506 07", "0304 2021 0506 0799", "1304 2021 0506 0737"] {
            assert!(matches!(
                parse_serial(serial, UNIT_ERA),
                Err(Error::InvalidSerial(_))
            ));
        }
    }
}
