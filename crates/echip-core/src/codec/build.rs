//! Machine records to memory image

use log::debug;

use super::record::{encode_set, DirectoryPage, DirectorySlot, SLOT_OCCUPIED};
use crate::crc::stamp_crc16;
use crate::error::{Error, Result};
use crate::image::{
    self, Page, CHAIN_END, MAX_DIRECTORIES, MAX_RECORDS, SLOTS_PER_DIRECTORY, UNSET,
};
use crate::model::{MachineMap, MachinePosition};

/// Encode machine records into a complete chip image.
///
/// Models are laid out in key order, one directory slot each, and their
/// sets fill record pages from page 0 upward. Every non-empty page of the
/// result carries a valid CRC16.
pub fn build(machines: &MachineMap) -> Result<Vec<Page>> {
    let directories = machines.len();
    let records: usize = machines.values().map(|m| m.sets.len()).sum();
    if directories > MAX_DIRECTORIES || records > MAX_RECORDS {
        return Err(Error::CapacityExceeded {
            directories,
            records,
            max_directories: MAX_DIRECTORIES,
            max_records: MAX_RECORDS,
        });
    }

    let mut pages = image::blank();
    let mut record = 0;

    for (slot, (model, machine)) in machines.iter().enumerate() {
        let head = if machine.sets.is_empty() {
            CHAIN_END
        } else {
            image::record_page(record) as u8
        };

        let dir_page = image::directory_page(slot);
        let mut directory: DirectoryPage = zerocopy::transmute!(pages[dir_page]);
        directory.slots[slot % SLOTS_PER_DIRECTORY] = DirectorySlot {
            occupied: SLOT_OCCUPIED,
            model: model.0.into(),
            position: position_bytes(&machine.position),
            head,
            reserved: [UNSET; 2],
        };
        pages[dir_page] = zerocopy::transmute!(directory);

        for (index, set) in machine.sets.iter().enumerate() {
            let page = image::record_page(record);
            pages[page] = encode_set(*model, set)?;

            let (link, entry) = image::link_entry(page);
            pages[link][entry] = if index + 1 < machine.sets.len() {
                image::record_page(record + 1) as u8
            } else {
                CHAIN_END
            };
            record += 1;
        }
        debug!("Model {}: slot {}, {} sets", model, slot, machine.sets.len());
    }

    for page in pages.iter_mut().filter(|p| !image::is_empty(p)) {
        stamp_crc16(page);
    }

    Ok(pages)
}

fn position_bytes(position: &MachinePosition) -> [u8; 4] {
    [position.chest, position.rom2, position.rom1, position.seat].map(|p| p.unwrap_or(UNSET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse;
    use crate::crc::crc16_valid;
    use crate::image::{link_entry, PAGE_COUNT, PAGE_DATA_SIZE};
    use crate::model::{
        ForceUnit, FormatVersion, MachineObject, MachineSet, MachineTest, ModelId, Precision,
        TestResult, TestType,
    };
    use chrono::{TimeZone, Utc};

    fn set(version: u32, serial: &str) -> MachineSet {
        MachineSet {
            version: FormatVersion(version),
            serial: serial.to_string(),
            time: Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap(),
            resistance: 63.0,
            precision: Precision::Integer,
            units: ForceUnit::Pound,
            repetitions: 10,
            peak: Some(687),
            work: Some(1395.08),
            distance: None,
            test: None,
        }
    }

    fn machine(sets: Vec<MachineSet>) -> MachineObject {
        MachineObject {
            position: MachinePosition {
                chest: Some(4),
                rom2: None,
                rom1: None,
                seat: Some(1),
            },
            sets,
        }
    }

    #[test]
    fn test_end_to_end_single_set() {
        let mut machines = MachineMap::new();
        machines.insert(
            "2035".parse().unwrap(),
            machine(vec![set(0x4A41_5C81, "0304 2021 0506 0737")]),
        );

        let pages = build(&machines).unwrap();
        assert_eq!(pages.len(), PAGE_COUNT);

        let parsed = parse(&pages).unwrap();
        assert_eq!(parsed.len(), 1);
        let entry = &parsed[&ModelId(0x2035)];
        assert_eq!(entry.sets[0].peak, Some(687));
        assert_eq!(entry.sets[0].work, Some(1395.08));
        assert_eq!(parsed, machines);
    }

    #[test]
    fn test_every_written_page_validates() {
        let mut machines = MachineMap::new();
        let sets = (0..5).map(|_| set(0x4A41_5C81, "0304 2021 0506 0737")).collect();
        machines.insert(ModelId(0x2035), machine(sets));

        let mut pages = build(&machines).unwrap();
        for page in pages.iter().filter(|p| !image::is_empty(p)) {
            assert!(crc16_valid(page));
        }

        for offset in 0..PAGE_DATA_SIZE {
            let mut page = pages[2];
            page[offset] ^= 0x40;
            assert!(!crc16_valid(&page));
        }
        pages[2][0] ^= 0x40;
        assert!(parse(&pages).is_err());
    }

    #[test]
    fn test_chain_spans_blocks() {
        let mut machines = MachineMap::new();
        machines.insert(
            ModelId(0x1000),
            machine((0..28).map(|_| set(0x4A41_5C81, "0304 2021 0506 0737")).collect()),
        );
        machines.insert(
            ModelId(0x2000),
            machine((0..5).map(|_| set(0x4A41_5C81, "0304 2021 0506 0738")).collect()),
        );

        let pages = build(&machines).unwrap();
        // Second model starts at record 28 and continues into block 1
        assert_eq!(pages[30][10 + 7], 28);
        assert_eq!(pages[link_entry(29).0][link_entry(29).1], 32);
        assert_eq!(pages[link_entry(34).0][link_entry(34).1], CHAIN_END);

        assert_eq!(parse(&pages).unwrap(), machines);
    }

    #[test]
    fn test_model_without_sets() {
        let mut machines = MachineMap::new();
        machines.insert(ModelId(0x0101), machine(Vec::new()));
        machines.insert(
            ModelId(0x0202),
            machine(vec![set(0x4A41_5C81, "0304 2021 0506 0737")]),
        );

        let pages = build(&machines).unwrap();
        assert_eq!(pages[30][7], CHAIN_END);
        assert_eq!(pages[30][17], 0);
        assert_eq!(parse(&pages).unwrap(), machines);
    }

    #[test]
    fn test_directory_capacity() {
        let mut machines = MachineMap::new();
        for model in 0..24u16 {
            machines.insert(ModelId(model), machine(Vec::new()));
        }
        let pages = build(&machines).unwrap();
        assert_eq!(parse(&pages).unwrap().len(), 24);

        machines.insert(ModelId(24), machine(Vec::new()));
        assert!(matches!(
            build(&machines),
            Err(Error::CapacityExceeded {
                directories: 25,
                ..
            })
        ));
    }

    #[test]
    fn test_record_capacity() {
        let full: Vec<_> = (0..MAX_RECORDS)
            .map(|_| set(0x4A41_5C81, "0304 2021 0506 0737"))
            .collect();
        let mut machines = MachineMap::new();
        machines.insert(ModelId(0x2035), machine(full.clone()));
        let pages = build(&machines).unwrap();
        assert_eq!(parse(&pages).unwrap()[&ModelId(0x2035)].sets.len(), MAX_RECORDS);

        let mut over = full;
        over.push(set(0x4A41_5C81, "0304 2021 0506 0737"));
        machines.insert(ModelId(0x2035), machine(over));
        assert!(matches!(
            build(&machines),
            Err(Error::CapacityExceeded { records: 241, .. })
        ));
    }

    #[test]
    fn test_record_capacity_across_models() {
        let sets: Vec<_> = (0..10)
            .map(|_| set(0x4A41_5C81, "0304 2021 0506 0737"))
            .collect();
        let mut machines = MachineMap::new();
        for model in 0..24u16 {
            machines.insert(ModelId(0x2000 + model), machine(sets.clone()));
        }
        let pages = build(&machines).unwrap();
        let parsed = parse(&pages).unwrap();
        let records: usize = parsed.values().map(|machine| machine.sets.len()).sum();
        assert_eq!(records, MAX_RECORDS);
        // Last record page of the last block
        assert!(crc16_valid(&pages[PAGE_COUNT - 3]));

        // Two more records would start past the last page
        let mut over = sets.clone();
        over.extend(sets[..2].iter().cloned());
        machines.insert(ModelId(0x2000), machine(over));
        assert!(matches!(
            build(&machines),
            Err(Error::CapacityExceeded { records: 242, .. })
        ));
    }

    #[test]
    fn test_decimal_kilogram_distance() {
        let mut s = set(0x4A41_5C81, "0304 2021 0506 0751");
        s.resistance = 63.5;
        s.precision = Precision::Decimal;
        s.units = ForceUnit::Kilogram;
        s.distance = Some(1200);

        let mut machines = MachineMap::new();
        machines.insert(ModelId(0x3201), machine(vec![s]));

        let pages = build(&machines).unwrap();
        assert_eq!(pages[0][4..6], 635u16.to_le_bytes());
        assert_eq!(pages[0][17], 0x80 | 0x20 | 19);
        assert_eq!(parse(&pages).unwrap(), machines);
    }

    #[test]
    fn test_distance_ignored_for_other_families() {
        let mut s = set(0x4A41_5C81, "0304 2021 0506 0737");
        s.distance = Some(1200);
        let mut machines = MachineMap::new();
        machines.insert(ModelId(0x2035), machine(vec![s]));

        let parsed = parse(&build(&machines).unwrap()).unwrap();
        assert_eq!(parsed[&ModelId(0x2035)].sets[0].distance, None);
    }

    #[test]
    fn test_power_test_record() {
        let low = TestResult {
            power: 812,
            velocity: 1500,
            force: 3000,
            position: 200,
        };
        let high = TestResult {
            power: 8191,
            velocity: 2047,
            force: 4095,
            position: 4095,
        };
        let mut s = set(0x4A41_5C81, "0304 2021 0506 0737");
        s.repetitions = 6;
        s.peak = None;
        s.work = None;
        s.test = Some(MachineTest {
            test_type: TestType::Power6r,
            high: Some(high),
            low: Some(low),
        });

        let mut machines = MachineMap::new();
        machines.insert(ModelId(0x2035), machine(vec![s]));
        let pages = build(&machines).unwrap();
        assert_eq!(pages[0][6], 254);
        assert_eq!(parse(&pages).unwrap(), machines);
    }

    #[test]
    fn test_a420_test_records() {
        for (test_type, repetitions, sentinel) in
            [(TestType::A4206r, 6, 253), (TestType::A42010r, 10, 252)]
        {
            let mut s = set(0x4A41_5C81, "0304 2021 0506 0737");
            s.repetitions = repetitions;
            s.peak = None;
            s.work = None;
            s.test = Some(MachineTest {
                test_type,
                high: None,
                low: None,
            });

            let mut machines = MachineMap::new();
            machines.insert(ModelId(0x2035), machine(vec![s]));
            let pages = build(&machines).unwrap();
            assert_eq!(pages[0][6], sentinel);
            assert_eq!(pages[0][26..30], [0xFF; 4]);
            assert_eq!(parse(&pages).unwrap(), machines);
        }
    }

    #[test]
    fn test_old_format_has_no_optional_fields() {
        let mut s = set(0x2000_0000, "0304 2021 0506 0711a");
        s.peak = None;
        s.work = None;

        let mut machines = MachineMap::new();
        machines.insert(ModelId(0x2035), machine(vec![s]));
        let pages = build(&machines).unwrap();
        assert_eq!(pages[0][9..13], [0x20, 0, 0, 0]);
        assert_eq!(pages[0][17], 0x1A);
        assert_eq!(parse(&pages).unwrap(), machines);
    }

    #[test]
    fn test_invalid_serial_is_rejected() {
        let mut machines = MachineMap::new();
        machines.insert(ModelId(0x2035), machine(vec![set(0x4A41_5C81, "today")]));
        assert!(matches!(build(&machines), Err(Error::InvalidSerial(_))));
    }
}
