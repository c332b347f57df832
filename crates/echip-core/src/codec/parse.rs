//! Memory image to machine records

use log::{debug, trace};

use super::record::{decode_set, DirectoryPage, DirectorySlot, SLOT_OCCUPIED};
use crate::error::{Error, Result};
use crate::image::{self, Page, BLOCK_PAGES, CHAIN_WALK_LIMIT, DIRECTORY_OFFSET, PAGE_COUNT, UNSET};
use crate::model::{MachineMap, MachineObject, MachinePosition, MachineSet, ModelId};

/// Decode a chip image into its machine records.
///
/// Fails with an invalid-structure error when the image is not 256 pages,
/// when any non-empty page fails its CRC16 check, or when a record chain
/// does not terminate.
pub fn parse(pages: &[Page]) -> Result<MachineMap> {
    if pages.len() != PAGE_COUNT {
        return Err(Error::PageCount {
            expected: PAGE_COUNT,
            found: pages.len(),
        });
    }
    if let Some(page) = image::first_corrupt_page(pages) {
        return Err(Error::Checksum { page });
    }

    let mut machines = MachineMap::new();
    for block in 0..PAGE_COUNT / BLOCK_PAGES {
        let directory: DirectoryPage =
            zerocopy::transmute!(pages[block * BLOCK_PAGES + DIRECTORY_OFFSET]);
        for slot in directory.slots.iter().filter(|s| s.occupied == SLOT_OCCUPIED) {
            let model = ModelId(slot.model.get());
            let sets = walk_chain(pages, model, slot.head)?;
            debug!("Model {}: {} sets", model, sets.len());
            machines.insert(
                model,
                MachineObject {
                    position: position(slot),
                    sets,
                },
            );
        }
    }

    Ok(machines)
}

fn position(slot: &DirectorySlot) -> MachinePosition {
    let value = |b: u8| (b != UNSET).then_some(b);
    let [chest, rom2, rom1, seat] = slot.position;
    MachinePosition {
        chest: value(chest),
        rom2: value(rom2),
        rom1: value(rom1),
        seat: value(seat),
    }
}

/// Follow a record chain from its head pointer.
fn walk_chain(pages: &[Page], model: ModelId, head: u8) -> Result<Vec<MachineSet>> {
    let mut sets = Vec::new();
    let mut page = head;

    while !image::is_chain_end(page) {
        if sets.len() == CHAIN_WALK_LIMIT {
            return Err(Error::RecordChain {
                model: model.to_string(),
            });
        }
        trace!("Model {}: record page {}", model, page);
        sets.push(decode_set(&pages[page as usize]));

        let (link, entry) = image::link_entry(page as usize);
        page = pages[link][entry];
    }

    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::stamp_crc16;
    use crate::image::{blank, link_entry, LINK_OFFSET};

    fn stamped(mut pages: Vec<Page>) -> Vec<Page> {
        for page in pages.iter_mut().filter(|p| !image::is_empty(p)) {
            stamp_crc16(page);
        }
        pages
    }

    #[test]
    fn test_erased_chip_is_empty() {
        let pages = vec![[0x55; 32]; PAGE_COUNT];
        assert!(parse(&pages).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_page_count() {
        let pages = vec![[0x55; 32]; 255];
        let err = parse(&pages).unwrap_err();
        assert!(err.is_invalid_structure());
        assert!(matches!(err, Error::PageCount { found: 255, .. }));
    }

    #[test]
    fn test_bad_crc_reports_page() {
        let mut pages = stamped(blank());
        pages[62][4] ^= 0x01;
        assert_eq!(parse(&pages), Err(Error::Checksum { page: 62 }));
    }

    #[test]
    fn test_position_sentinels() {
        let mut pages = blank();
        pages[30][..8].copy_from_slice(&[1, 0x35, 0x20, 0xFF, 0x00, 7, 0xFF, 0xFE]);
        let machines = parse(&stamped(pages)).unwrap();

        let machine = &machines[&ModelId(0x2035)];
        assert_eq!(
            machine.position,
            MachinePosition {
                chest: None,
                rom2: Some(0),
                rom1: Some(7),
                seat: None,
            }
        );
        assert!(machine.sets.is_empty());
    }

    #[test]
    fn test_cyclic_chain_is_rejected() {
        let mut pages = blank();
        pages[30][..8].copy_from_slice(&[1, 0x35, 0x20, 1, 2, 3, 4, 0]);
        pages[0] = [0u8; 32];
        let (link, entry) = link_entry(0);
        assert_eq!(link, LINK_OFFSET);
        pages[link][entry] = 0;

        let err = parse(&stamped(pages)).unwrap_err();
        assert_eq!(
            err,
            Error::RecordChain {
                model: "2035".into()
            }
        );
    }
}
