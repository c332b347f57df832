//! Memory image layout
//!
//! A data chip holds 8 KiB, seen as 256 pages of 32 bytes. The pages are
//! grouped in 8 blocks of 32: pages 0–29 of a block carry one record each,
//! page 30 is a directory page (three model slots) and page 31 is a link
//! page mapping each record page of the block to its successor.

use crate::crc;

/// Bytes per page
pub const PAGE_SIZE: usize = 32;
/// Pages per chip
pub const PAGE_COUNT: usize = 256;
/// Bytes per chip
pub const MEMORY_SIZE: usize = PAGE_SIZE * PAGE_COUNT;
/// Bytes of a page covered by its CRC16
pub const PAGE_DATA_SIZE: usize = 30;

/// Pages per block (records + directory + link page)
pub const BLOCK_PAGES: usize = 32;
/// Record pages per block
pub const BLOCK_RECORDS: usize = 30;
/// Offset of the directory page inside a block
pub const DIRECTORY_OFFSET: usize = 30;
/// Offset of the link page inside a block
pub const LINK_OFFSET: usize = 31;

/// Directory slots per directory page
pub const SLOTS_PER_DIRECTORY: usize = 3;
/// Bytes per directory slot
pub const SLOT_SIZE: usize = 10;

/// Maximum number of models a chip can hold
pub const MAX_DIRECTORIES: usize = (PAGE_COUNT / BLOCK_PAGES) * SLOTS_PER_DIRECTORY;
/// Number of record pages on a chip, and so the most records a built image
/// holds. Record index 240 would map to page 256, past the end of memory;
/// the larger [`CHAIN_WALK_LIMIT`] only bounds the parser.
pub const MAX_RECORDS: usize = (PAGE_COUNT / BLOCK_PAGES) * BLOCK_RECORDS;
/// Upper bound on the steps of a single record-chain walk
pub const CHAIN_WALK_LIMIT: usize = 242;

/// Fill byte of an erased page
pub const EMPTY_BYTE: u8 = 0x55;
/// Link entry ending a record chain
pub const CHAIN_END: u8 = 0xFE;
/// Position byte meaning "not set"
pub const UNSET: u8 = 0xFF;
/// Last byte of a blank directory or link page
const BLANK_TABLE_MARKER: u8 = 0xCF;

/// One 32-byte page of chip memory
pub type Page = [u8; PAGE_SIZE];

/// What a page is used for, by its position in the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Carries one exercise set
    Record,
    /// Carries three model directory slots
    Directory,
    /// Maps record pages of its block to their successors
    Link,
}

/// Classify a page index.
pub fn page_kind(page: usize) -> PageKind {
    match page % BLOCK_PAGES {
        DIRECTORY_OFFSET => PageKind::Directory,
        LINK_OFFSET => PageKind::Link,
        _ => PageKind::Record,
    }
}

/// Whether a page holds only the erase pattern.
pub fn is_empty(page: &Page) -> bool {
    page.iter().all(|&b| b == EMPTY_BYTE)
}

/// Whether a link/head pointer ends a chain rather than naming a record page.
///
/// The terminator 0xFE is one of these values: any pointer landing on a
/// directory or link page ends the chain.
pub fn is_chain_end(pointer: u8) -> bool {
    page_kind(pointer as usize) != PageKind::Record
}

/// Index of the directory page holding the given slot.
pub fn directory_page(slot: usize) -> usize {
    (slot / SLOTS_PER_DIRECTORY) * BLOCK_PAGES + DIRECTORY_OFFSET
}

/// Byte offset of the given slot inside its directory page.
pub fn directory_offset(slot: usize) -> usize {
    (slot % SLOTS_PER_DIRECTORY) * SLOT_SIZE
}

/// Page index of the n-th record page of the chip.
pub fn record_page(record: usize) -> usize {
    (record / BLOCK_RECORDS) * BLOCK_PAGES + record % BLOCK_RECORDS
}

/// Location (link page, entry) of a record page's successor pointer.
pub fn link_entry(page: usize) -> (usize, usize) {
    ((page / BLOCK_PAGES) * BLOCK_PAGES + LINK_OFFSET, page % BLOCK_RECORDS)
}

/// An erased chip with blank directory and link tables.
pub fn blank() -> Vec<Page> {
    (0..PAGE_COUNT)
        .map(|index| match page_kind(index) {
            PageKind::Record => [EMPTY_BYTE; PAGE_SIZE],
            PageKind::Directory | PageKind::Link => {
                let mut page = [0xFF; PAGE_SIZE];
                page[PAGE_SIZE - 1] = BLANK_TABLE_MARKER;
                page
            }
        })
        .collect()
}

/// Index of the first page that is neither empty nor CRC-valid.
pub fn first_corrupt_page(pages: &[Page]) -> Option<usize> {
    pages
        .iter()
        .position(|page| !is_empty(page) && !crc::crc16_valid(page))
}

/// Pages of `new` that differ from `old`, with their index.
///
/// Only the common prefix is compared; callers check lengths first.
pub fn changed_pages<'a>(
    new: &'a [Page],
    old: &'a [Page],
) -> impl Iterator<Item = (usize, &'a Page)> + 'a {
    new.iter()
        .zip(old.iter())
        .enumerate()
        .filter(|(_, (n, o))| n != o)
        .map(|(index, (n, _))| (index, n))
}

/// Flatten an image to its 8 KiB byte form.
pub fn to_bytes(pages: &[Page]) -> Vec<u8> {
    pages.iter().flat_map(|p| p.iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_constants() {
        assert_eq!(MEMORY_SIZE, 8192);
        assert_eq!(MAX_DIRECTORIES, 24);
        assert_eq!(MAX_RECORDS, 240);
    }

    #[test]
    fn test_page_addressing() {
        assert_eq!(directory_page(0), 30);
        assert_eq!(directory_page(2), 30);
        assert_eq!(directory_page(3), 62);
        assert_eq!(directory_page(23), 254);
        assert_eq!(directory_offset(4), 10);

        assert_eq!(record_page(0), 0);
        assert_eq!(record_page(29), 29);
        assert_eq!(record_page(30), 32);
        assert_eq!(record_page(239), 253);

        assert_eq!(link_entry(5), (31, 5));
        assert_eq!(link_entry(32), (63, 2));
        assert_eq!(link_entry(61), (63, 1));
    }

    #[test]
    fn test_link_entries_are_unique_per_block() {
        for block in 0..PAGE_COUNT / BLOCK_PAGES {
            let mut seen = [false; BLOCK_RECORDS];
            for offset in 0..BLOCK_RECORDS {
                let (link, entry) = link_entry(block * BLOCK_PAGES + offset);
                assert_eq!(link, block * BLOCK_PAGES + LINK_OFFSET);
                assert!(!seen[entry]);
                seen[entry] = true;
            }
        }
    }

    #[test]
    fn test_chain_end() {
        assert!(is_chain_end(CHAIN_END));
        assert!(is_chain_end(30));
        assert!(is_chain_end(63));
        assert!(!is_chain_end(0));
        assert!(!is_chain_end(32));
    }

    #[test]
    fn test_blank_image() {
        let image = blank();
        assert_eq!(image.len(), PAGE_COUNT);
        assert!(is_empty(&image[0]));
        assert_eq!(image[30][0], 0xFF);
        assert_eq!(image[31][31], 0xCF);
        assert!(!is_empty(&image[62]));
    }

    #[test]
    fn test_changed_pages() {
        let old = blank();
        let mut new = old.clone();
        new[7][3] = 0;
        let changed: Vec<usize> = changed_pages(&new, &old).map(|(i, _)| i).collect();
        assert_eq!(changed, vec![7]);
    }
}
