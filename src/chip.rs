//! Compile-time geometry for the supported W25Qxx chip variants.
//!
//! The flash driver is generic over [`FlashGeometry`] rather than reading
//! capacity off the chip at runtime: the bootloader is always built for one
//! specific board, and `GET_INFO` (spec §6) must report fixed, known-correct
//! page/sector/capacity fields even before the chip has answered a single
//! command.

/// Program/erase granularities and total capacity of a W25Qxx part.
pub trait FlashGeometry {
    /// Maximum span of a single `program_page` command.
    const PAGE_SIZE: u32 = 256;
    /// Granularity of `erase_sector`.
    const SECTOR_SIZE: u32 = 4096;
    /// Granularity of `erase_block_64k`.
    const BLOCK_SIZE: u32 = 65536;
    /// Total addressable size of the part, in bytes.
    const TOTAL_SIZE: u32;
    /// Manufacturer ID byte returned by `read_id`/`read_jedec_id` (`0xEF` Winbond).
    const MANUFACTURER_ID: u8 = 0xEF;
    /// Device ID byte returned by `read_id`.
    const DEVICE_ID: u8;
    /// Memory-type byte of the JEDEC ID (byte 1 of 3).
    const JEDEC_MEMORY_TYPE: u8;
    /// Capacity byte of the JEDEC ID (byte 2 of 3).
    const JEDEC_CAPACITY: u8;
}

/// Winbond W25Q64 — 8 MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct W25Q64;

impl FlashGeometry for W25Q64 {
    const TOTAL_SIZE: u32 = 8 * 1024 * 1024;
    const DEVICE_ID: u8 = 0x16;
    const JEDEC_MEMORY_TYPE: u8 = 0x40;
    const JEDEC_CAPACITY: u8 = 0x17;
}

/// Winbond W25Q128 — 16 MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct W25Q128;

impl FlashGeometry for W25Q128 {
    const TOTAL_SIZE: u32 = 16 * 1024 * 1024;
    const DEVICE_ID: u8 = 0x17;
    const JEDEC_MEMORY_TYPE: u8 = 0x40;
    const JEDEC_CAPACITY: u8 = 0x18;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn w25q128_matches_scenario_s1() {
        assert_eq!(W25Q128::TOTAL_SIZE, 0x0100_0000);
        assert_eq!(W25Q128::PAGE_SIZE, 0x0100);
        assert_eq!(W25Q128::SECTOR_SIZE, 0x1000);
        assert_eq!(W25Q128::MANUFACTURER_ID, 0xEF);
        assert_eq!(W25Q128::DEVICE_ID, 0x17);
        assert_eq!(
            [
                W25Q128::MANUFACTURER_ID,
                W25Q128::JEDEC_MEMORY_TYPE,
                W25Q128::JEDEC_CAPACITY
            ],
            [0xEF, 0x40, 0x18]
        );
    }

    #[test]
    fn w25q64_is_half_the_capacity() {
        assert_eq!(W25Q64::TOTAL_SIZE, W25Q128::TOTAL_SIZE / 2);
    }
}
