//! EDC and ECC generation for Mode 2 sectors.
//!
//! The error detection code is a reflected 32-bit CRC (polynomial
//! `0xD8018001`) over the subheader and data region of a sector. The error
//! correction code is a Reed-Solomon product code over GF(256): 172 bytes of
//! P parity followed by 104 bytes of Q parity, computed on the 2340-byte
//! window starting at the sector address with the address bytes zeroed.

use crate::{FORM1_DATA_SIZE, PREGAP_SECTORS, SECTOR_SIZE};

/// Sync pattern opening every CD-ROM sector.
pub const SYNC_PATTERN: [u8; 12] = [
    0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
];

/// Byte offset of the EDC word in a Form 1 sector.
pub const FORM1_EDC_OFFSET: usize = 2072;

/// Byte offset of the P parity block in a Form 1 sector.
pub const FORM1_ECC_P_OFFSET: usize = 2076;

/// Byte offset of the Q parity block in a Form 1 sector.
pub const FORM1_ECC_Q_OFFSET: usize = 2248;

/// Byte offset of the EDC word in a Form 2 sector.
pub const FORM2_EDC_OFFSET: usize = 2348;

/// Submode flag distinguishing Form 2 from Form 1 sectors.
///
/// Some mastering tools key on bit 7 instead; the PlayStation CD runtime
/// checks bit 5, and so does this codec.
pub const SUBMODE_FORM2: u8 = 0x20;

/// EDC/ECC lookup tables plus the sector-level encode operations built on
/// them. Construction fills the tables once; the value is cheap to share by
/// reference across threads afterwards.
pub struct SectorCodec {
    ecc_f_lut: [u8; 256],
    ecc_b_lut: [u8; 256],
    edc_lut: [u32; 256],
}

impl SectorCodec {
    pub fn new() -> Self {
        let mut ecc_f_lut = [0u8; 256];
        let mut ecc_b_lut = [0u8; 256];
        let mut edc_lut = [0u32; 256];

        for i in 0..256usize {
            let j = ((i << 1) ^ (if i & 0x80 != 0 { 0x11D } else { 0 })) as u8;
            ecc_f_lut[i] = j;
            ecc_b_lut[(i as u8 ^ j) as usize] = i as u8;

            let mut edc = i as u32;
            for _ in 0..8 {
                edc = (edc >> 1) ^ (if edc & 1 != 0 { 0xD801_8001 } else { 0 });
            }
            edc_lut[i] = edc;
        }

        Self {
            ecc_f_lut,
            ecc_b_lut,
            edc_lut,
        }
    }

    /// Streaming EDC update over `src`, starting from `edc`.
    pub fn edc_partial(&self, mut edc: u32, src: &[u8]) -> u32 {
        for &b in src {
            edc = (edc >> 8) ^ self.edc_lut[((edc ^ u32::from(b)) & 0xFF) as usize];
        }
        edc
    }

    /// Computes the EDC of `src` and stores the little-endian result in `dest`.
    pub fn edc_block(&self, src: &[u8], dest: &mut [u8; 4]) {
        let edc = self.edc_partial(0, src);
        *dest = edc.to_le_bytes();
    }

    /// Computes one Reed-Solomon parity block over the 2340-byte window
    /// `src` (sector bytes 12..2352, address already zeroed by the caller).
    ///
    /// P codes use `(86, 24, 2, 86)` and produce 172 bytes; Q codes use
    /// `(52, 43, 86, 88)` and produce 104 bytes.
    pub fn ecc_block(
        &self,
        src: &[u8],
        major_count: usize,
        minor_count: usize,
        major_mult: usize,
        minor_inc: usize,
        dest: &mut [u8],
    ) {
        let len = major_count * minor_count;

        for major in 0..major_count {
            let mut index = (major >> 1) * major_mult + (major & 1);
            let mut ecc_a = 0u8;
            let mut ecc_b = 0u8;

            for _ in 0..minor_count {
                let temp = src[index];
                index += minor_inc;
                if index >= len {
                    index -= len;
                }
                ecc_a ^= temp;
                ecc_b ^= temp;
                ecc_a = self.ecc_f_lut[ecc_a as usize];
            }

            ecc_a = self.ecc_b_lut[(self.ecc_f_lut[ecc_a as usize] ^ ecc_b) as usize];
            dest[major] = ecc_a;
            dest[major + major_count] = ecc_a ^ ecc_b;
        }
    }

    /// Writes the 16-byte sector header: sync pattern, BCD-encoded
    /// minute:second:frame of `lba + 150`, mode byte 2.
    pub fn write_header(&self, sector: &mut [u8], lba: u32) {
        debug_assert!(sector.len() >= 16);

        sector[..12].copy_from_slice(&SYNC_PATTERN);

        let addr = lba + PREGAP_SECTORS;
        sector[12] = to_bcd(((addr / 75) / 60) as u8);
        sector[13] = to_bcd(((addr / 75) % 60) as u8);
        sector[14] = to_bcd((addr % 75) as u8);
        sector[15] = 0x02;
    }

    /// Fills in EDC and P/Q parity for a Mode 2 Form 1 sector whose header,
    /// subheader and data are already in place.
    pub fn encode_mode2_form1(&self, sector: &mut [u8; SECTOR_SIZE]) {
        // EDC covers subheader + data
        let edc = self.edc_partial(0, &sector[16..16 + 8 + FORM1_DATA_SIZE]);
        sector[FORM1_EDC_OFFSET..FORM1_EDC_OFFSET + 4].copy_from_slice(&edc.to_le_bytes());

        // The parity window treats the address bytes as zero
        let addr = [sector[12], sector[13], sector[14], sector[15]];
        sector[12..16].fill(0);

        {
            let (window, p) = sector[12..FORM1_ECC_Q_OFFSET].split_at_mut(FORM1_ECC_P_OFFSET - 12);
            self.ecc_block(window, 86, 24, 2, 86, p);
        }
        {
            // The Q window covers the P parity bytes as well
            let (window, q) = sector[12..].split_at_mut(FORM1_ECC_Q_OFFSET - 12);
            self.ecc_block(window, 52, 43, 86, 88, q);
        }

        sector[12..16].copy_from_slice(&addr);
    }

    /// Fills in the EDC for a Mode 2 Form 2 sector, or zeroes the EDC word
    /// when disabled. Form 2 sectors carry no ECC.
    pub fn encode_mode2_form2(&self, sector: &mut [u8; SECTOR_SIZE], with_edc: bool) {
        if with_edc {
            let edc = self.edc_partial(0, &sector[16..FORM2_EDC_OFFSET]);
            sector[FORM2_EDC_OFFSET..].copy_from_slice(&edc.to_le_bytes());
        } else {
            sector[FORM2_EDC_OFFSET..].fill(0);
        }
    }

    /// Whether a 2336-byte payload carries a Form 2 sector, judged from the
    /// submode byte of its embedded subheader.
    pub fn payload_is_form2(payload: &[u8]) -> bool {
        payload[2] & SUBMODE_FORM2 != 0
    }
}

impl Default for SectorCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs a binary value 0-99 into a BCD byte.
pub const fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Unpacks a BCD byte into its binary value.
pub const fn from_bcd(b: u8) -> u8 {
    (b >> 4) * 10 + (b & 0x0F)
}
