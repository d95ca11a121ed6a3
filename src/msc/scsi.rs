//! SCSI transparent command set subset: opcodes, sense data and the
//! fixed-format reply payloads.
//!
//! Numeric fields inside SCSI payloads are big endian.

#![allow(missing_docs)]

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const START_STOP_UNIT: u8 = 0x1b;
pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const VERIFY_10: u8 = 0x2f;
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
pub const MODE_SENSE_10: u8 = 0x5a;
pub const READ_12: u8 = 0xa8;
pub const WRITE_12: u8 = 0xaa;
pub const VERIFY_12: u8 = 0xaf;

pub const INQUIRY_LEN: usize = 36;
pub const INQUIRY_VPD_SUPPORTED_PAGES_LEN: usize = 5;
pub const REQUEST_SENSE_LEN: usize = 18;
pub const READ_CAPACITY_10_LEN: usize = 8;
pub const READ_FORMAT_CAPACITIES_LEN: usize = 12;
pub const MODE_SENSE_6_LEN: usize = 4;
pub const MODE_SENSE_10_LEN: usize = 27;

/// Broad error category reported by REQUEST SENSE.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    #[default]
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0b,
}

/// Sense key with additional sense code and qualifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    pub const NO_SENSE: Sense = Sense::new(SenseKey::NoSense, 0x00, 0x00);
    pub const WRITE_FAULT: Sense = Sense::new(SenseKey::HardwareError, 0x03, 0x00);
    pub const UNRECOVERED_READ_ERROR: Sense = Sense::new(SenseKey::HardwareError, 0x11, 0x00);
    pub const INVALID_COMMAND: Sense = Sense::new(SenseKey::IllegalRequest, 0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(SenseKey::IllegalRequest, 0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: Sense = Sense::new(SenseKey::IllegalRequest, 0x24, 0x00);
    pub const LUN_NOT_SUPPORTED: Sense = Sense::new(SenseKey::IllegalRequest, 0x25, 0x00);
    pub const WRITE_PROTECTED: Sense = Sense::new(SenseKey::DataProtect, 0x27, 0x00);
    pub const MEDIUM_NOT_PRESENT: Sense = Sense::new(SenseKey::NotReady, 0x3a, 0x00);
}

/// Standard INQUIRY data, direct access block device with removable medium.
///
/// `vendor`, `product` and `revision` are space padded or truncated to
/// 8, 16 and 4 bytes.
pub fn inquiry(buf: &mut [u8], vendor: &str, product: &str, revision: &str) -> usize {
    let out = &mut buf[..INQUIRY_LEN];
    out.fill(0);
    // Peripheral qualifier 0, device type 0 (direct access block device)
    out[0] = 0x00;
    // RMB
    out[1] = 0x80;
    // Version: SPC-2
    out[2] = 0x04;
    // Response data format
    out[3] = 0x02;
    // Additional length
    out[4] = (INQUIRY_LEN - 5) as u8;
    ascii_field(&mut out[8..16], vendor);
    ascii_field(&mut out[16..32], product);
    ascii_field(&mut out[32..36], revision);
    INQUIRY_LEN
}

/// Supported VPD pages (page 0x00), only the page itself is listed.
pub fn inquiry_vpd_supported_pages(buf: &mut [u8]) -> usize {
    buf[..INQUIRY_VPD_SUPPORTED_PAGES_LEN].copy_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x00]);
    INQUIRY_VPD_SUPPORTED_PAGES_LEN
}

/// Fixed format sense data.
pub fn request_sense(buf: &mut [u8], sense: &Sense) -> usize {
    let out = &mut buf[..REQUEST_SENSE_LEN];
    out.fill(0);
    // Current error, fixed format
    out[0] = 0x70;
    out[2] = sense.key as u8;
    // Additional sense length
    out[7] = (REQUEST_SENSE_LEN - 8) as u8;
    out[12] = sense.asc;
    out[13] = sense.ascq;
    REQUEST_SENSE_LEN
}

/// READ CAPACITY (10) data: last LBA and block length.
pub fn read_capacity_10(buf: &mut [u8], block_count: u32, block_size: u32) -> usize {
    let out = &mut buf[..READ_CAPACITY_10_LEN];
    out[0..4].copy_from_slice(&block_count.saturating_sub(1).to_be_bytes());
    out[4..8].copy_from_slice(&block_size.to_be_bytes());
    READ_CAPACITY_10_LEN
}

/// READ FORMAT CAPACITIES data: a capacity list with the single
/// current/maximum descriptor of formatted media.
pub fn read_format_capacities(buf: &mut [u8], block_count: u32, block_size: u32) -> usize {
    let out = &mut buf[..READ_FORMAT_CAPACITIES_LEN];
    out.fill(0);
    // Capacity list length
    out[3] = 0x08;
    out[4..8].copy_from_slice(&block_count.to_be_bytes());
    // Descriptor code: formatted media
    out[8] = 0x02;
    out[9..12].copy_from_slice(&block_size.to_be_bytes()[1..4]);
    READ_FORMAT_CAPACITIES_LEN
}

/// MODE SENSE (6) parameter header, no block descriptors or pages.
pub fn mode_sense_6(buf: &mut [u8], write_protected: bool) -> usize {
    let out = &mut buf[..MODE_SENSE_6_LEN];
    out.fill(0);
    out[0] = (MODE_SENSE_6_LEN - 1) as u8;
    out[2] = wp_flag(write_protected);
    MODE_SENSE_6_LEN
}

/// MODE SENSE (10) parameter header followed by a caching page with every
/// cache disabled.
pub fn mode_sense_10(buf: &mut [u8], write_protected: bool) -> usize {
    let out = &mut buf[..MODE_SENSE_10_LEN];
    out.fill(0);
    out[0..2].copy_from_slice(&((MODE_SENSE_10_LEN - 2) as u16).to_be_bytes());
    out[3] = wp_flag(write_protected);
    // Caching mode page
    out[8] = 0x08;
    out[9] = (MODE_SENSE_10_LEN - 10) as u8;
    MODE_SENSE_10_LEN
}

fn wp_flag(write_protected: bool) -> u8 {
    if write_protected {
        0x80
    } else {
        0
    }
}

fn ascii_field(dst: &mut [u8], src: &str) {
    dst.fill(b' ');
    for (d, s) in dst.iter_mut().zip(src.bytes()) {
        *d = if s.is_ascii_graphic() || s == b' ' { s } else { b' ' };
    }
}

/// LBA and block count of a READ/WRITE/VERIFY (10) command block.
pub fn rw10_params(cb: &[u8; 16]) -> (u32, u32) {
    let lba = u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]);
    let count = u16::from_be_bytes([cb[7], cb[8]]) as u32;
    (lba, count)
}

/// LBA and block count of a READ/WRITE/VERIFY (12) command block.
pub fn rw12_params(cb: &[u8; 16]) -> (u32, u32) {
    let lba = u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]);
    let count = u32::from_be_bytes([cb[6], cb[7], cb[8], cb[9]]);
    (lba, count)
}

/// Allocation length of INQUIRY, REQUEST SENSE and MODE SENSE (6).
pub fn allocation_length_6(cb: &[u8; 16]) -> usize {
    match cb[0] {
        INQUIRY => u16::from_be_bytes([cb[3], cb[4]]) as usize,
        _ => cb[4] as usize,
    }
}

/// Allocation length of READ FORMAT CAPACITIES and MODE SENSE (10).
pub fn allocation_length_10(cb: &[u8; 16]) -> usize {
    u16::from_be_bytes([cb[7], cb[8]]) as usize
}
