//! Bulk-Only Transport envelopes.
//!
//! Both wrappers are little endian on the wire. Field offsets follow
//! USB Mass Storage Class - Bulk Only Transport, section 5.
//!
//! CBW, 31 bytes:
//!
//! | offset | size | field                    |
//! |--------|------|--------------------------|
//! | 0      | 4    | dCBWSignature            |
//! | 4      | 4    | dCBWTag                  |
//! | 8      | 4    | dCBWDataTransferLength   |
//! | 12     | 1    | bmCBWFlags               |
//! | 13     | 1    | bCBWLUN                  |
//! | 14     | 1    | bCBWCBLength             |
//! | 15     | 16   | CBWCB                    |
//!
//! CSW, 13 bytes:
//!
//! | offset | size | field                    |
//! |--------|------|--------------------------|
//! | 0      | 4    | dCSWSignature            |
//! | 4      | 4    | dCSWTag                  |
//! | 8      | 4    | dCSWDataResidue          |
//! | 12     | 1    | bCSWStatus               |

/// `dCBWSignature`, "USBC".
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// `dCSWSignature`, "USBS".
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Size of a Command Block Wrapper on the wire.
pub const CBW_LEN: usize = 31;
/// Size of a Command Status Wrapper on the wire.
pub const CSW_LEN: usize = 13;

const CBW_FLAG_DATA_IN: u8 = 0x80;

/// Reasons a received packet is not a meaningful CBW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CbwError {
    /// Packet is not exactly 31 bytes.
    #[error("CBW packet has {0} bytes, expected 31")]
    Length(usize),
    /// `dCBWSignature` mismatch.
    #[error("bad CBW signature {0:#010x}")]
    Signature(u32),
    /// `bCBWCBLength` outside of 1..=16.
    #[error("bad CBW command block length {0}")]
    CommandLength(u8),
}

/// Decoded Command Block Wrapper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    /// Host-chosen correlation id, echoed in the CSW.
    pub tag: u32,
    /// Bytes the host expects to move in the data phase.
    pub data_transfer_length: u32,
    /// `bmCBWFlags`, bit 7 is the direction.
    pub flags: u8,
    /// Target logical unit.
    pub lun: u8,
    /// Valid bytes in `block`, 1..=16.
    pub block_length: u8,
    /// Command block, bytes past `block_length` are zero.
    pub block: [u8; 16],
}

impl CommandBlockWrapper {
    /// Decodes a CBW, validating size, signature and command block length.
    pub fn decode(raw: &[u8]) -> Result<Self, CbwError> {
        if raw.len() != CBW_LEN {
            return Err(CbwError::Length(raw.len()));
        }

        let signature = read_le32(&raw[0..4]);
        if signature != CBW_SIGNATURE {
            return Err(CbwError::Signature(signature));
        }

        // reserved high bits must be zero too
        let block_length = raw[14];
        if !(1..=16).contains(&block_length) {
            return Err(CbwError::CommandLength(block_length));
        }

        let mut block = [0u8; 16];
        block[..block_length as usize].copy_from_slice(&raw[15..15 + block_length as usize]);

        Ok(Self {
            tag: read_le32(&raw[4..8]),
            data_transfer_length: read_le32(&raw[8..12]),
            flags: raw[12],
            lun: raw[13] & 0x0f,
            block_length,
            block,
        })
    }

    /// Best effort look at `dCBWDataTransferLength` and direction of a packet
    /// that failed [`decode`](Self::decode). Returns `None` if the packet is
    /// too short to carry the fields.
    pub fn peek_data_phase(raw: &[u8]) -> Option<(u32, bool)> {
        if raw.len() < 13 {
            return None;
        }
        Some((read_le32(&raw[8..12]), raw[12] & CBW_FLAG_DATA_IN != 0))
    }

    /// Direction bit is set, data flows device to host.
    pub fn is_data_in(&self) -> bool {
        self.flags & CBW_FLAG_DATA_IN != 0
    }

    /// Operation code of the wrapped command.
    pub fn opcode(&self) -> u8 {
        self.block[0]
    }

    /// The valid part of the command block.
    pub fn command(&self) -> &[u8] {
        &self.block[..self.block_length as usize]
    }
}

/// `bCSWStatus` values.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Command passed ("good status").
    #[default]
    Passed = 0x00,
    /// Command failed, sense data explains why.
    Failed = 0x01,
    /// Phase error, host must do reset recovery.
    PhaseError = 0x02,
}

/// Command Status Wrapper for the command identified by `tag`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// Copied from the CBW.
    pub tag: u32,
    /// Requested minus transferred bytes.
    pub data_residue: u32,
    /// Outcome of the command.
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Fresh CSW for an accepted CBW: nothing transferred yet, passed.
    pub fn for_command(cbw: &CommandBlockWrapper) -> Self {
        Self {
            tag: cbw.tag,
            data_residue: cbw.data_transfer_length,
            status: CommandStatus::Passed,
        }
    }

    /// Serializes the CSW.
    pub fn encode(&self) -> [u8; CSW_LEN] {
        let mut raw = [0u8; CSW_LEN];
        raw[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        raw[12] = self.status as u8;
        raw
    }
}

fn read_le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
