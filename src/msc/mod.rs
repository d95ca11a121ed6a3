//! USB Mass Storage, Bulk-Only Transport with the SCSI transparent command
//! set.
//!
//! [`MscClass`] registers one interface with a bulk IN and a bulk OUT
//! endpoint and forwards endpoint events to [`MscEngine`], which owns the
//! session and talks to a [`BlockDevice`].

use usb_device::{class_prelude::*, control::Request};

use crate::logging::*;

pub mod bot;
pub mod engine;
pub mod scsi;

pub use engine::{MscEngine, Stage};

/// USB Mass Storage class code.
pub const USB_CLASS_MSC: u8 = 0x08;
/// SCSI transparent command set subclass.
pub const USB_SUBCLASS_SCSI: u8 = 0x06;
/// Bulk-Only Transport protocol.
pub const USB_PROTOCOL_BBB: u8 = 0x50;

const MSC_GET_MAX_LUN: u8 = 0xfe;
const MSC_BULK_ONLY_RESET: u8 = 0xff;

/// Highest number of logical units addressable by a CBW.
pub const MAX_LUNS: usize = 16;

/// Errors reported by a [`BlockDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// There is no medium behind the logical unit.
    #[error("medium not present")]
    NotPresent,
    /// Requested blocks are outside of the medium.
    #[error("block address out of range")]
    OutOfRange,
    /// The medium failed to read or program.
    #[error("medium I/O failure")]
    Io,
}

/// Size of a logical unit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockCapacity {
    /// Number of addressable blocks.
    pub block_count: u32,
    /// Bytes per block.
    pub block_size: u32,
}

/// Block storage behind the mass storage interface.
///
/// All functions are called from `usb_dev.poll([])` (USB interrupt context).
/// Reads and writes always cover whole blocks, `buf.len()` is a multiple of
/// the block size reported by [`capacity()`](BlockDevice::capacity).
pub trait BlockDevice {
    /// Number of logical units, `1..=16`. Default is `1`.
    const LUN_COUNT: u8 = 1;

    /// T10 vendor identification in INQUIRY data, up to 8 ASCII characters.
    const VENDOR: &'static str = "Generic";

    /// Product identification in INQUIRY data, up to 16 ASCII characters.
    const PRODUCT: &'static str = "Mass Storage";

    /// Product revision level in INQUIRY data, up to 4 ASCII characters.
    const REVISION: &'static str = "1.00";

    /// Size of the medium. Queried when a session is initialized.
    fn capacity(&mut self, lun: u8) -> Result<BlockCapacity, StorageError>;

    /// Medium is present and accessible.
    fn is_ready(&mut self, _lun: u8) -> bool {
        true
    }

    /// Medium rejects writes.
    fn is_write_protected(&mut self, _lun: u8) -> bool {
        false
    }

    /// Read `buf.len()` bytes starting at block `lba`.
    fn read_blocks(&mut self, lun: u8, lba: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `data` starting at block `lba`.
    fn write_blocks(&mut self, lun: u8, lba: u32, data: &[u8]) -> Result<(), StorageError>;
}

/// A [`BlockDevice`] without a medium.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStorage;

impl BlockDevice for NoStorage {
    fn capacity(&mut self, _lun: u8) -> Result<BlockCapacity, StorageError> {
        Err(StorageError::NotPresent)
    }

    fn is_ready(&mut self, _lun: u8) -> bool {
        false
    }

    fn read_blocks(&mut self, _lun: u8, _lba: u32, _buf: &mut [u8]) -> Result<(), StorageError> {
        Err(StorageError::NotPresent)
    }

    fn write_blocks(&mut self, _lun: u8, _lba: u32, _data: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::NotPresent)
    }
}

/// Packet level access to the bulk endpoint pair of the interface.
///
/// Implemented by [`MscClass`] on top of `usb-device` endpoints; tests drive
/// [`MscEngine`] through their own implementation.
pub trait BulkPipe {
    /// Max packet size of the bulk endpoints.
    fn max_packet_size(&self) -> usize;

    /// Read one packet received on the OUT endpoint.
    fn read_packet(&mut self, buf: &mut [u8]) -> usb_device::Result<usize>;

    /// Queue one packet, at most [`max_packet_size()`](BulkPipe::max_packet_size)
    /// bytes, on the IN endpoint.
    fn write_packet(&mut self, data: &[u8]) -> usb_device::Result<usize>;

    /// Halt the IN endpoint.
    fn stall_in(&mut self);

    /// Halt the OUT endpoint.
    fn stall_out(&mut self);
}

struct BulkEndpoints<'a, B: UsbBus> {
    read_ep: EndpointOut<'a, B>,
    write_ep: EndpointIn<'a, B>,
}

impl<B: UsbBus> BulkPipe for BulkEndpoints<'_, B> {
    fn max_packet_size(&self) -> usize {
        self.write_ep.max_packet_size() as usize
    }

    fn read_packet(&mut self, buf: &mut [u8]) -> usb_device::Result<usize> {
        self.read_ep.read(buf)
    }

    fn write_packet(&mut self, data: &[u8]) -> usb_device::Result<usize> {
        self.write_ep.write(data)
    }

    fn stall_in(&mut self) {
        self.write_ep.stall();
    }

    fn stall_out(&mut self) {
        self.read_ep.stall();
    }
}

/// Mass Storage Bulk-Only Transport class for usb-device library.
///
/// `N` is the capacity of the block buffer in bytes. It must hold at least
/// one block of every logical unit, one bulk packet and an INQUIRY reply.
pub struct MscClass<'a, B: UsbBus, S: BlockDevice, const N: usize = 512> {
    if_num: InterfaceNumber,
    eps: BulkEndpoints<'a, B>,
    engine: MscEngine<S, N>,
}

impl<'a, B: UsbBus, S: BlockDevice, const N: usize> MscClass<'a, B, S, N> {
    /// Creates a new MscClass with the provided UsbBus, bulk endpoints max
    /// packet size, and BlockDevice.
    pub fn new(alloc: &'a UsbBusAllocator<B>, max_packet_size: u16, storage: S) -> Self {
        debug_assert!(max_packet_size as usize <= N);
        Self {
            if_num: alloc.interface(),
            eps: BulkEndpoints {
                read_ep: alloc.bulk(max_packet_size),
                write_ep: alloc.bulk(max_packet_size),
            },
            engine: MscEngine::new(storage),
        }
    }

    /// Current transport stage.
    pub fn stage(&self) -> Stage {
        self.engine.stage()
    }

    /// Access the storage collaborator.
    pub fn storage(&mut self) -> &mut S {
        self.engine.storage()
    }

    fn is_own_request(&self, req: &Request) -> bool {
        req.request_type == control::RequestType::Class
            && req.recipient == control::Recipient::Interface
            && req.index == u8::from(self.if_num) as u16
    }

    fn is_in_halt_clear(&self, req: &Request) -> bool {
        req.request_type == control::RequestType::Standard
            && req.recipient == control::Recipient::Endpoint
            && req.request == Request::CLEAR_FEATURE
            && req.value == Request::FEATURE_ENDPOINT_HALT
            && req.index as u8 == u8::from(self.eps.write_ep.address())
    }
}

impl<B: UsbBus, S: BlockDevice, const N: usize> UsbClass<B> for MscClass<'_, B, S, N> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface(
            self.if_num,
            USB_CLASS_MSC,
            USB_SUBCLASS_SCSI,
            USB_PROTOCOL_BBB,
        )?;
        writer.endpoint(&self.eps.write_ep)?;
        writer.endpoint(&self.eps.read_ep)?;
        Ok(())
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();
        if !self.is_own_request(&req) {
            return;
        }

        match req.request {
            MSC_GET_MAX_LUN if req.length >= 1 => {
                let max_lun = self.engine.max_lun();
                trace_usb_control!("MSC> GET_MAX_LUN -> {}", max_lun);
                xfer.accept_with(&[max_lun]).ok();
            }
            _ => {
                trace_usb_control!("MSC> unhandled control-IN {}", req.request);
                xfer.reject().ok();
            }
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();
        if self.is_in_halt_clear(&req) {
            // left to usb-device, which resumes the endpoint
            trace_usb_control!("MSC> CLEAR_FEATURE(ENDPOINT_HALT) IN");
            self.engine.on_in_halt_cleared();
            return;
        }
        if !self.is_own_request(&req) {
            return;
        }

        match req.request {
            MSC_BULK_ONLY_RESET if req.length == 0 => {
                trace_usb_control!("MSC> BULK_ONLY_RESET");
                self.engine.reset();
                xfer.accept().ok();
            }
            _ => {
                trace_usb_control!("MSC> unhandled control-OUT {}", req.request);
                xfer.reject().ok();
            }
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.eps.read_ep.address() {
            self.engine.on_bulk_out(&mut self.eps);
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.eps.write_ep.address() {
            self.engine.on_bulk_in_complete(&mut self.eps);
        }
    }

    fn poll(&mut self) {
        self.engine.poll(&mut self.eps);
    }

    fn reset(&mut self) {
        self.engine.reset();
    }
}
