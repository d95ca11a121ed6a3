#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! USB Mass Storage (Bulk-Only Transport, SCSI transparent command set) and
//! DFU 1.1a class engines for a `usb-device` device.
//!
//! ## About
//!
//! Two independent device classes are provided, both are protocol
//! implementations only. Code that actually reads and writes the medium or
//! the flash is not a part of the library and is expected to be provided by
//! the library user through a collaborator trait.
//!
//! * [`MscClass`] - a mass storage interface with one bulk IN and one bulk OUT
//!   endpoint. Commands are served from a [`BlockDevice`]. Supported SCSI
//!   commands: TEST UNIT READY, REQUEST SENSE, INQUIRY, START STOP UNIT,
//!   PREVENT ALLOW MEDIUM REMOVAL, MODE SENSE (6) and (10), READ FORMAT
//!   CAPACITIES, READ CAPACITY (10), READ (10) and (12), WRITE (10) and (12),
//!   SYNCHRONIZE CACHE (10).
//!
//! * [`DfuClass`] - a DFU mode interface. Firmware is staged from control
//!   transfers and written to a [`DfuFlash`]. Flash erase and program are
//!   not done from the USB interrupt, they run from [`DfuClass::schedule()`]
//!   called by the main loop.
//!
//! ### Limitations
//!
//! * Maximum DFU transfer size is limited to what `usb-device` supports
//!   for control endpoint transfers, which is `128` bytes by default.
//!
//! * iString field in `DFU_GETSTATUS` is always `0`.
//!
//! * SCSI VERIFY (10) and (12) are rejected.
//!
//! ## Logging
//!
//! The crate logs through the [`log`](https://crates.io/crates/log) facade:
//! CBW and CSW headers, transport stages, SCSI commands and DFU state changes
//! at `debug`, packet sizes at `trace`, and malformed requests or failed
//! storage operations at `warn`. No logger is installed by the library.
//!
//! ## Example
//!
//! The example below tries to focus on [`DfuClass`] and [`MscClass`], parts
//! related to a target controller initialization and configuration (USB,
//! interrupts, GPIO, etc.) are not in the scope of the example.
//!
//! ```ignore
//! use usb_device::prelude::*;
//! use usbd_msc_dfu::*;
//!
//! struct Ram {
//!     blocks: [u8; 64 * 512],
//! }
//!
//! impl BlockDevice for Ram {
//!     const VENDOR: &'static str = "Acme";
//!     const PRODUCT: &'static str = "RAM disk";
//!
//!     fn capacity(&mut self, _lun: u8) -> Result<BlockCapacity, StorageError> {
//!         Ok(BlockCapacity { block_count: 64, block_size: 512 })
//!     }
//!
//!     fn read_blocks(&mut self, _lun: u8, lba: u32, buf: &mut [u8]) -> Result<(), StorageError> {
//!         let from = lba as usize * 512;
//!         buf.copy_from_slice(&self.blocks[from..from + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn write_blocks(&mut self, _lun: u8, lba: u32, data: &[u8]) -> Result<(), StorageError> {
//!         let from = lba as usize * 512;
//!         self.blocks[from..from + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//! }
//!
//! // usb_bus_alloc is created by the target HAL
//! let mut msc: MscClass<_, _> = MscClass::new(&usb_bus_alloc, 64, Ram { blocks: [0; 64 * 512] });
//! let mut dfu = DfuClass::new(&usb_bus_alloc, my_flash);
//! let mut usb_dev = UsbDeviceBuilder::new(&usb_bus_alloc, UsbVidPid(0x1209, 0x0001)).build();
//!
//! loop {
//!     // usually from the USB interrupt handler
//!     usb_dev.poll(&mut [&mut msc, &mut dfu]);
//!
//!     // flash erase and program, may leave DFU mode
//!     dfu.schedule();
//! }
//! ```
//!

/// DFU protocol module
pub mod dfu;
mod logging;
/// Mass storage protocol module
pub mod msc;

#[doc(inline)]
pub use crate::dfu::{DfuClass, DfuFlash, DfuManifestationError, DfuMemError, DfuState};
#[doc(inline)]
pub use crate::msc::{BlockCapacity, BlockDevice, MscClass, MscEngine, StorageError};
