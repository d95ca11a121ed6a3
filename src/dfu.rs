//! Device Firmware Upgrade class, DFU mode.
//!
//! Control requests only decode and queue work. The flash operation queued by
//! `DFU_GETSTATUS` runs later from [`DfuClass::schedule()`], which is meant
//! to be polled from the main loop since erase and program can take far longer
//! than a control transfer may.

use core::cmp::min;
use core::marker::PhantomData;
use usb_device::{class_prelude::*, control::Request};

use crate::logging::*;

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const DFU_DETACH: u8 = 0x00;
const DFU_DNLOAD: u8 = 0x01;
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

const DESC_DESCTYPE_DFU: u8 = 0x21;

/// Capacity of the staging buffer for a downloaded or uploaded block.
pub const DFU_BUFFER_SIZE: usize = 256;

/// Special command opcode of a block 0 download: set the base address.
pub const DFU_CMD_SET_ADDRESS: u8 = 0x21;
/// Special command opcode of a block 0 download: erase a page, or everything
/// when sent without an address.
pub const DFU_CMD_ERASE: u8 = 0x41;

/// DFU state, as reported in `bState`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    /// Device is operating in the DFU mode and is waiting for requests.
    Idle = 2,
    /// Device has received a block and is waiting for the host to solicit the status via DFU_GETSTATUS.
    DnloadSync = 3,
    /// Device is programming a control-write block into its nonvolatile memories.
    DnloadBusy = 4,
    /// Device is processing a download operation. Expecting DFU_DNLOAD requests.
    DnloadIdle = 5,
    /// Device has received the final block of firmware from the host and is waiting for receipt of DFU_GETSTATUS to begin the Manifestation phase.
    ManifestSync = 6,
    /// Device is in the Manifestation phase, it will leave DFU mode from [`DfuClass::schedule()`].
    Manifest = 7,
    /// Device has programmed its memories and is waiting for a USB reset or a power on reset.
    ManifestWaitReset = 8,
    /// The device is processing an upload operation. Expecting DFU_UPLOAD requests.
    UploadIdle = 9,
    /// An error has occurred. Awaiting the DFU_CLRSTATUS request.
    Error = 10,
}

/// DFU status code, as reported in `bStatus`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuStatusCode {
    /// No error condition is present.
    OK = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    ErrNotdone = 0x09,
    /// Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0C,
    /// Device detected unexpected power on reset.
    ErrPOR = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

/// Errors that may happen when working with the flash
/// (reading, erasing, writing). These will be translated
/// to a corresponding error codes in DFU protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DfuMemError {
    /// File is not targeted for use by this device.
    #[error("file is not targeted for this device")]
    Target = DfuStatusCode::ErrTarget as u8,
    /// File is for this device but fails some vendor-specific verification test.
    #[error("file failed verification")]
    File = DfuStatusCode::ErrFile as u8,
    /// Device is unable to write memory.
    #[error("unable to write memory")]
    Write = DfuStatusCode::ErrWrite as u8,
    /// Memory erase function failed.
    #[error("erase failed")]
    Erase = DfuStatusCode::ErrErase as u8,
    /// Memory erase check failed.
    #[error("erase check failed")]
    CheckErased = DfuStatusCode::ErrCheckErased as u8,
    /// Program memory function failed.
    #[error("program failed")]
    Prog = DfuStatusCode::ErrProg as u8,
    /// Programmed memory failed verification.
    #[error("programmed memory failed verification")]
    Verify = DfuStatusCode::ErrVerify as u8,
    /// Cannot program memory due to received address that is out of range.
    #[error("address out of range")]
    Address = DfuStatusCode::ErrAddress as u8,
    /// A vendor-specific error. iString in DFU_GETSTATUS reply will always be 0.
    #[error("vendor specific error")]
    ErrVendor = DfuStatusCode::ErrVendor as u8,
    /// Something went wrong, but the device does not know what it was.
    #[error("unknown error")]
    Unknown = DfuStatusCode::ErrUnknown as u8,
}

/// Errors that may happen when the device leaves DFU mode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DfuManifestationError {
    /// File is not targeted for use by this device.
    #[error("file is not targeted for this device")]
    Target = DfuStatusCode::ErrTarget as u8,
    /// File is for this device but fails some vendor-specific verification test.
    #[error("file failed verification")]
    File = DfuStatusCode::ErrFile as u8,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    #[error("firmware download is incomplete")]
    NotDone = DfuStatusCode::ErrNotdone as u8,
    /// Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    #[error("firmware is corrupt")]
    Firmware = DfuStatusCode::ErrFirmware as u8,
    /// A vendor-specific error. iString in DFU_GETSTATUS reply will always be 0.
    #[error("vendor specific error")]
    ErrVendor = DfuStatusCode::ErrVendor as u8,
    /// Something went wrong, but the device does not know what it was.
    #[error("unknown error")]
    Unknown = DfuStatusCode::ErrUnknown as u8,
}

impl From<DfuMemError> for DfuStatusCode {
    fn from(e: DfuMemError) -> Self {
        match e {
            DfuMemError::File => DfuStatusCode::ErrFile,
            DfuMemError::Target => DfuStatusCode::ErrTarget,
            DfuMemError::Address => DfuStatusCode::ErrAddress,
            DfuMemError::CheckErased => DfuStatusCode::ErrCheckErased,
            DfuMemError::Erase => DfuStatusCode::ErrErase,
            DfuMemError::Write => DfuStatusCode::ErrWrite,
            DfuMemError::Prog => DfuStatusCode::ErrProg,
            DfuMemError::Verify => DfuStatusCode::ErrVerify,
            DfuMemError::Unknown => DfuStatusCode::ErrUnknown,
            DfuMemError::ErrVendor => DfuStatusCode::ErrVendor,
        }
    }
}

impl From<DfuManifestationError> for DfuStatusCode {
    fn from(e: DfuManifestationError) -> Self {
        match e {
            DfuManifestationError::NotDone => DfuStatusCode::ErrNotdone,
            DfuManifestationError::Firmware => DfuStatusCode::ErrFirmware,
            DfuManifestationError::Unknown => DfuStatusCode::ErrUnknown,
            DfuManifestationError::ErrVendor => DfuStatusCode::ErrVendor,
            DfuManifestationError::File => DfuStatusCode::ErrFile,
            DfuManifestationError::Target => DfuStatusCode::ErrTarget,
        }
    }
}

/// Trait that describes the abstraction used to access flash
/// on a device. [`DfuClass`] will call corresponding
/// functions and will use provided constants to tailor
/// DFU features and time interval values that are used in the protocol.
pub trait DfuFlash {
    /// Specifies the default value of the base address.
    ///
    /// Download and upload block `n` (`n >= 2`) maps to
    /// `base + (n - 2) * TRANSFER_SIZE`. `DFU_CMD_SET_ADDRESS` moves the base.
    const INITIAL_ADDRESS_POINTER: u32;

    /// Specifies USB interface descriptor string. It should describe a memory region this interface works with.
    ///
    /// The string is formatted as `@name/address/area[,area...]`, for example
    /// `@Flash/0x08000000/16*1Ka,48*1Kg` is a region named "Flash" at
    /// `0x08000000`, 16 read-only 1K pages followed by 48 readable, erasable
    /// and writable 1K pages.
    const MEM_INFO_STRING: &'static str;

    /// Address of the firmware information page.
    ///
    /// Upload of block 0 reads it, a block 0 download of exactly
    /// [`INFO_PAGE_SIZE`](DfuFlash::INFO_PAGE_SIZE) bytes programs it.
    const INFO_PAGE_ADDRESS: u32;

    /// Size of the firmware information page. Must not exceed [`DFU_BUFFER_SIZE`]
    /// and must not be `1` or `5` (the special command sizes).
    const INFO_PAGE_SIZE: u16;

    /// If set, DFU descriptor will have *bitCanDnload* bit set. Default is `true`.
    const HAS_DOWNLOAD: bool = true;

    /// If set, DFU descriptor will have *bitCanUpload* bit set and arbitrary
    /// flash content can be read back with upload blocks `>= 2`. Default is `true`.
    const HAS_UPLOAD: bool = true;

    /// If set, DFU descriptor will have *bitWillDetach* bit set and the device
    /// leaves DFU mode on its own after manifestation, going through
    /// `Manifest`. Otherwise it waits for a USB reset in `ManifestWaitReset`.
    /// Default is `true`.
    const WILL_DETACH: bool = true;

    /// Time in milliseconds host must wait before issuing the next command after
    /// a block program request.
    const PROGRAM_TIME_MS: u32;

    /// Similar to [`PROGRAM_TIME_MS`](DfuFlash::PROGRAM_TIME_MS), but for a page erase operation.
    const PAGE_ERASE_TIME_MS: u32;

    /// Similar to [`PROGRAM_TIME_MS`](DfuFlash::PROGRAM_TIME_MS), but for a full erase operation.
    const FULL_ERASE_TIME_MS: u32;

    /// Time in milliseconds host must wait after the final (zero length)
    /// download before the device leaves DFU mode. Default is `1` ms.
    const MANIFESTATION_TIME_MS: u32 = 1;

    /// wDetachTimeOut field in DFU descriptor, also the upper bound for the
    /// timeout of `DFU_DETACH`. Default value: `250` ms.
    const DETACH_TIMEOUT: u16 = 250;

    /// Block size of download and upload. Default value: `128` bytes.
    ///
    /// **Warning**: must be less or equal of `usb-device`'s control endpoint
    /// buffer size (usually `128` bytes) and of [`DFU_BUFFER_SIZE`].
    const TRANSFER_SIZE: u16 = 128;

    /// Read flash content at `address` into `buf`, returns how many bytes
    /// were read. A short read ends an upload.
    ///
    /// This function is called from `usb_dev.poll([])` (USB interrupt context).
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<usize, DfuMemError>;

    /// Program `data` at `address`.
    ///
    /// This function is called from [`DfuClass::schedule()`].
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), DfuMemError>;

    /// Erase the page containing `address`.
    ///
    /// This function is called from [`DfuClass::schedule()`].
    fn erase(&mut self, address: u32) -> Result<(), DfuMemError>;

    /// Erase the whole programmable region.
    ///
    /// This function is called from [`DfuClass::schedule()`].
    fn erase_all(&mut self) -> Result<(), DfuMemError>;

    /// Leave DFU mode after `timeout_ms`: restore clock and watchdog
    /// configuration and jump to the application image.
    ///
    /// Normally does not return. A returned error puts DFU into the error
    /// state.
    ///
    /// This function is called from [`DfuClass::schedule()`].
    fn leave(&mut self, timeout_ms: u32) -> Result<(), DfuManifestationError>;

    /// Called every time when USB is reset, before DFU state is reinitialized.
    ///
    /// This function is called from `usb_dev.poll([])` (USB interrupt context).
    fn usb_reset(&mut self) {}
}

/// A [`DfuFlash`] without any memory behind it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFlash;

impl DfuFlash for NoFlash {
    const INITIAL_ADDRESS_POINTER: u32 = 0;
    const MEM_INFO_STRING: &'static str = "@None/0x00000000/0*0Ka";
    const INFO_PAGE_ADDRESS: u32 = 0;
    const INFO_PAGE_SIZE: u16 = 0;
    const HAS_DOWNLOAD: bool = false;
    const HAS_UPLOAD: bool = false;
    const PROGRAM_TIME_MS: u32 = 0;
    const PAGE_ERASE_TIME_MS: u32 = 0;
    const FULL_ERASE_TIME_MS: u32 = 0;

    fn read(&mut self, _address: u32, _buf: &mut [u8]) -> Result<usize, DfuMemError> {
        Err(DfuMemError::Address)
    }

    fn write(&mut self, _address: u32, _data: &[u8]) -> Result<(), DfuMemError> {
        Err(DfuMemError::Address)
    }

    fn erase(&mut self, _address: u32) -> Result<(), DfuMemError> {
        Err(DfuMemError::Address)
    }

    fn erase_all(&mut self) -> Result<(), DfuMemError> {
        Err(DfuMemError::Erase)
    }

    fn leave(&mut self, _timeout_ms: u32) -> Result<(), DfuManifestationError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    None,
    EraseAll,
    Erase(u32),
    SetAddress(u32),
    Write { address: u32, len: u16 },
    Leave(u32),
}

#[derive(Clone, Copy)]
struct DfuStatus {
    status: DfuStatusCode,
    poll_timeout: u32,
    state: DfuState,
    base_address: u32,
    // decoded by DFU_DNLOAD or DFU_DETACH, waiting for DFU_GETSTATUS
    command: Command,
    // queued by DFU_GETSTATUS, waiting for schedule()
    pending: Command,
}

impl DfuStatus {
    fn new(addr: u32) -> Self {
        Self {
            status: DfuStatusCode::OK,
            poll_timeout: 0,
            state: DfuState::Idle,
            base_address: addr,
            command: Command::None,
            pending: Command::None,
        }
    }

    fn new_state_ok(&mut self, state: DfuState) {
        self.new_state_status(state, DfuStatusCode::OK);
    }

    fn new_state_status(&mut self, state: DfuState, status: DfuStatusCode) {
        if state != self.state {
            trace_dfu_state!("DFU> {:?} -> {:?} ({:?})", self.state, state, status);
        }
        self.status = status;
        self.state = state;
    }

    fn state(&self) -> DfuState {
        self.state
    }
}

impl From<DfuStatus> for [u8; 6] {
    fn from(dfu: DfuStatus) -> Self {
        [
            // bStatus
            dfu.status as u8,
            // bwPollTimeout
            (dfu.poll_timeout & 0xff) as u8,
            ((dfu.poll_timeout >> 8) & 0xff) as u8,
            ((dfu.poll_timeout >> 16) & 0xff) as u8,
            // bState
            dfu.state as u8,
            // iString: Index of status description in string table.
            0,
        ]
    }
}

/// DFU protocol USB class implementation for usb-device library.
pub struct DfuClass<B: UsbBus, F: DfuFlash> {
    if_num: InterfaceNumber,
    status: DfuStatus,
    interface_string: StringIndex,
    buffer: [u8; DFU_BUFFER_SIZE],
    _bus: PhantomData<B>,
    flash: F,
}

impl<B: UsbBus, F: DfuFlash> UsbClass<B> for DfuClass<B, F> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface_alt(
            self.if_num,
            0,
            USB_CLASS_APPLICATION_SPECIFIC,
            USB_SUBCLASS_DFU,
            USB_PROTOCOL_DFU_MODE,
            Some(self.interface_string),
        )?;

        // DFU Functional descriptor
        writer.write(
            DESC_DESCTYPE_DFU,
            &[
                // bmAttributes
                // Bit 3: bitWillDetach
                (if F::WILL_DETACH {0x8} else {0}) |
                    // Bit 2: bitManifestationTolerant, never returns to dfuIdle after manifestation
                    // Bit 1: bitCanUpload
                    (if F::HAS_UPLOAD {0x2} else {0}) |
                    // Bit 0: bitCanDnload
                    (if F::HAS_DOWNLOAD {0x1} else {0}),
                // wDetachTimeOut
                (F::DETACH_TIMEOUT & 0xff) as u8,
                (F::DETACH_TIMEOUT >> 8) as u8,
                // wTransferSize
                (F::TRANSFER_SIZE & 0xff) as u8,
                (F::TRANSFER_SIZE >> 8) as u8,
                // bcdDFUVersion
                0x1a,
                0x01,
            ],
        )?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, _lang_id: LangID) -> Option<&str> {
        if index == self.interface_string {
            return Some(F::MEM_INFO_STRING);
        }
        None
    }

    // Handle control requests to the host.
    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if !self.is_own_request(&req) {
            return;
        }

        match req.request {
            DFU_UPLOAD => {
                self.upload(xfer, req);
            }
            DFU_GETSTATUS => {
                self.get_status(xfer, req);
            }
            DFU_GETSTATE => {
                self.get_state(xfer, req);
            }
            _ => {
                trace_usb_control!("DFU> unhandled control-IN {}", req.request);
                xfer.reject().ok();
            }
        }
    }

    // Handle a control request from the host.
    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if !self.is_own_request(&req) {
            return;
        }

        match req.request {
            DFU_DETACH => {
                self.detach(xfer, req);
            }
            DFU_DNLOAD => {
                self.download(xfer, req);
            }
            DFU_CLRSTATUS => {
                self.clear_status(xfer);
            }
            DFU_ABORT => {
                self.abort(xfer);
            }
            _ => {
                trace_usb_control!("DFU> unhandled control-OUT {}", req.request);
                xfer.reject().ok();
            }
        }
    }

    fn reset(&mut self) {
        // may not return
        self.flash.usb_reset();

        trace_dfu_state!("DFU> USB reset in {:?}", self.status.state());
        self.status = DfuStatus::new(F::INITIAL_ADDRESS_POINTER);
    }
}

impl<B: UsbBus, F: DfuFlash> DfuClass<B, F> {
    /// Creates a new DfuClass with the provided UsbBus and
    /// DfuFlash
    pub fn new(alloc: &UsbBusAllocator<B>, flash: F) -> Self {
        debug_assert!(F::TRANSFER_SIZE as usize <= DFU_BUFFER_SIZE);
        debug_assert!(F::INFO_PAGE_SIZE as usize <= DFU_BUFFER_SIZE);
        Self {
            if_num: alloc.interface(),
            status: DfuStatus::new(F::INITIAL_ADDRESS_POINTER),
            interface_string: alloc.string(),
            buffer: [0; DFU_BUFFER_SIZE],
            _bus: PhantomData,
            flash,
        }
    }

    /// This function may be called just after `DfuClass::new()` to
    /// set DFU error state to "Device detected unexpected power on reset"
    /// instead of the usual `dfuIdle`.
    pub fn set_unexpected_reset_state(&mut self) {
        self.status
            .new_state_status(DfuState::Error, DfuStatusCode::ErrPOR);
    }

    /// This function may be called just after `DfuClass::new()` to
    /// set DFU error state to "Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations"
    /// instead of the usual `dfuIdle`.
    pub fn set_firmware_corrupted_state(&mut self) {
        self.status
            .new_state_status(DfuState::Error, DfuStatusCode::ErrFirmware);
    }

    /// Return current base address.
    pub fn get_address_pointer(&self) -> u32 {
        self.status.base_address
    }

    /// Current DFU state.
    pub fn state(&self) -> DfuState {
        self.status.state()
    }

    /// Current DFU status code.
    pub fn status(&self) -> DfuStatusCode {
        self.status.status
    }

    /// Returns `true` if [`schedule()`](DfuClass::schedule) has queued work to
    /// run.
    pub fn is_pending(&self) -> bool {
        self.status.pending != Command::None
    }

    /// Access the flash collaborator.
    pub fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    ///
    /// Run the flash operation queued by the last `DFU_GETSTATUS`: program,
    /// erase, base address change, or leaving DFU mode.
    ///
    /// Must be polled from the main loop, outside of USB interrupt context.
    /// Does nothing if [`is_pending()`](DfuClass::is_pending) is `false`.
    ///
    pub fn schedule(&mut self) {
        let pending = self.status.pending;
        self.status.pending = Command::None;

        match (self.status.state(), pending) {
            (_, Command::None) => {}
            (DfuState::DnloadBusy, Command::EraseAll) => {
                let r = self.flash.erase_all();
                self.finish_download(r);
            }
            (DfuState::DnloadBusy, Command::Erase(address)) => {
                let r = self.flash.erase(address);
                self.finish_download(r);
            }
            (DfuState::DnloadBusy, Command::Write { address, len }) => {
                let r = self.flash.write(address, &self.buffer[..len as usize]);
                self.finish_download(r);
            }
            (DfuState::DnloadBusy, Command::SetAddress(address)) => {
                self.status.base_address = address;
                self.status.new_state_ok(DfuState::DnloadIdle);
            }
            (DfuState::Manifest, Command::Leave(timeout)) => {
                // may not return
                match self.flash.leave(timeout) {
                    Err(e) => {
                        warn_class!("DFU> manifestation failed: {}", e);
                        self.status.new_state_status(DfuState::Error, e.into());
                    }
                    Ok(_) => self.status.new_state_ok(DfuState::ManifestWaitReset),
                }
            }
            (DfuState::Idle, Command::Leave(timeout)) => {
                // may not return
                if let Err(e) = self.flash.leave(timeout) {
                    warn_class!("DFU> detach failed: {}", e);
                    self.status.new_state_status(DfuState::Error, e.into());
                }
            }
            (state, cmd) => {
                warn_class!("DFU> dropping {:?} queued in {:?}", cmd, state);
            }
        }
    }

    fn finish_download(&mut self, r: Result<(), DfuMemError>) {
        match r {
            Err(e) => {
                warn_class!("DFU> flash operation failed: {}", e);
                self.status.new_state_status(DfuState::Error, e.into());
            }
            Ok(_) => self.status.new_state_ok(DfuState::DnloadIdle),
        }
    }

    fn is_own_request(&self, req: &Request) -> bool {
        req.request_type == control::RequestType::Class
            && req.recipient == control::Recipient::Interface
            && req.index == u8::from(self.if_num) as u16
    }

    fn reinit_idle(&mut self) {
        self.status.command = Command::None;
        self.status.pending = Command::None;
        self.status.poll_timeout = 0;
        self.status.new_state_ok(DfuState::Idle);
    }

    fn detach(&mut self, xfer: ControlOut<B>, req: Request) {
        match self.status.state() {
            DfuState::DnloadSync | DfuState::DnloadBusy | DfuState::DnloadIdle => {
                xfer.reject().ok();
            }
            _ => {
                let timeout = min(req.value, F::DETACH_TIMEOUT) as u32;
                self.reinit_idle();
                self.status.pending = Command::Leave(timeout);
                xfer.accept().ok();
            }
        }
    }

    fn clear_status(&mut self, xfer: ControlOut<B>) {
        match self.status.state() {
            DfuState::Error => {
                self.reinit_idle();
                xfer.accept().ok();
            }
            _ => {
                xfer.reject().ok();
            }
        }
    }

    fn abort(&mut self, xfer: ControlOut<B>) {
        match self.status.state() {
            DfuState::Idle | DfuState::Error => {
                xfer.reject().ok();
            }
            DfuState::DnloadSync
            | DfuState::DnloadBusy
            | DfuState::DnloadIdle
            | DfuState::ManifestSync
            | DfuState::Manifest
            | DfuState::ManifestWaitReset
            | DfuState::UploadIdle => {
                self.reinit_idle();
                xfer.accept().ok();
            }
        }
    }

    fn stall(&mut self) {
        self.status
            .new_state_status(DfuState::Error, DfuStatusCode::ErrStalledPkt);
    }

    fn download(&mut self, xfer: ControlOut<B>, req: Request) {
        let initial_state = self.status.state();

        if !F::HAS_DOWNLOAD
            || (initial_state != DfuState::Idle && initial_state != DfuState::DnloadIdle)
        {
            self.stall();
            xfer.reject().ok();
            return;
        }

        if req.length == 0 {
            self.status.command = Command::Leave(F::MANIFESTATION_TIME_MS);
            self.status.new_state_ok(DfuState::ManifestSync);
            xfer.accept().ok();
            return;
        }

        let data = xfer.data();
        let command = match req.value {
            0 => self.decode_special(data),
            1 => None,
            block => self.stage_block(
                self.status
                    .base_address
                    .checked_add((block as u32 - 2) * F::TRANSFER_SIZE as u32),
                data,
                F::TRANSFER_SIZE as usize,
            ),
        };

        match command {
            Some(command) => {
                self.status.command = command;
                self.status.new_state_ok(DfuState::DnloadSync);
                xfer.accept().ok();
            }
            None => {
                self.stall();
                xfer.reject().ok();
            }
        }
    }

    fn decode_special(&mut self, data: &[u8]) -> Option<Command> {
        let info_page_size = F::INFO_PAGE_SIZE as usize;

        match data {
            [DFU_CMD_ERASE] => Some(Command::EraseAll),
            [op, a0, a1, a2, a3] if *op == DFU_CMD_SET_ADDRESS || *op == DFU_CMD_ERASE => {
                let addr = u32::from_le_bytes([*a0, *a1, *a2, *a3]);
                if *op == DFU_CMD_SET_ADDRESS {
                    Some(Command::SetAddress(addr))
                } else {
                    Some(Command::Erase(addr))
                }
            }
            _ if info_page_size > 0 && data.len() == info_page_size => {
                self.stage_block(Some(F::INFO_PAGE_ADDRESS), data, info_page_size)
            }
            _ => None,
        }
    }

    fn stage_block(&mut self, address: Option<u32>, data: &[u8], max_len: usize) -> Option<Command> {
        let address = address?;
        if data.is_empty() || data.len() > max_len || data.len() > DFU_BUFFER_SIZE {
            return None;
        }
        self.buffer[..data.len()].copy_from_slice(data);
        Some(Command::Write {
            address,
            len: data.len() as u16,
        })
    }

    fn upload(&mut self, xfer: ControlIn<B>, req: Request) {
        let initial_state = self.status.state();

        if initial_state != DfuState::Idle && initial_state != DfuState::UploadIdle {
            self.stall();
            xfer.reject().ok();
            return;
        }

        if req.value == 0 {
            // firmware information page
            let len = min(min(F::INFO_PAGE_SIZE, req.length) as usize, DFU_BUFFER_SIZE);
            match self.flash.read(F::INFO_PAGE_ADDRESS, &mut self.buffer[..len]) {
                Ok(n) => {
                    self.status.new_state_ok(DfuState::Idle);
                    xfer.accept_with(&self.buffer[..min(n, len)]).ok();
                }
                Err(e) => {
                    self.status.new_state_status(DfuState::Error, e.into());
                    xfer.reject().ok();
                }
            }
            return;
        }

        if req.value > 1 && F::HAS_UPLOAD {
            let block_num = req.value - 2;
            let transfer_size = min(min(F::TRANSFER_SIZE, req.length) as usize, DFU_BUFFER_SIZE);

            if let Some(address) = self
                .status
                .base_address
                .checked_add((block_num as u32) * (F::TRANSFER_SIZE as u32))
            {
                match self.flash.read(address, &mut self.buffer[..transfer_size]) {
                    Ok(n) => {
                        let n = min(n, transfer_size);
                        if n < F::TRANSFER_SIZE as usize {
                            // short frame, back to idle
                            self.status.new_state_ok(DfuState::Idle);
                        } else {
                            self.status.new_state_ok(DfuState::UploadIdle);
                        }
                        xfer.accept_with(&self.buffer[..n]).ok();
                    }
                    Err(e) => {
                        self.status.new_state_status(DfuState::Error, e.into());
                        xfer.reject().ok();
                    }
                }
            } else {
                // overflow
                self.status
                    .new_state_status(DfuState::Error, DfuStatusCode::ErrAddress);
                xfer.reject().ok();
            }
            return;
        }

        self.stall();
        xfer.reject().ok();
    }

    fn get_state(&mut self, xfer: ControlIn<B>, req: Request) {
        // return current state, without any state transition
        if req.length > 0 {
            let v = self.status.state() as u8;
            xfer.accept_with(&[v]).ok();
        } else {
            xfer.reject().ok();
        }
    }

    fn get_status(&mut self, xfer: ControlIn<B>, req: Request) {
        if req.length < 6 {
            self.stall();
            xfer.reject().ok();
            return;
        }

        self.process();
        let v: [u8; 6] = self.status.into();
        xfer.accept_with(&v).ok();
    }

    fn expected_timeout(cmd: Command) -> u32 {
        match cmd {
            Command::Write { .. } => F::PROGRAM_TIME_MS,
            Command::EraseAll => F::FULL_ERASE_TIME_MS,
            Command::Erase(_) => F::PAGE_ERASE_TIME_MS,
            Command::Leave(timeout) => timeout,
            Command::SetAddress(_) | Command::None => 0,
        }
    }

    // Advances DnloadSync and ManifestSync, queueing the decoded command for
    // schedule().
    fn process(&mut self) {
        match self.status.state() {
            DfuState::DnloadSync => {
                let cmd = self.status.command;
                self.status.command = Command::None;
                self.status.pending = cmd;
                self.status.poll_timeout = Self::expected_timeout(cmd);
                self.status.new_state_ok(DfuState::DnloadBusy);
            }
            DfuState::DnloadBusy => {
                self.status.poll_timeout = Self::expected_timeout(self.status.pending);
            }
            DfuState::ManifestSync => {
                let cmd = self.status.command;
                self.status.command = Command::None;
                self.status.poll_timeout = Self::expected_timeout(cmd);
                if F::WILL_DETACH {
                    self.status.pending = cmd;
                    self.status.new_state_ok(DfuState::Manifest);
                } else {
                    self.status.new_state_ok(DfuState::ManifestWaitReset);
                }
            }
            _ => {
                self.status.poll_timeout = 0;
            }
        }
    }
}
