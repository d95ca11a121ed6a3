//! Bulk-Only Transport session and SCSI command dispatch.
//!
//! ```text
//!            +-----------------------------------------------+
//!            v                                               |
//!       +---------+   READ   +--------+                      |
//!  ---->| ReadCbw |--------->| DataIn |----+                 |
//!       +---------+          +--------+    |                 |
//!         |     |   WRITE    +---------+   v                 |
//!         |     +----------->| DataOut |  +---------+   +---------+
//!         |                  +---------+->| SendCsw |-->| WaitCsw |
//!         +------------------------------>+---------+   +---------+
//!                   no data / bounded reply
//! ```
//!
//! Block data moves in chunks of at most `N` bytes (whole blocks). Each chunk
//! is a single [`BlockDevice`] call and is streamed over as many bulk packets
//! as needed. Every chunk but the last of a transfer is a multiple of the bulk
//! max packet size, so no short packet ends the data phase early.
//!
//! A command that fails while the host still expects IN data halts the IN
//! endpoint. Its CSW is sent from [`MscEngine::poll()`] once the host cleared
//! the halt.

use core::cmp::min;

use usb_device::UsbError;

use super::bot::{CommandBlockWrapper, CommandStatus, CommandStatusWrapper};
use super::scsi::{self, Sense};
use super::{BlockCapacity, BlockDevice, BulkPipe, StorageError, MAX_LUNS};
use crate::logging::*;

/// Bulk-Only Transport stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for a Command Block Wrapper.
    ReadCbw,
    /// Receiving block data from the host.
    DataOut,
    /// Sending a reply or block data to the host.
    DataIn,
    /// Data phase is done, CSW goes out on the next IN completion.
    SendCsw,
    /// CSW is queued, waiting for the host to take it.
    WaitCsw,
}

/// CSW of a failed command held back behind an IN halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldCsw {
    None,
    Halted,
    Released,
}

/// Mass storage session bound to a [`BlockDevice`].
///
/// The engine does not own endpoints; every event handler gets the
/// [`BulkPipe`] to use for the reply.
///
/// `N` is the block buffer size. It must hold the largest SCSI reply
/// ([`scsi::INQUIRY_LEN`] bytes), anything smaller fails to compile.
pub struct MscEngine<S: BlockDevice, const N: usize = 512> {
    storage: S,
    stage: Stage,
    cbw: CommandBlockWrapper,
    csw: CommandStatusWrapper,
    buf: [u8; N],
    buf_len: usize,
    buf_pos: usize,
    // running transfer
    lba: u32,
    blocks_left: u32,
    block_size: u32,
    chunk_max: u32,
    out_remaining: u32,
    held_csw: HeldCsw,
    luns: [Option<BlockCapacity>; MAX_LUNS],
    sense: Sense,
}

impl<S: BlockDevice, const N: usize> MscEngine<S, N> {
    const BUFFER_FITS_REPLIES: () = assert!(
        N >= scsi::INQUIRY_LEN,
        "MscEngine buffer is smaller than an INQUIRY reply"
    );

    /// Creates a session and queries the capacity of every logical unit.
    pub fn new(storage: S) -> Self {
        let () = Self::BUFFER_FITS_REPLIES;

        let mut engine = Self {
            storage,
            stage: Stage::ReadCbw,
            cbw: CommandBlockWrapper::default(),
            csw: CommandStatusWrapper::default(),
            buf: [0; N],
            buf_len: 0,
            buf_pos: 0,
            lba: 0,
            blocks_left: 0,
            block_size: 0,
            chunk_max: 0,
            out_remaining: 0,
            held_csw: HeldCsw::None,
            luns: [None; MAX_LUNS],
            sense: Sense::NO_SENSE,
        };
        engine.init_session();
        engine
    }

    /// Reinitializes the session, any transfer in progress is dropped.
    ///
    /// Called on USB bus reset and on the Bulk-Only Mass Storage Reset
    /// class request.
    pub fn reset(&mut self) {
        trace_bot_stages!("BOT> session reset in {:?}", self.stage);
        self.init_session();
    }

    /// Current transport stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Sense data of the last failed command, cleared by REQUEST SENSE.
    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// Access the storage collaborator.
    pub fn storage(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Value for the GET_MAX_LUN class request.
    pub fn max_lun(&self) -> u8 {
        S::LUN_COUNT.clamp(1, MAX_LUNS as u8) - 1
    }

    /// The host cleared the halt of the bulk IN endpoint.
    ///
    /// Called before `usb-device` resumes the endpoint, so nothing is sent
    /// from here. A CSW held back by a failed command goes out from the next
    /// [`poll()`](Self::poll).
    pub fn on_in_halt_cleared(&mut self) {
        if self.held_csw == HeldCsw::Halted {
            trace_bot_stages!("BOT> IN halt cleared, releasing CSW");
            self.held_csw = HeldCsw::Released;
        }
    }

    /// Sends a released CSW. Called on every `usb-device` poll.
    pub fn poll<P: BulkPipe>(&mut self, pipe: &mut P) {
        if self.held_csw == HeldCsw::Released {
            self.send_csw(pipe);
            if self.stage == Stage::WaitCsw {
                self.held_csw = HeldCsw::None;
            }
        }
    }

    /// Handles a packet received on the bulk OUT endpoint.
    pub fn on_bulk_out<P: BulkPipe>(&mut self, pipe: &mut P) {
        match self.stage {
            // The host only sends a new CBW after it took the CSW, the
            // IN completion may be reported after this OUT event.
            Stage::ReadCbw | Stage::WaitCsw => self.read_cbw(pipe),
            Stage::DataOut => self.data_out(pipe),
            Stage::DataIn | Stage::SendCsw => {
                let mut scratch = [0u8; 64];
                let r = pipe.read_packet(&mut scratch);
                warn_class!("BOT> unexpected OUT packet in {:?}: {:?}", self.stage, r);
            }
        }
    }

    /// Handles completion of a packet queued on the bulk IN endpoint.
    pub fn on_bulk_in_complete<P: BulkPipe>(&mut self, pipe: &mut P) {
        match self.stage {
            Stage::DataIn => {
                if self.buf_pos < self.buf_len {
                    self.send_next_packet(pipe);
                } else if self.blocks_left > 0 {
                    if let Err(sense) = self.fetch_read_chunk(pipe) {
                        self.fail_command(sense, pipe);
                    }
                } else {
                    // reply ended on a packet boundary but is shorter than
                    // the host asked for
                    pipe.write_packet(&[]).ok();
                    self.set_stage(Stage::SendCsw);
                }
            }
            Stage::SendCsw if self.held_csw == HeldCsw::None => self.send_csw(pipe),
            Stage::SendCsw => {}
            Stage::WaitCsw => self.set_stage(Stage::ReadCbw),
            Stage::ReadCbw | Stage::DataOut => {}
        }
    }

    fn init_session(&mut self) {
        self.stage = Stage::ReadCbw;
        self.cbw = CommandBlockWrapper::default();
        self.csw = CommandStatusWrapper::default();
        self.buf_len = 0;
        self.buf_pos = 0;
        self.lba = 0;
        self.blocks_left = 0;
        self.block_size = 0;
        self.chunk_max = 0;
        self.out_remaining = 0;
        self.held_csw = HeldCsw::None;
        self.sense = Sense::NO_SENSE;

        self.luns = [None; MAX_LUNS];
        for lun in 0..=self.max_lun() {
            self.luns[lun as usize] = self.query_capacity(lun);
        }
    }

    fn query_capacity(&mut self, lun: u8) -> Option<BlockCapacity> {
        match self.storage.capacity(lun) {
            Ok(cap) if cap.block_size > 0 && cap.block_size as usize <= N => Some(cap),
            Ok(cap) => {
                warn_class!(
                    "MSC> LUN {} block size {} does not fit {} byte buffer",
                    lun,
                    cap.block_size,
                    N
                );
                None
            }
            Err(e) => {
                trace_scsi!("MSC> LUN {} capacity: {}", lun, e);
                None
            }
        }
    }

    fn set_stage(&mut self, stage: Stage) {
        if self.stage != stage {
            trace_bot_stages!("BOT> {:?} -> {:?}", self.stage, stage);
        }
        self.stage = stage;
    }

    fn read_cbw<P: BulkPipe>(&mut self, pipe: &mut P) {
        let mps = min(pipe.max_packet_size(), N);
        let len = match pipe.read_packet(&mut self.buf[..mps]) {
            Ok(len) => len,
            Err(UsbError::WouldBlock) => return,
            Err(e) => {
                warn_class!("BOT> CBW read failed: {:?}", e);
                return;
            }
        };
        trace_bot_bytes!("BOT> OUT {} bytes", len);

        match CommandBlockWrapper::decode(&self.buf[..len]) {
            Ok(cbw) => self.start_command(cbw, pipe),
            Err(e) => {
                // Nothing is dispatched and no CSW is sent, the host has to
                // run reset recovery.
                warn_class!("BOT> invalid CBW: {}", e);
                if let Some((length, _)) = CommandBlockWrapper::peek_data_phase(&self.buf[..len]) {
                    if length > 0 {
                        pipe.stall_out();
                    }
                }
                pipe.stall_in();
                self.set_stage(Stage::ReadCbw);
            }
        }
    }

    fn start_command<P: BulkPipe>(&mut self, cbw: CommandBlockWrapper, pipe: &mut P) {
        trace_bot_headers!(
            "BOT> CBW tag={:#010x} len={} in={} lun={} op={:#04x}",
            cbw.tag,
            cbw.data_transfer_length,
            cbw.is_data_in(),
            cbw.lun,
            cbw.opcode()
        );

        self.cbw = cbw;
        self.csw = CommandStatusWrapper::for_command(&cbw);
        self.buf_len = 0;
        self.buf_pos = 0;
        self.blocks_left = 0;
        self.out_remaining = if cbw.is_data_in() {
            0
        } else {
            cbw.data_transfer_length
        };

        if let Err(sense) = self.dispatch(pipe) {
            self.fail_command(sense, pipe);
        }
    }

    /// Runs the command in `self.cbw`. On `Ok` the handler has moved the
    /// session to its next stage, on `Err` nothing has been sent yet.
    fn dispatch<P: BulkPipe>(&mut self, pipe: &mut P) -> Result<(), Sense> {
        if self.cbw.lun > self.max_lun() {
            return Err(Sense::LUN_NOT_SUPPORTED);
        }

        let cb = self.cbw.block;
        trace_scsi!("SCSI> {:02x?}", self.cbw.command());

        match cb[0] {
            scsi::TEST_UNIT_READY => {
                self.expect_no_data()?;
                self.lun_capacity()?;
                self.send_csw(pipe);
                Ok(())
            }
            scsi::REQUEST_SENSE => {
                self.expect_data_in()?;
                let len = scsi::request_sense(&mut self.buf, &self.sense);
                self.sense = Sense::NO_SENSE;
                self.reply(len, scsi::allocation_length_6(&cb), pipe);
                Ok(())
            }
            scsi::INQUIRY => self.inquiry(&cb, pipe),
            scsi::START_STOP_UNIT
            | scsi::PREVENT_ALLOW_MEDIUM_REMOVAL
            | scsi::SYNCHRONIZE_CACHE_10 => {
                self.expect_no_data()?;
                self.send_csw(pipe);
                Ok(())
            }
            scsi::MODE_SENSE_6 => {
                self.expect_data_in()?;
                let wp = self.storage.is_write_protected(self.cbw.lun);
                let len = scsi::mode_sense_6(&mut self.buf, wp);
                self.reply(len, scsi::allocation_length_6(&cb), pipe);
                Ok(())
            }
            scsi::MODE_SENSE_10 => {
                self.expect_data_in()?;
                let wp = self.storage.is_write_protected(self.cbw.lun);
                let len = scsi::mode_sense_10(&mut self.buf, wp);
                self.reply(len, scsi::allocation_length_10(&cb), pipe);
                Ok(())
            }
            scsi::READ_FORMAT_CAPACITIES => {
                self.expect_data_in()?;
                let cap = self.lun_capacity()?;
                let len =
                    scsi::read_format_capacities(&mut self.buf, cap.block_count, cap.block_size);
                self.reply(len, scsi::allocation_length_10(&cb), pipe);
                Ok(())
            }
            scsi::READ_CAPACITY_10 => {
                self.expect_data_in()?;
                let cap = self.lun_capacity()?;
                let len = scsi::read_capacity_10(&mut self.buf, cap.block_count, cap.block_size);
                self.reply(len, len, pipe);
                Ok(())
            }
            scsi::READ_10 => {
                let (lba, count) = scsi::rw10_params(&cb);
                self.start_read(lba, count, pipe)
            }
            scsi::READ_12 => {
                let (lba, count) = scsi::rw12_params(&cb);
                self.start_read(lba, count, pipe)
            }
            scsi::WRITE_10 => {
                let (lba, count) = scsi::rw10_params(&cb);
                self.start_write(lba, count, pipe)
            }
            scsi::WRITE_12 => {
                let (lba, count) = scsi::rw12_params(&cb);
                self.start_write(lba, count, pipe)
            }
            // No medium verification is implemented
            scsi::VERIFY_10 | scsi::VERIFY_12 => Err(Sense::INVALID_COMMAND),
            _ => Err(Sense::INVALID_COMMAND),
        }
    }

    fn inquiry<P: BulkPipe>(&mut self, cb: &[u8; 16], pipe: &mut P) -> Result<(), Sense> {
        self.expect_data_in()?;

        let evpd = cb[1] & 0x01 != 0;
        let cmddt = cb[1] & 0x02 != 0;
        let page = cb[2];

        let len = match (evpd, cmddt, page) {
            (false, false, 0) => scsi::inquiry(&mut self.buf, S::VENDOR, S::PRODUCT, S::REVISION),
            (true, false, 0) => scsi::inquiry_vpd_supported_pages(&mut self.buf),
            _ => return Err(Sense::INVALID_FIELD_IN_CDB),
        };
        self.reply(len, scsi::allocation_length_6(cb), pipe);
        Ok(())
    }

    fn start_read<P: BulkPipe>(&mut self, lba: u32, count: u32, pipe: &mut P) -> Result<(), Sense> {
        let cap = self.lun_capacity()?;
        self.check_range(&cap, lba, count)?;
        self.expect_block_data(&cap, count, true)?;
        self.plan_chunks(&cap, count, pipe.max_packet_size())?;

        if count == 0 {
            self.send_csw(pipe);
            return Ok(());
        }

        self.lba = lba;
        self.blocks_left = count;
        self.block_size = cap.block_size;
        self.set_stage(Stage::DataIn);
        self.fetch_read_chunk(pipe)
    }

    fn start_write<P: BulkPipe>(&mut self, lba: u32, count: u32, pipe: &mut P) -> Result<(), Sense> {
        let cap = self.lun_capacity()?;
        self.check_range(&cap, lba, count)?;
        self.expect_block_data(&cap, count, false)?;
        self.plan_chunks(&cap, count, pipe.max_packet_size())?;
        if self.storage.is_write_protected(self.cbw.lun) {
            return Err(Sense::WRITE_PROTECTED);
        }

        if count == 0 {
            self.send_csw(pipe);
            return Ok(());
        }

        self.lba = lba;
        self.blocks_left = count;
        self.block_size = cap.block_size;
        self.begin_write_chunk();
        self.set_stage(Stage::DataOut);
        Ok(())
    }

    /// Picks the chunk size of a `count` block transfer: the most whole
    /// blocks that fit the buffer and end on a packet boundary. A transfer
    /// that fits the buffer at once needs no boundary.
    fn plan_chunks(&mut self, cap: &BlockCapacity, count: u32, mps: usize) -> Result<(), Sense> {
        let block_size = cap.block_size as usize;
        let fit = N / block_size;
        if count as usize <= fit {
            self.chunk_max = count;
            return Ok(());
        }

        match (1..=fit).rev().find(|blocks| blocks * block_size % mps == 0) {
            Some(blocks) => {
                self.chunk_max = blocks as u32;
                Ok(())
            }
            None => {
                warn_class!(
                    "MSC> {} byte blocks cannot be streamed in {} byte packets",
                    block_size,
                    mps
                );
                Err(Sense::INVALID_FIELD_IN_CDB)
            }
        }
    }

    fn chunk_blocks(&self) -> u32 {
        min(self.blocks_left, self.chunk_max)
    }

    fn fetch_read_chunk<P: BulkPipe>(&mut self, pipe: &mut P) -> Result<(), Sense> {
        let blocks = self.chunk_blocks();
        let len = blocks as usize * self.block_size as usize;

        self.storage
            .read_blocks(self.cbw.lun, self.lba, &mut self.buf[..len])
            .map_err(|e| {
                warn_class!("MSC> read of {} blocks at {} failed: {}", blocks, self.lba, e);
                match e {
                    StorageError::NotPresent => Sense::MEDIUM_NOT_PRESENT,
                    StorageError::OutOfRange => Sense::LBA_OUT_OF_RANGE,
                    StorageError::Io => Sense::UNRECOVERED_READ_ERROR,
                }
            })?;

        self.lba += blocks;
        self.blocks_left -= blocks;
        self.csw.data_residue -= len as u32;
        self.buf_len = len;
        self.buf_pos = 0;
        self.send_next_packet(pipe);
        Ok(())
    }

    fn begin_write_chunk(&mut self) {
        self.buf_len = self.chunk_blocks() as usize * self.block_size as usize;
        self.buf_pos = 0;
    }

    fn data_out<P: BulkPipe>(&mut self, pipe: &mut P) {
        let len = match pipe.read_packet(&mut self.buf[self.buf_pos..self.buf_len]) {
            Ok(len) => len,
            Err(UsbError::WouldBlock) => return,
            Err(e) => {
                warn_class!("BOT> data OUT read failed: {:?}", e);
                return;
            }
        };
        trace_bot_bytes!("BOT> OUT {} bytes", len);

        self.buf_pos += len;
        self.out_remaining = self.out_remaining.saturating_sub(len as u32);
        if self.buf_pos < self.buf_len {
            return;
        }

        let blocks = (self.buf_len / self.block_size as usize) as u32;
        let written = self
            .storage
            .write_blocks(self.cbw.lun, self.lba, &self.buf[..self.buf_len]);
        if let Err(e) = written {
            warn_class!("MSC> write of {} blocks at {} failed: {}", blocks, self.lba, e);
            let sense = match e {
                StorageError::NotPresent => Sense::MEDIUM_NOT_PRESENT,
                StorageError::OutOfRange => Sense::LBA_OUT_OF_RANGE,
                StorageError::Io => Sense::WRITE_FAULT,
            };
            self.fail_command(sense, pipe);
            return;
        }

        self.lba += blocks;
        self.blocks_left -= blocks;
        self.csw.data_residue -= self.buf_len as u32;

        if self.blocks_left == 0 {
            self.send_csw(pipe);
        } else {
            self.begin_write_chunk();
        }
    }

    /// Streams the first `len` bytes of the buffer as the data phase of a
    /// command with a bounded reply.
    fn reply<P: BulkPipe>(&mut self, len: usize, allocation_length: usize, pipe: &mut P) {
        let len = min(
            min(len, allocation_length),
            self.cbw.data_transfer_length as usize,
        );
        self.csw.data_residue = self.cbw.data_transfer_length - len as u32;

        if len == 0 {
            self.send_csw(pipe);
            return;
        }

        self.buf_len = len;
        self.buf_pos = 0;
        self.set_stage(Stage::DataIn);
        self.send_next_packet(pipe);
    }

    fn send_next_packet<P: BulkPipe>(&mut self, pipe: &mut P) {
        let mps = pipe.max_packet_size();
        let end = min(self.buf_pos + mps, self.buf_len);

        let sent = match pipe.write_packet(&self.buf[self.buf_pos..end]) {
            Ok(len) => len,
            Err(e) => {
                warn_class!("BOT> data IN write failed: {:?}", e);
                return;
            }
        };
        trace_bot_bytes!("BOT> IN {} bytes", sent);
        self.buf_pos += sent;

        if self.buf_pos >= self.buf_len && self.blocks_left == 0 {
            // A full packet that ends a reply shorter than requested is
            // followed by a zero length packet from the next IN completion.
            let zlp_pending = sent == mps && self.csw.data_residue > 0;
            if !zlp_pending {
                self.set_stage(Stage::SendCsw);
            }
        }
    }

    fn send_csw<P: BulkPipe>(&mut self, pipe: &mut P) {
        let raw = self.csw.encode();
        match pipe.write_packet(&raw) {
            Ok(_) => {
                trace_bot_headers!(
                    "BOT> CSW tag={:#010x} residue={} status={:?}",
                    self.csw.tag,
                    self.csw.data_residue,
                    self.csw.status
                );
                self.set_stage(Stage::WaitCsw);
            }
            Err(e) => {
                // retried on the next IN completion
                warn_class!("BOT> CSW write failed: {:?}", e);
                self.set_stage(Stage::SendCsw);
            }
        }
    }

    fn fail_command<P: BulkPipe>(&mut self, sense: Sense, pipe: &mut P) {
        trace_scsi!(
            "SCSI> op {:#04x} failed: {:?}",
            self.cbw.opcode(),
            sense
        );
        self.sense = sense;
        self.csw.status = CommandStatus::Failed;
        self.blocks_left = 0;
        self.buf_len = 0;
        self.buf_pos = 0;

        if self.out_remaining > 0 {
            // host still has data for us that will never be consumed
            pipe.stall_out();
            self.out_remaining = 0;
        }
        if self.cbw.is_data_in() && self.csw.data_residue > 0 {
            // host still waits for data, the CSW follows the halt
            pipe.stall_in();
            self.held_csw = HeldCsw::Halted;
            self.set_stage(Stage::SendCsw);
            return;
        }
        self.send_csw(pipe);
    }

    fn expect_no_data(&self) -> Result<(), Sense> {
        if self.cbw.data_transfer_length != 0 {
            return Err(Sense::INVALID_FIELD_IN_CDB);
        }
        Ok(())
    }

    fn expect_data_in(&self) -> Result<(), Sense> {
        if self.cbw.data_transfer_length == 0 || !self.cbw.is_data_in() {
            return Err(Sense::INVALID_FIELD_IN_CDB);
        }
        Ok(())
    }

    fn expect_block_data(&self, cap: &BlockCapacity, count: u32, data_in: bool) -> Result<(), Sense> {
        let expected = count as u64 * cap.block_size as u64;
        let declared = self.cbw.data_transfer_length as u64;
        if declared != expected || (declared > 0 && self.cbw.is_data_in() != data_in) {
            return Err(Sense::INVALID_FIELD_IN_CDB);
        }
        Ok(())
    }

    fn check_range(&self, cap: &BlockCapacity, lba: u32, count: u32) -> Result<(), Sense> {
        if lba as u64 + count as u64 > cap.block_count as u64 {
            return Err(Sense::LBA_OUT_OF_RANGE);
        }
        Ok(())
    }

    fn lun_capacity(&mut self) -> Result<BlockCapacity, Sense> {
        let lun = self.cbw.lun;
        if !self.storage.is_ready(lun) {
            return Err(Sense::MEDIUM_NOT_PRESENT);
        }
        if self.luns[lun as usize].is_none() {
            // medium may have shown up after the session started
            self.luns[lun as usize] = self.query_capacity(lun);
        }
        self.luns[lun as usize].ok_or(Sense::MEDIUM_NOT_PRESENT)
    }
}
