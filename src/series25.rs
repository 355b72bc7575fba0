//! Cooperative driver for 25-series SPI Flash chips.
//!
//! Unlike a blocking driver, every operation here is a request object
//! submitted to the driver and carried to completion by the fast tick, one
//! bounded step per call. SPI exchanges are started on the bus and reported
//! finished through [`SpiEvents`] from interrupt context; the 1 ms tick
//! arms a per-transaction timeout. At most one request is in flight; a
//! completed request is handed back through its callback and
//! [`Flash::take_done`].

use crate::error::FlashError;
use crate::utils::{block_space, u24_be};
use crate::{SpiBus, SpiEvents};
use bitflags::bitflags;
use core::fmt;
use embedded_hal::digital::v2::OutputPin;

/// Slow-tick units allowed per SPI transaction.
const SPI_TIMEOUT_TICKS: u8 = 10;

#[allow(unused)] // TODO support 4-byte addressing for >16 MiB parts
enum Opcode {
    /// Read 16-bit manufacturer ID and 8-bit device ID.
    ReadJedecId = 0x9F,
    /// Set the write enable latch.
    WriteEnable = 0x06,
    /// Read the 8-bit status register.
    ReadStatus = 0x05,
    Read = 0x03,
    PageProg = 0x02,
    SectorErase = 0x20,
    ChipErase = 0x60,
}

bitflags! {
    /// Status register bits.
    pub struct Status: u8 {
        /// Erase or write in progress.
        const BUSY = 1 << 0;
        /// Status of the **W**rite **E**nable **L**atch.
        const WEL = 1 << 1;
        /// The 3 protection region bits.
        const PROT = 0b00011100;
        /// **S**tatus **R**egister **W**rite **D**isable bit.
        const SRWD = 1 << 7;
    }
}

/// Geometry and identity of a configured flash device.
#[derive(Debug, Clone, Copy)]
pub struct FlashInfo {
    /// 24-bit JEDEC manufacturer/device id.
    pub jedec_id: u32,
    /// Total device size in bytes.
    pub flash_size: u32,
    /// Programming granularity; PAGE-PROGRAM may not cross page ends.
    pub page_size: u32,
    /// Erase granularity.
    pub sector_size: u32,
}

/// Devices the driver knows the geometry of, keyed by JEDEC id.
const SUPPORTED_DEVICES: &[FlashInfo] = &[
    // Winbond W25Q32
    FlashInfo {
        jedec_id: 0xEF4016,
        flash_size: 0x40_0000,
        page_size: 0x100,
        sector_size: 0x1000,
    },
    // Winbond W25Q64
    FlashInfo {
        jedec_id: 0xEF4017,
        flash_size: 0x80_0000,
        page_size: 0x100,
        sector_size: 0x1000,
    },
    // Winbond W25Q128
    FlashInfo {
        jedec_id: 0xEF4018,
        flash_size: 0x100_0000,
        page_size: 0x100,
        sector_size: 0x1000,
    },
];

/// Identifies who submitted a request, so a second submission can be told
/// apart from a competing one (`Busy` vs `InUse`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner(pub u8);

enum Op<'a> {
    GetId,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    EraseSector,
    EraseChip,
}

/// A single flash operation: parameters in, result and outputs back.
///
/// The request is moved into the driver on submission and returned through
/// [`Flash::take_done`] once `is_complete`. The completion callback (if
/// any) has run by then, exactly once, with `result` already set. The
/// callback must not try to reach back into the driver; submit follow-up
/// work from tick context after collecting the request.
pub struct FlashRequest<'a> {
    owner: Owner,
    address: u32,
    op: Op<'a>,
    jedec_id: [u8; 3],
    result: Option<Result<(), FlashError>>,
    complete: bool,
    callback: Option<fn(&mut FlashRequest<'a>)>,
}

impl<'a> FlashRequest<'a> {
    fn new(owner: Owner, address: u32, op: Op<'a>) -> Self {
        Self {
            owner,
            address,
            op,
            jedec_id: [0; 3],
            result: None,
            complete: false,
            callback: None,
        }
    }

    /// Request the 3-byte JEDEC identification.
    pub fn get_id(owner: Owner) -> Self {
        Self::new(owner, 0, Op::GetId)
    }

    /// Read `data.len()` bytes starting at `address`.
    pub fn read(owner: Owner, address: u32, data: &'a mut [u8]) -> Self {
        Self::new(owner, address, Op::Read(data))
    }

    /// Program `data` starting at `address`. The target range must have
    /// been erased; the driver splits the transfer at page ends.
    pub fn write(owner: Owner, address: u32, data: &'a [u8]) -> Self {
        Self::new(owner, address, Op::Write(data))
    }

    /// Erase the sector containing `address`.
    pub fn erase_sector(owner: Owner, address: u32) -> Self {
        Self::new(owner, address, Op::EraseSector)
    }

    /// Erase the entire device.
    pub fn erase_chip(owner: Owner) -> Self {
        Self::new(owner, 0, Op::EraseChip)
    }

    /// Attach a completion callback, run once in tick context.
    pub fn with_callback(mut self, callback: fn(&mut FlashRequest<'a>)) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// True once the driver has finished with the request.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Outcome of the operation; `None` until complete.
    pub fn result(&self) -> Option<Result<(), FlashError>> {
        self.result
    }

    /// The identification delivered by a completed `get_id`, as the usual
    /// 24-bit value (manufacturer byte high).
    pub fn jedec_id(&self) -> u32 {
        u24_be(&self.jedec_id, 0)
    }

    /// The request's data region (read destination or write source).
    pub fn data(&self) -> &[u8] {
        match &self.op {
            Op::Read(buf) => &buf[..],
            Op::Write(buf) => &buf[..],
            _ => &[],
        }
    }

    /// Recover the borrowed read buffer from a collected request.
    pub fn into_read_data(self) -> Option<&'a mut [u8]> {
        match self.op {
            Op::Read(buf) => Some(buf),
            _ => None,
        }
    }
}

impl fmt::Debug for FlashRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match &self.op {
            Op::GetId => "get_id",
            Op::Read(_) => "read",
            Op::Write(_) => "write",
            Op::EraseSector => "erase_sector",
            Op::EraseChip => "erase_chip",
        };
        f.debug_struct("FlashRequest")
            .field("op", &op)
            .field("owner", &self.owner)
            .field("address", &self.address)
            .field("complete", &self.complete)
            .field("result", &self.result)
            .field("jedec", &format_args!("{:06x}", u24_be(&self.jedec_id, 0)))
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,

    IdStart,
    IdAwait,

    ReadCommand,
    ReadCommandAwait,
    ReadData,
    ReadDataAwait,

    WriteEnable,
    WriteEnableAwait,
    WriteCommand,
    WriteCommandAwait,
    WriteData,
    WriteDataAwait,
    WriteStatus,
    WriteStatusAwait,
    WriteCheck,

    EraseEnable,
    EraseEnableAwait,
    EraseCommand,
    EraseCommandAwait,
    EraseStatus,
    EraseStatusAwait,
    EraseCheck,
}

/// Driver for 25-series SPI Flash chips.
///
/// # Type Parameters
///
/// * **`SPI`**: The SPI master to which the flash chip is attached.
/// * **`CS`**: The **C**hip-**S**elect line attached to the `\CS`/`\CE` pin
///   of the flash chip.
///
/// Chip-select errors are ignored; wire the driver to an infallible pin.
pub struct Flash<'a, SPI: SpiBus, CS: OutputPin> {
    spi: SPI,
    cs: CS,
    events: &'a SpiEvents,
    info: Option<FlashInfo>,
    state: State,
    spi_tmr: u8,
    offset: u32,
    cmd: [u8; 20],
    active: Option<FlashRequest<'a>>,
    done: Option<FlashRequest<'a>>,
}

impl<'a, SPI: SpiBus, CS: OutputPin> Flash<'a, SPI, CS> {
    /// Creates a new 25-series flash driver.
    ///
    /// # Parameters
    ///
    /// * **`spi`**: An SPI master. Must be configured to operate in the
    ///   correct mode for the device.
    /// * **`cs`**: The **C**hip-**S**elect Pin connected to the `\CS`/`\CE`
    ///   pin of the flash chip. Will be driven low when accessing the
    ///   device.
    /// * **`events`**: The completion flags the host's transfer-done
    ///   interrupt handlers raise.
    pub fn new(spi: SPI, cs: CS, events: &'a SpiEvents) -> Self {
        Self {
            spi,
            cs,
            events,
            info: None,
            state: State::Idle,
            spi_tmr: 0,
            offset: 0,
            cmd: [0; 20],
            active: None,
            done: None,
        }
    }

    /// Look up the device geometry for `jedec_id` (typically delivered by a
    /// completed `get_id` request).
    pub fn configure(&mut self, jedec_id: u32) -> Result<(), FlashError> {
        for device in SUPPORTED_DEVICES {
            if device.jedec_id == jedec_id {
                info!("flash: configured {:06x}, {} bytes", jedec_id, device.flash_size);
                self.info = Some(*device);
                return Ok(());
            }
        }
        Err(FlashError::NotSupported)
    }

    /// Geometry of the configured device.
    pub fn info(&self) -> Option<&FlashInfo> {
        self.info.as_ref()
    }

    /// True once `configure` has accepted a device.
    pub fn is_ready(&self) -> bool {
        self.info.is_some()
    }

    /// Give back the bus and chip-select pin.
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// Submit a request. On acceptance the first SPI phase starts
    /// immediately; the fast tick carries the operation from there. The
    /// request is handed back with the refusal code if the driver is
    /// occupied (`Busy` for this owner, `InUse` for another), or with
    /// `NotSupported` for a write before `configure`.
    pub fn submit(
        &mut self,
        mut req: FlashRequest<'a>,
    ) -> Result<(), (FlashError, FlashRequest<'a>)> {
        let occupant = self.active.as_ref().or(self.done.as_ref()).map(|r| r.owner);
        if let Some(owner) = occupant {
            let code = if owner == req.owner {
                FlashError::Busy
            } else {
                FlashError::InUse
            };
            return Err((code, req));
        }

        // Page arithmetic needs the device geometry up front.
        if matches!(req.op, Op::Write(_)) && self.info.is_none() {
            return Err((FlashError::NotSupported, req));
        }

        self.state = match req.op {
            Op::GetId => State::IdStart,
            Op::Read(_) => State::ReadCommand,
            Op::Write(_) => State::WriteEnable,
            Op::EraseSector | Op::EraseChip => State::EraseEnable,
        };
        req.complete = false;
        req.result = None;
        self.offset = 0;
        self.active = Some(req);
        self.service();
        Ok(())
    }

    /// Collect a completed request belonging to `owner`.
    pub fn take_done(&mut self, owner: Owner) -> Option<FlashRequest<'a>> {
        if self.done.as_ref().map(|r| r.owner) == Some(owner) {
            self.done.take()
        } else {
            None
        }
    }

    /// Fast tick: advance the active state machine by one bounded step.
    pub fn tick(&mut self) {
        if self.active.is_some() {
            self.service();
        }
    }

    /// Slow (1 ms) tick: run the transaction timeout.
    pub fn tick_1ms(&mut self) {
        if self.spi_tmr > 0 {
            self.spi_tmr -= 1;
        }
    }

    fn service(&mut self) {
        let mut req = match self.active.take() {
            Some(req) => req,
            None => return,
        };
        match self.drive(&mut req) {
            None => self.active = Some(req),
            Some(result) => {
                self.state = State::Idle;
                req.result = Some(result);
                req.complete = true;
                if let Some(callback) = req.callback {
                    callback(&mut req);
                }
                self.done = Some(req);
            }
        }
    }

    /// Start a full-duplex exchange of the first `len` command bytes.
    /// A refused start leaves the state untouched; retried next tick.
    fn begin_transfer(&mut self, len: usize) -> bool {
        self.events.clear_txrx_done();
        if self.spi.transfer(&mut self.cmd[..len]).is_ok() {
            self.spi_tmr = SPI_TIMEOUT_TICKS;
            true
        } else {
            false
        }
    }

    fn load_address(&mut self, opcode: Opcode, address: u32) {
        self.cmd[0] = opcode as u8;
        self.cmd[1] = (address >> 16) as u8;
        self.cmd[2] = (address >> 8) as u8;
        self.cmd[3] = address as u8;
    }

    /// One pass over the state machine. `Some` ends the request; states
    /// that the source advanced by switch fallthrough loop back instead of
    /// waiting a tick.
    fn drive(&mut self, req: &mut FlashRequest<'a>) -> Option<Result<(), FlashError>> {
        loop {
            match self.state {
                State::Idle => return None,

                // GET ID: one 4-byte exchange under a single chip select.
                State::IdStart => {
                    self.cs.set_low().ok();
                    self.cmd[..4].copy_from_slice(&[Opcode::ReadJedecId as u8, 0, 0, 0]);
                    if self.begin_transfer(4) {
                        self.state = State::IdAwait;
                    }
                    return None;
                }
                State::IdAwait => {
                    if self.events.take_txrx_done() {
                        req.jedec_id.copy_from_slice(&self.cmd[1..4]);
                        self.cs.set_high().ok();
                        trace!("flash: jedec id {:06x}", req.jedec_id());
                        return Some(Ok(()));
                    }
                    if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }

                // READ: command+address exchange, then the data exchange
                // into the caller's buffer, all under one chip select.
                State::ReadCommand => {
                    self.cs.set_low().ok();
                    self.load_address(Opcode::Read, req.address);
                    if self.begin_transfer(4) {
                        self.state = State::ReadCommandAwait;
                    }
                    return None;
                }
                State::ReadCommandAwait => {
                    if self.events.take_txrx_done() {
                        self.state = State::ReadData;
                        continue;
                    }
                    if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::ReadData => {
                    self.events.clear_txrx_done();
                    if let Op::Read(buf) = &mut req.op {
                        if self.spi.transfer(buf).is_ok() {
                            self.spi_tmr = SPI_TIMEOUT_TICKS;
                            self.state = State::ReadDataAwait;
                        }
                    }
                    return None;
                }
                State::ReadDataAwait => {
                    if self.events.take_txrx_done() {
                        self.cs.set_high().ok();
                        return Some(Ok(()));
                    }
                    if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }

                // WRITE: per page, WRITE-ENABLE, PAGE-PROGRAM with a
                // payload clipped at the page end, then poll status until
                // BSY and WEL clear; repeat while bytes remain.
                State::WriteEnable => {
                    self.cs.set_low().ok();
                    self.cmd[0] = Opcode::WriteEnable as u8;
                    if self.begin_transfer(1) {
                        self.state = State::WriteEnableAwait;
                    }
                    return None;
                }
                State::WriteEnableAwait => {
                    if self.events.take_txrx_done() {
                        self.cs.set_high().ok();
                        self.state = State::WriteCommand;
                    } else if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::WriteCommand => {
                    self.cs.set_low().ok();
                    self.load_address(Opcode::PageProg, req.address + self.offset);
                    self.events.clear_tx_done();
                    if self.spi.write(&self.cmd[..4]).is_ok() {
                        self.spi_tmr = SPI_TIMEOUT_TICKS;
                        self.state = State::WriteCommandAwait;
                    }
                    return None;
                }
                State::WriteCommandAwait => {
                    if self.events.take_tx_done() {
                        self.state = State::WriteData;
                        continue;
                    }
                    if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::WriteData => {
                    let page_size = match self.info {
                        Some(info) => info.page_size,
                        None => return Some(Err(FlashError::NotSupported)),
                    };
                    if let Op::Write(data) = &req.op {
                        let remaining = data.len() as u32 - self.offset;
                        let length = remaining.min(block_space(req.address + self.offset, page_size));
                        let start = self.offset as usize;
                        self.events.clear_tx_done();
                        if self.spi.write(&data[start..start + length as usize]).is_ok() {
                            self.offset += length;
                            self.spi_tmr = SPI_TIMEOUT_TICKS;
                            self.state = State::WriteDataAwait;
                        }
                    }
                    return None;
                }
                State::WriteDataAwait => {
                    if !self.spi.is_busy() {
                        self.cs.set_high().ok();
                        self.state = State::WriteStatus;
                    } else if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::WriteStatus => {
                    self.cs.set_low().ok();
                    self.cmd[0] = Opcode::ReadStatus as u8;
                    self.cmd[1] = 0;
                    if self.begin_transfer(2) {
                        self.state = State::WriteStatusAwait;
                    }
                    return None;
                }
                State::WriteStatusAwait => {
                    if self.events.take_txrx_done() {
                        self.state = State::WriteCheck;
                        continue;
                    }
                    if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::WriteCheck => {
                    self.cs.set_high().ok();
                    let status = Status::from_bits_truncate(self.cmd[1]);
                    if status.intersects(Status::BUSY | Status::WEL) {
                        self.state = State::WriteStatus;
                        return None;
                    }
                    let size = match &req.op {
                        Op::Write(data) => data.len() as u32,
                        _ => 0,
                    };
                    if self.offset < size {
                        self.state = State::WriteEnable;
                        return None;
                    }
                    return Some(Ok(()));
                }

                // ERASE: WRITE-ENABLE, then SECTOR-ERASE+address or
                // CHIP-ERASE, then the same status poll as a write.
                State::EraseEnable => {
                    self.cs.set_low().ok();
                    self.cmd[0] = Opcode::WriteEnable as u8;
                    if self.begin_transfer(1) {
                        self.state = State::EraseEnableAwait;
                    }
                    return None;
                }
                State::EraseEnableAwait => {
                    if self.events.take_txrx_done() {
                        self.cs.set_high().ok();
                        self.state = State::EraseCommand;
                    } else if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::EraseCommand => {
                    self.cs.set_low().ok();
                    let length = match req.op {
                        Op::EraseChip => {
                            self.cmd[0] = Opcode::ChipErase as u8;
                            1
                        }
                        _ => {
                            self.load_address(Opcode::SectorErase, req.address);
                            4
                        }
                    };
                    if self.begin_transfer(length) {
                        self.state = State::EraseCommandAwait;
                    }
                    return None;
                }
                State::EraseCommandAwait => {
                    if self.events.take_txrx_done() {
                        self.cs.set_high().ok();
                        self.state = State::EraseStatus;
                    } else if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::EraseStatus => {
                    self.cs.set_low().ok();
                    self.cmd[0] = Opcode::ReadStatus as u8;
                    self.cmd[1] = 0;
                    if self.begin_transfer(2) {
                        self.state = State::EraseStatusAwait;
                    }
                    return None;
                }
                State::EraseStatusAwait => {
                    if self.events.take_txrx_done() {
                        self.state = State::EraseCheck;
                        continue;
                    }
                    if self.spi_tmr == 0 {
                        self.cs.set_high().ok();
                        return Some(Err(FlashError::Timeout));
                    }
                    return None;
                }
                State::EraseCheck => {
                    self.cs.set_high().ok();
                    let status = Status::from_bits_truncate(self.cmd[1]);
                    if status.intersects(Status::BUSY | Status::WEL) {
                        self.state = State::EraseStatus;
                        return None;
                    }
                    return Some(Ok(()));
                }
            }
        }
    }
}

impl<SPI: SpiBus, CS: OutputPin> fmt::Debug for Flash<'_, SPI, CS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flash")
            .field("info", &self.info)
            .field("busy", &self.active.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{drive_to_completion, Event, Harness};

    const APP: Owner = Owner(1);
    const OTHER: Owner = Owner(2);

    #[test]
    fn get_id_and_configure_w25q64() {
        let harness = Harness::new(0x2000);
        let mut flash = harness.flash();

        flash.submit(FlashRequest::get_id(APP)).unwrap();
        let req = drive_to_completion(&mut flash, APP);
        assert_eq!(req.result(), Some(Ok(())));
        assert_eq!(req.jedec_id(), 0xEF4017);

        flash.configure(req.jedec_id()).unwrap();
        let info = flash.info().unwrap();
        assert_eq!(info.flash_size, 0x80_0000);
        assert_eq!(info.page_size, 0x100);
        assert_eq!(info.sector_size, 0x1000);

        // Chip select bracketed the single exchange.
        assert_eq!(
            harness.events_seen(),
            vec![Event::CsLow, Event::JedecId, Event::CsHigh]
        );
    }

    #[test]
    fn configure_unknown_id_is_refused() {
        let harness = Harness::new(0x2000);
        let mut flash = harness.flash();
        assert_eq!(flash.configure(0x123456), Err(FlashError::NotSupported));
        assert!(!flash.is_ready());
    }

    #[test]
    fn read_returns_memory_contents() {
        let harness = Harness::new(0x2000);
        harness.load(0x120, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut flash = harness.flash();

        let mut buf = [0u8; 8];
        flash
            .submit(FlashRequest::read(APP, 0x120, &mut buf))
            .unwrap();
        let req = drive_to_completion(&mut flash, APP);
        assert_eq!(req.result(), Some(Ok(())));
        assert_eq!(req.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        let recovered = req.into_read_data().unwrap();
        assert_eq!(recovered, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn write_splits_at_page_boundary() {
        // Scenario: 16 bytes at 0xF8 with 256-byte pages must program
        // 8 bytes at 0xF8 and 8 bytes at 0x100, each with its own
        // WRITE-ENABLE and status poll.
        let harness = Harness::new(0x2000);
        let mut flash = harness.flash();
        flash.configure(0xEF4017).unwrap();

        let data = [0xAA; 16];
        flash
            .submit(FlashRequest::write(APP, 0xF8, &data))
            .unwrap();
        let req = drive_to_completion(&mut flash, APP);
        assert_eq!(req.result(), Some(Ok(())));

        assert_eq!(harness.mem(0xF8, 16), vec![0xAA; 16]);
        let programs: Vec<Event> = harness
            .events_seen()
            .into_iter()
            .filter(|e| matches!(e, Event::WriteEnable | Event::PageProgram { .. }))
            .collect();
        assert_eq!(
            programs,
            vec![
                Event::WriteEnable,
                Event::PageProgram { addr: 0xF8, len: 8 },
                Event::WriteEnable,
                Event::PageProgram { addr: 0x100, len: 8 },
            ]
        );
        // Status was polled after each page.
        let polls = harness
            .events_seen()
            .iter()
            .filter(|e| matches!(e, Event::ReadStatus))
            .count();
        assert!(polls >= 2);
    }

    #[test]
    fn write_within_one_page_is_single_program() {
        let harness = Harness::new(0x2000);
        let mut flash = harness.flash();
        flash.configure(0xEF4017).unwrap();

        let data = [0x55; 32];
        flash.submit(FlashRequest::write(APP, 0x200, &data)).unwrap();
        let req = drive_to_completion(&mut flash, APP);
        assert_eq!(req.result(), Some(Ok(())));

        let programs = harness
            .events_seen()
            .iter()
            .filter(|e| matches!(e, Event::PageProgram { .. }))
            .count();
        assert_eq!(programs, 1);
        assert_eq!(harness.mem(0x200, 32), vec![0x55; 32]);
    }

    #[test]
    fn write_before_configure_is_refused() {
        let harness = Harness::new(0x2000);
        let mut flash = harness.flash();
        let data = [0u8; 4];
        let err = flash
            .submit(FlashRequest::write(APP, 0, &data))
            .unwrap_err();
        assert_eq!(err.0, FlashError::NotSupported);
    }

    #[test]
    fn erase_sector_blanks_the_sector() {
        let harness = Harness::new(0x2000);
        harness.load(0x1000, &[7; 64]);
        let mut flash = harness.flash();
        flash.configure(0xEF4017).unwrap();

        flash
            .submit(FlashRequest::erase_sector(APP, 0x1000))
            .unwrap();
        let req = drive_to_completion(&mut flash, APP);
        assert_eq!(req.result(), Some(Ok(())));
        assert_eq!(harness.mem(0x1000, 64), vec![0xFF; 64]);
        assert!(harness
            .events_seen()
            .contains(&Event::EraseSector { addr: 0x1000 }));
    }

    #[test]
    fn erase_chip_blanks_everything() {
        let harness = Harness::new(0x2000);
        harness.load(0, &[1; 16]);
        harness.load(0x1FF0, &[2; 16]);
        let mut flash = harness.flash();

        flash.submit(FlashRequest::erase_chip(APP)).unwrap();
        let req = drive_to_completion(&mut flash, APP);
        assert_eq!(req.result(), Some(Ok(())));
        assert_eq!(harness.mem(0, 16), vec![0xFF; 16]);
        assert_eq!(harness.mem(0x1FF0, 16), vec![0xFF; 16]);
    }

    #[test]
    fn busy_and_in_use_refusals() {
        let harness = Harness::new(0x2000);
        let mut flash = harness.flash();

        flash.submit(FlashRequest::get_id(APP)).unwrap();
        let (code, _) = flash.submit(FlashRequest::get_id(APP)).unwrap_err();
        assert_eq!(code, FlashError::Busy);
        let (code, _) = flash.submit(FlashRequest::get_id(OTHER)).unwrap_err();
        assert_eq!(code, FlashError::InUse);

        let req = drive_to_completion(&mut flash, APP);
        assert!(req.is_complete());
        // Slot now free for anyone.
        flash.submit(FlashRequest::get_id(OTHER)).unwrap();
        let req = drive_to_completion(&mut flash, OTHER);
        assert_eq!(req.result(), Some(Ok(())));
    }

    #[test]
    fn transaction_timeout_fails_request() {
        let harness = Harness::new(0x2000);
        let mut flash = harness.stalled_flash();

        flash.submit(FlashRequest::get_id(APP)).unwrap();
        for _ in 0..SPI_TIMEOUT_TICKS {
            flash.tick();
            flash.tick_1ms();
        }
        flash.tick();
        let req = flash.take_done(APP).expect("request should have timed out");
        assert_eq!(req.result(), Some(Err(FlashError::Timeout)));
        // Chip select was released on the way out.
        assert_eq!(harness.events_seen().last(), Some(&Event::CsHigh));
    }

    #[test]
    fn callback_runs_once_with_result_set() {
        use core::sync::atomic::{AtomicU8, Ordering};
        static CALLS: AtomicU8 = AtomicU8::new(0);

        fn on_complete(req: &mut FlashRequest<'_>) {
            assert!(req.is_complete());
            assert_eq!(req.result(), Some(Ok(())));
            CALLS.fetch_add(1, Ordering::Relaxed);
        }

        CALLS.store(0, Ordering::Relaxed);
        let harness = Harness::new(0x2000);
        let mut flash = harness.flash();
        flash
            .submit(FlashRequest::get_id(APP).with_callback(on_complete))
            .unwrap();
        let _ = drive_to_completion(&mut flash, APP);
        for _ in 0..5 {
            flash.tick();
        }
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }
}
