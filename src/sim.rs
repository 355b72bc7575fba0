//! Scripted SPI hardware and host link used by the unit tests.
//!
//! `SimBus` speaks the 25-series wire protocol against an in-memory NOR
//! image: commands decode exactly as a real part would see them, programs
//! respect the write-enable latch and wrap inside the page, and the status
//! register reports busy for a couple of polls after each program/erase so
//! the driver's poll loop actually loops.

use crate::error::LinkFull;
use crate::series25::{Flash, FlashRequest, Owner};
use crate::utils::u24_be;
use crate::{HostLink, SpiBus, SpiEvents};
use core::convert::Infallible;
use embedded_hal::digital::v2::OutputPin;
use std::cell::RefCell;
use std::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    CsLow,
    CsHigh,
    JedecId,
    Read { addr: u32, len: usize },
    WriteEnable,
    PageProgram { addr: u32, len: usize },
    ReadStatus,
    EraseSector { addr: u32 },
    EraseChip,
}

/// Owns the flash image, the event log and the completion flags; hands out
/// driver instances wired to them.
pub(crate) struct Harness {
    events: SpiEvents,
    log: RefCell<Vec<Event>>,
    mem: RefCell<Vec<u8>>,
}

impl Harness {
    pub fn new(size: usize) -> Self {
        Harness {
            events: SpiEvents::new(),
            log: RefCell::new(Vec::new()),
            mem: RefCell::new(vec![0xFF; size]),
        }
    }

    /// Preload bytes into the flash image.
    pub fn load(&self, addr: usize, data: &[u8]) {
        self.mem.borrow_mut()[addr..addr + data.len()].copy_from_slice(data);
    }

    /// Snapshot a range of the flash image.
    pub fn mem(&self, addr: usize, len: usize) -> Vec<u8> {
        self.mem.borrow()[addr..addr + len].to_vec()
    }

    pub fn events_seen(&self) -> Vec<Event> {
        self.log.borrow().clone()
    }

    /// A driver over the simulated device (responds as a W25Q64).
    pub fn flash(&self) -> Flash<'_, SimBus<'_>, SimPin<'_>> {
        Flash::new(SimBus::new(self), SimPin { harness: self }, &self.events)
    }

    /// A driver over a bus that accepts transfers but never completes them.
    pub fn stalled_flash(&self) -> Flash<'_, StallBus, SimPin<'_>> {
        Flash::new(StallBus, SimPin { harness: self }, &self.events)
    }

    /// A driver whose first `stalls` exchanges hang (completing only by
    /// driver timeout); everything after behaves normally.
    pub fn flaky_flash(&self, stalls: u32) -> Flash<'_, FlakyBus<'_>, SimPin<'_>> {
        let bus = FlakyBus {
            inner: SimBus::new(self),
            stalls_remaining: stalls,
        };
        Flash::new(bus, SimPin { harness: self }, &self.events)
    }
}

enum Pending {
    ReadData { addr: u32 },
    Program { addr: u32 },
}

pub(crate) struct SimBus<'h> {
    harness: &'h Harness,
    pending: Option<Pending>,
    wel: bool,
    busy_polls: u8,
}

impl<'h> SimBus<'h> {
    fn new(harness: &'h Harness) -> Self {
        SimBus {
            harness,
            pending: None,
            wel: false,
            busy_polls: 0,
        }
    }

    fn log(&self, event: Event) {
        self.harness.log.borrow_mut().push(event);
    }

    fn exchange(&mut self, words: &mut [u8]) {
        if let Some(pending) = self.pending.take() {
            match pending {
                Pending::ReadData { addr } => {
                    // The image may be smaller than the device; the tail
                    // reads erased.
                    let mem = self.harness.mem.borrow();
                    for (i, word) in words.iter_mut().enumerate() {
                        *word = mem.get(addr as usize + i).copied().unwrap_or(0xFF);
                    }
                    self.log(Event::Read {
                        addr,
                        len: words.len(),
                    });
                }
                Pending::Program { addr } => {
                    assert!(self.wel, "PAGE-PROGRAM without WRITE-ENABLE");
                    let mut mem = self.harness.mem.borrow_mut();
                    let page_base = (addr & !0xFF) as usize;
                    for (i, &word) in words.iter().enumerate() {
                        let slot = page_base + ((addr as usize & 0xFF) + i) % 0x100;
                        // NOR programming can only clear bits
                        if let Some(byte) = mem.get_mut(slot) {
                            *byte &= word;
                        }
                    }
                    self.log(Event::PageProgram {
                        addr,
                        len: words.len(),
                    });
                    self.wel = false;
                    self.busy_polls = 2;
                }
            }
            return;
        }

        match words[0] {
            0x9F => {
                words[1..4].copy_from_slice(&[0xEF, 0x40, 0x17]);
                self.log(Event::JedecId);
            }
            0x03 => {
                self.pending = Some(Pending::ReadData {
                    addr: u24_be(words, 1),
                });
            }
            0x02 => {
                self.pending = Some(Pending::Program {
                    addr: u24_be(words, 1),
                });
            }
            0x06 => {
                self.wel = true;
                self.log(Event::WriteEnable);
            }
            0x05 => {
                let status = if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    0x03 // BUSY + WEL while the internal operation runs
                } else if self.wel {
                    0x02
                } else {
                    0x00
                };
                if words.len() > 1 {
                    words[1] = status;
                }
                self.log(Event::ReadStatus);
            }
            0x20 => {
                assert!(self.wel, "SECTOR-ERASE without WRITE-ENABLE");
                let addr = u24_be(words, 1);
                let mut mem = self.harness.mem.borrow_mut();
                let base = (addr as usize & !0xFFF).min(mem.len());
                let end = (base + 0x1000).min(mem.len());
                for byte in mem[base..end].iter_mut() {
                    *byte = 0xFF;
                }
                self.log(Event::EraseSector { addr });
                self.wel = false;
                self.busy_polls = 2;
            }
            0x60 => {
                assert!(self.wel, "CHIP-ERASE without WRITE-ENABLE");
                for byte in self.harness.mem.borrow_mut().iter_mut() {
                    *byte = 0xFF;
                }
                self.log(Event::EraseChip);
                self.wel = false;
                self.busy_polls = 2;
            }
            _ => {}
        }
    }
}

impl SpiBus for SimBus<'_> {
    type Error = Infallible;

    fn transfer(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.exchange(words);
        self.harness.events.notify_txrx_done();
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        let mut copy = words.to_vec();
        self.exchange(&mut copy);
        self.harness.events.notify_tx_done();
        Ok(())
    }

    fn is_busy(&self) -> bool {
        false
    }
}

/// Accepts every transfer and never signals completion.
pub(crate) struct StallBus;

impl SpiBus for StallBus {
    type Error = Infallible;

    fn transfer(&mut self, _words: &mut [u8]) -> Result<(), Infallible> {
        Ok(())
    }

    fn write(&mut self, _words: &[u8]) -> Result<(), Infallible> {
        Ok(())
    }

    fn is_busy(&self) -> bool {
        false
    }
}

/// Hangs the first few exchanges, then hands over to the real model.
pub(crate) struct FlakyBus<'h> {
    inner: SimBus<'h>,
    stalls_remaining: u32,
}

impl SpiBus for FlakyBus<'_> {
    type Error = Infallible;

    fn transfer(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        if self.stalls_remaining > 0 {
            self.stalls_remaining -= 1;
            return Ok(());
        }
        self.inner.transfer(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        if self.stalls_remaining > 0 {
            self.stalls_remaining -= 1;
            return Ok(());
        }
        self.inner.write(words)
    }

    fn is_busy(&self) -> bool {
        false
    }
}

pub(crate) struct SimPin<'h> {
    harness: &'h Harness,
}

impl OutputPin for SimPin<'_> {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.harness.log.borrow_mut().push(Event::CsLow);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.harness.log.borrow_mut().push(Event::CsHigh);
        Ok(())
    }
}

/// Tick the driver until `owner`'s request completes.
pub(crate) fn drive_to_completion<'a, SPI: SpiBus, CS: OutputPin>(
    flash: &mut Flash<'a, SPI, CS>,
    owner: Owner,
) -> FlashRequest<'a> {
    for _ in 0..100_000 {
        if let Some(req) = flash.take_done(owner) {
            return req;
        }
        flash.tick();
    }
    panic!("flash request never completed");
}

/// A host link that records outgoing frames; can be told to refuse sends.
pub(crate) struct RecordingLink {
    pub sent: Vec<Vec<u8>>,
    pub refuse: bool,
}

impl RecordingLink {
    pub fn new() -> Self {
        RecordingLink {
            sent: Vec::new(),
            refuse: false,
        }
    }
}

impl HostLink for RecordingLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkFull> {
        if self.refuse {
            return Err(LinkFull);
        }
        self.sent.push(frame.to_vec());
        Ok(())
    }
}

/// Build the on-flash image of one segment: 19-byte header (STX, id,
/// order, version, length, inverted flags, payload CRC, header CRC over
/// bytes 0..15 with the flags byte forced to 0xFF) followed by the payload.
pub(crate) fn build_segment(unique_id: u32, order_no: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    use crate::crc::crc32c;
    use crate::files::SEGMENT_OVERHEAD;

    let length = (SEGMENT_OVERHEAD + payload.len()) as u16;
    let mut image = vec![0u8; SEGMENT_OVERHEAD];
    image[0] = 0xA5;
    image[1..5].copy_from_slice(&unique_id.to_le_bytes());
    image[5..7].copy_from_slice(&order_no.to_le_bytes());
    image[7] = 1; // schema version
    image[8..10].copy_from_slice(&length.to_le_bytes());
    image[10] = 0xFF;
    image[11..15].copy_from_slice(&crc32c(0, payload).to_le_bytes());
    let header_crc = crc32c(0, &image[..15]);
    image[15..19].copy_from_slice(&header_crc.to_le_bytes());
    image[10] = !flags;
    image.extend_from_slice(payload);
    image
}
