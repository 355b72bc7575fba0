//! Pull-based streaming receiver over a packet host link.
//!
//! The receiver is the slave side of the transfer: it reserves a byte
//! window from the sender with DATA-REQUEST frames, absorbs in-window DATA
//! chunks into a small chain of fixed-size buffers, and exposes the
//! buffered bytes through a read-stream interface (`open`/`count`/`read`/
//! `close`). Three per-stream timers run off the 1 ms tick: a 100 ms
//! request retry, a 500 ms keep-alive, and a 1.1 s link timeout that
//! force-closes the stream.
//!
//! Several streams can run at once; each carries a one-byte id unique
//! among live streams, present as the second byte of every frame.

use crate::chain::{Buffer, Chain};
use crate::error::StreamError;
use crate::utils::{u16_le, u32_le};
use crate::HostLink;
use bitflags::bitflags;

/// Buffers per stream; with 256-byte buffers a stream can hold (and so
/// request) at most 1 KiB at a time.
pub const STREAM_BUFFERS: usize = 4;

const KEEPALIVE_MS: u16 = 500;
const REQUEST_TIMEOUT_MS: u16 = 100;
const LINK_TIMEOUT_MS: u16 = 1100;

/// Frame kinds. Byte 0 of every frame; byte 1 is the stream id.
pub mod packet {
    /// Device → host: reserve `[offset, offset + length)` (u32 LE offset,
    /// u16 LE length).
    pub const DATA_REQUEST: u8 = 0x01;
    /// Device → host: end of transfer, graceful or forced.
    pub const CLOSE: u8 = 0x02;
    /// Device → host: liveness ping.
    pub const KEEPALIVE: u8 = 0x03;
    /// Host → device: in-window chunk (u32 LE offset, u16 LE length,
    /// payload).
    pub const DATA: u8 = 0x04;
    /// Host → device: liveness pong.
    pub const ALIVE: u8 = 0x05;
}

bitflags! {
    struct StreamFlags: u8 {
        const STARTED = 0x01;
        const OPENED = 0x02;
        const LINK_TIMED_OUT = 0x04;
        const CLOSED = 0x08;
        const CANCELLED = 0x10;
        const REMOVED = 0x20;
        const ACCESS_DENIED = Self::LINK_TIMED_OUT.bits
            | Self::CLOSED.bits
            | Self::CANCELLED.bits
            | Self::REMOVED.bits;
    }
}

struct StreamSlot {
    id: u8,
    /// Total bytes the remote object holds.
    length: u32,
    /// Sender-declared CRC-32C of the whole object.
    crc: u32,

    bufs: [Buffer; STREAM_BUFFERS],
    free: Chain,
    ready: Chain,

    /// The consumer's current read offset.
    stream_offset: u32,

    requested_offset: u32,
    requested_length: u16,
    received_offset: u32,
    received_length: u16,

    keepalive_tmr: u16,
    request_tmr: u16,
    link_tmr: u16,

    flags: StreamFlags,
}

impl StreamSlot {
    const NEW: StreamSlot = StreamSlot {
        id: 0,
        length: 0,
        crc: 0,
        bufs: [Buffer::NEW; STREAM_BUFFERS],
        free: Chain::new(),
        ready: Chain::new(),
        stream_offset: 0,
        requested_offset: 0,
        requested_length: 0,
        received_offset: 0,
        received_length: 0,
        keepalive_tmr: 0,
        request_tmr: 0,
        link_tmr: 0,
        flags: StreamFlags::empty(),
    };

    fn is_live(&self) -> bool {
        self.flags.contains(StreamFlags::STARTED) && !self.flags.contains(StreamFlags::REMOVED)
    }

    fn access_denied(&self) -> bool {
        self.flags.intersects(StreamFlags::ACCESS_DENIED)
    }
}

/// Up to `N` concurrent stream receivers sharing one host link.
pub struct Streams<L: HostLink, const N: usize = 2> {
    link: L,
    slots: [StreamSlot; N],
    next_id: u8,
}

impl<L: HostLink, const N: usize> Streams<L, N> {
    pub fn new(link: L) -> Self {
        Streams {
            link,
            slots: [StreamSlot::NEW; N],
            next_id: 0,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Begin receiving a remote object of `length` bytes whose CRC-32C the
    /// sender declared as `crc`. Allocates a stream id, resets the slot's
    /// buffers and timers, and sends the first DATA-REQUEST. Returns the
    /// stream id.
    pub fn start(&mut self, length: u32, crc: u32) -> Result<u8, StreamError> {
        let pos = match self.slots.iter().position(|s| !s.is_live()) {
            Some(pos) => pos,
            None => return Err(StreamError::NotEnoughSpace),
        };
        let id = self.allocate_id();

        let slot = &mut self.slots[pos];
        slot.id = id;
        slot.length = length;
        slot.crc = crc;

        slot.free.clear();
        slot.ready.clear();
        for buf in slot.bufs.iter_mut() {
            buf.clear();
            buf.retag(0);
        }
        for idx in 0..STREAM_BUFFERS as u8 {
            slot.free.push_tail(&mut slot.bufs, idx);
        }

        slot.stream_offset = 0;
        slot.requested_offset = 0;
        slot.requested_length = 0;
        slot.received_offset = 0;
        slot.received_length = 0;
        // Saturated so the first silent tick pings straight away.
        slot.keepalive_tmr = u16::MAX;
        slot.link_tmr = 0;
        slot.request_tmr = u16::MAX;
        slot.flags = StreamFlags::STARTED;

        info!("stream {}: start, {} bytes", id, length);
        Self::request_data(&mut self.link, slot);
        Ok(id)
    }

    /// Latch a cancel; the next 1 ms tick transmits CLOSE and removes the
    /// stream.
    pub fn cancel(&mut self, id: u8) {
        if let Some(slot) = self.slot_by_id(id) {
            slot.flags.insert(StreamFlags::CANCELLED);
        }
    }

    /// 1 ms tick: run every live stream's timers.
    pub fn tick_1ms(&mut self) {
        let Streams { link, slots, .. } = self;
        for slot in slots.iter_mut() {
            if slot.is_live() {
                Self::tick_slot(link, slot);
            }
        }
    }

    fn tick_slot(link: &mut L, slot: &mut StreamSlot) {
        // No progress on the outstanding request: ask again.
        if slot.request_tmr < u16::MAX {
            slot.request_tmr += 1;
        }
        if slot.request_tmr >= REQUEST_TIMEOUT_MS {
            Self::request_data(link, slot);
        }

        // Nothing at all heard from the host.
        if slot.link_tmr < u16::MAX {
            slot.link_tmr += 1;
        }
        if slot.link_tmr >= LINK_TIMEOUT_MS {
            slot.flags.insert(StreamFlags::LINK_TIMED_OUT);
        }

        // Any terminal flag: transmit CLOSE once, then drop off the tick.
        if slot
            .flags
            .intersects(StreamFlags::CLOSED | StreamFlags::CANCELLED | StreamFlags::LINK_TIMED_OUT)
        {
            let frame = [packet::CLOSE, slot.id];
            if link.send(&frame).is_ok() {
                info!("stream {}: closed", slot.id);
                slot.flags.insert(StreamFlags::REMOVED);
                return;
            }
        }

        // Liveness ping.
        if slot.keepalive_tmr < u16::MAX {
            slot.keepalive_tmr += 1;
        }
        if slot.keepalive_tmr >= KEEPALIVE_MS {
            let frame = [packet::KEEPALIVE, slot.id];
            if link.send(&frame).is_ok() {
                slot.keepalive_tmr = 0;
            }
        }
    }

    /// Dispatch one received frame (byte 0 kind, byte 1 stream id).
    /// Malformed or unknown frames are dropped.
    pub fn handle_packet(&mut self, frame: &[u8]) {
        if frame.len() < 2 {
            return;
        }
        let id = frame[1];
        match frame[0] {
            packet::DATA => {
                if frame.len() < 8 {
                    return;
                }
                let offset = u32_le(frame, 2);
                let length = usize::from(u16_le(frame, 6));
                if frame.len() < 8 + length {
                    return;
                }
                self.data_received(id, offset, &frame[8..8 + length]);
            }
            packet::ALIVE => self.alive_received(id),
            _ => {}
        }
    }

    /// Absorb an in-window DATA chunk.
    pub fn data_received(&mut self, id: u8, offset: u32, data: &[u8]) {
        let Streams { link, slots, .. } = self;
        if let Some(slot) = slots.iter_mut().find(|s| s.is_live() && s.id == id) {
            Self::ingest(link, slot, offset, data);
        }
    }

    /// The host answered a keep-alive.
    pub fn alive_received(&mut self, id: u8) {
        if let Some(slot) = self.slot_by_id(id) {
            slot.link_tmr = 0;
        }
    }

    fn ingest(link: &mut L, slot: &mut StreamSlot, offset: u32, data: &[u8]) {
        if slot.free.is_empty() {
            return;
        }

        // Bytes land in whichever free buffers cover their offsets; chunks
        // outside every buffer are simply not absorbed.
        slot.free.write(&mut slot.bufs, offset, data);

        // Promote contiguous filled buffers. A trailing partial buffer only
        // counts once this chunk completes the requested window.
        let window_done = offset + data.len() as u32
            == slot.requested_offset + u32::from(slot.requested_length);
        let mut filled = slot.free.take_loaded(&mut slot.bufs, window_done);
        if !filled.is_empty() {
            slot.ready.append(&mut slot.bufs, &mut filled);
        }

        slot.received_offset = offset;
        slot.received_length = data.len() as u16;
        slot.link_tmr = 0;

        if window_done {
            // Arm an early retry in case the send is refused.
            slot.request_tmr = REQUEST_TIMEOUT_MS;
            Self::request_data(link, slot);
        }
    }

    /// Reserve the next window: figure out the first offset the stream does
    /// not yet hold, re-point the free pool at it, and ask the sender for
    /// as much of the remainder as the pool can take.
    fn request_data(link: &mut L, slot: &mut StreamSlot) {
        let mut offset =
            slot.stream_offset + slot.ready.count(&slot.bufs, slot.stream_offset);

        // Re-point free buffers not reachable from `offset` at the tail end.
        let mut out_of_range = slot.free.split_outside(&mut slot.bufs, offset);
        offset += slot.free.count(&slot.bufs, offset);
        if !slot.free.is_empty() {
            out_of_range.retag(&mut slot.bufs, 0); // re-aligned on append
        } else {
            out_of_range.retag(&mut slot.bufs, offset);
        }
        slot.free.append(&mut slot.bufs, &mut out_of_range);

        // Capacity minus what partial fills already spoke for, clipped to
        // the end of the object.
        let capacity = slot.free.capacity(&slot.bufs);
        let used = match slot.free.head_offset(&slot.bufs) {
            Some(head) => slot.free.count(&slot.bufs, head),
            None => 0,
        };
        let available = (capacity - used).min(slot.length.saturating_sub(offset));
        if available == 0 {
            return;
        }

        let mut frame = [0u8; 8];
        frame[0] = packet::DATA_REQUEST;
        frame[1] = slot.id;
        frame[2..6].copy_from_slice(&offset.to_le_bytes());
        frame[6..8].copy_from_slice(&(available as u16).to_le_bytes());
        if link.send(&frame).is_ok() {
            trace!("stream {}: request [{}, {})", slot.id, offset, offset + available);
            slot.requested_offset = offset;
            slot.requested_length = available as u16;
            slot.request_tmr = 0;
        }
    }

    fn slot_by_id(&mut self, id: u8) -> Option<&mut StreamSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.flags.contains(StreamFlags::STARTED) && s.id == id)
    }

    fn allocate_id(&mut self) -> u8 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.slots.iter().any(|s| s.is_live() && s.id == id) {
                return id;
            }
        }
    }

    // --- read-stream interface -------------------------------------------

    /// Latch the opened flag. Fails with `Closed` once terminal.
    pub fn open(&mut self, id: u8) -> Result<(), StreamError> {
        let slot = self.slot_by_id(id).ok_or(StreamError::Closed)?;
        if slot.access_denied() {
            return Err(StreamError::Closed);
        }
        slot.flags.insert(StreamFlags::OPENED);
        Ok(())
    }

    /// Bytes contiguously available from `offset`. Moves the stream offset
    /// there, recycles buffers left behind it, and issues a DATA-REQUEST if
    /// the offset is outside everything the stream holds or has asked for.
    pub fn count(&mut self, id: u8, offset: u32) -> Result<u32, StreamError> {
        let Streams { link, slots, .. } = self;
        let slot = slots
            .iter_mut()
            .find(|s| s.flags.contains(StreamFlags::STARTED) && s.id == id)
            .ok_or(StreamError::Closed)?;
        if slot.access_denied() {
            return Err(StreamError::Closed);
        }
        Self::reposition(link, slot, offset);
        Ok(slot.ready.count(&slot.bufs, offset))
    }

    /// Copy exactly `out.len()` bytes from `offset`. Fails with
    /// `NotEnoughData` (copying nothing) when fewer are buffered.
    pub fn read(&mut self, id: u8, offset: u32, out: &mut [u8]) -> Result<(), StreamError> {
        let Streams { link, slots, .. } = self;
        let slot = slots
            .iter_mut()
            .find(|s| s.flags.contains(StreamFlags::STARTED) && s.id == id)
            .ok_or(StreamError::Closed)?;
        if slot.access_denied() {
            return Err(StreamError::Closed);
        }
        Self::reposition(link, slot, offset);

        let available = slot.ready.count(&slot.bufs, offset);
        if (available as usize) < out.len() {
            return Err(StreamError::NotEnoughData);
        }
        slot.ready.read(&slot.bufs, offset, out);
        Ok(())
    }

    /// Copy up to `out.len()` bytes from `offset`; returns how many.
    pub fn read_partial(&mut self, id: u8, offset: u32, out: &mut [u8]) -> Result<u32, StreamError> {
        let Streams { link, slots, .. } = self;
        let slot = slots
            .iter_mut()
            .find(|s| s.flags.contains(StreamFlags::STARTED) && s.id == id)
            .ok_or(StreamError::Closed)?;
        if slot.access_denied() {
            return Err(StreamError::Closed);
        }
        Self::reposition(link, slot, offset);

        let available = slot
            .ready
            .count(&slot.bufs, offset)
            .min(out.len() as u32);
        slot.ready.read(&slot.bufs, offset, &mut out[..available as usize]);
        Ok(available)
    }

    /// Latch the closed flag; CLOSE goes out on the next 1 ms tick.
    pub fn close(&mut self, id: u8) -> Result<(), StreamError> {
        let slot = self.slot_by_id(id).ok_or(StreamError::Closed)?;
        if slot.access_denied() {
            return Err(StreamError::Closed);
        }
        slot.flags.insert(StreamFlags::CLOSED);
        Ok(())
    }

    /// Move the consumer offset, hand consumed ready buffers back to the
    /// free pool, and re-request if the offset escapes the union of what is
    /// buffered and what is on order.
    fn reposition(link: &mut L, slot: &mut StreamSlot, offset: u32) {
        slot.stream_offset = offset;

        let mut used = slot.ready.split_outside(&mut slot.bufs, offset);
        used.retag(&mut slot.bufs, 0);
        slot.free.append(&mut slot.bufs, &mut used);

        let ready_lo = slot.ready.head_offset(&slot.bufs).unwrap_or(u32::MAX);
        let free_lo = slot.free.head_offset(&slot.bufs).unwrap_or(u32::MAX);
        let mut spans = [
            (
                ready_lo,
                ready_lo.wrapping_add(slot.ready.count(&slot.bufs, ready_lo)),
            ),
            (
                free_lo,
                free_lo.wrapping_add(slot.free.count(&slot.bufs, free_lo)),
            ),
            (
                slot.requested_offset,
                slot.requested_offset + u32::from(slot.requested_length),
            ),
        ];
        let (lo, hi) = contiguous_span(&mut spans);

        if slot.stream_offset < lo || slot.stream_offset >= hi {
            // Arm an early retry in case the send is refused.
            slot.request_tmr = REQUEST_TIMEOUT_MS;
            Self::request_data(link, slot);
        }
    }

    // --- diagnostics ------------------------------------------------------

    /// Whether `id` names a live (started, not removed) stream.
    pub fn is_live(&self, id: u8) -> bool {
        self.slots.iter().any(|s| s.is_live() && s.id == id)
    }

    /// Total length of the remote object, as given to `start`.
    pub fn length(&self, id: u8) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.flags.contains(StreamFlags::STARTED) && s.id == id)
            .map(|s| s.length)
    }

    /// The sender-declared CRC-32C of the whole object.
    pub fn expected_crc(&self, id: u8) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.flags.contains(StreamFlags::STARTED) && s.id == id)
            .map(|s| s.crc)
    }

    /// Offset and length of the most recent DATA chunk.
    pub fn last_receive(&self, id: u8) -> Option<(u32, u16)> {
        self.slots
            .iter()
            .find(|s| s.flags.contains(StreamFlags::STARTED) && s.id == id)
            .map(|s| (s.received_offset, s.received_length))
    }
}

impl<L: HostLink, const N: usize> core::fmt::Debug for Streams<L, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Streams")
            .field("live", &self.slots.iter().filter(|s| s.is_live()).count())
            .field("slots", &N)
            .finish()
    }
}

/// Union up to a handful of half-open intervals: sort by low bound, then
/// grow the first interval's high bound across every later interval that
/// overlaps or abuts it. The result is the contiguous range reachable from
/// the lowest bound.
fn contiguous_span(spans: &mut [(u32, u32)]) -> (u32, u32) {
    for pass in 0..spans.len().saturating_sub(1) {
        for i in 0..spans.len() - 1 - pass {
            if spans[i].0 > spans[i + 1].0 {
                spans.swap(i, i + 1);
            }
        }
    }

    let (lo, mut hi) = spans[0];
    for &(span_lo, span_hi) in spans[1..].iter() {
        if span_lo <= hi && span_hi > hi {
            hi = span_hi;
        }
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingLink;

    fn data_frame(id: u8, offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![packet::DATA, id];
        frame.extend_from_slice(&offset.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn request_of(frame: &[u8]) -> (u32, u16) {
        assert_eq!(frame[0], packet::DATA_REQUEST);
        (u32_le(frame, 2), u16_le(frame, 6))
    }

    fn pattern(offset: u32, len: usize) -> Vec<u8> {
        (0..len).map(|i| (offset as usize + i) as u8).collect()
    }

    #[test]
    fn union_of_intervals() {
        let mut spans = [(0, 256), (256, 512), (512, 1024)];
        assert_eq!(contiguous_span(&mut spans), (0, 1024));

        // A gap stops the union.
        let mut spans = [(0, 256), (300, 512), (512, 1024)];
        assert_eq!(contiguous_span(&mut spans), (0, 256));

        // Unsorted input, overlapping bounds.
        let mut spans = [(512, 700), (0, 600), (100, 400)];
        assert_eq!(contiguous_span(&mut spans), (0, 700));

        // Empty intervals at u32::MAX (empty chains) stay out of the way.
        let mut spans = [(u32::MAX, u32::MAX), (0, 128), (128, 128)];
        assert_eq!(contiguous_span(&mut spans), (0, 128));
    }

    #[test]
    fn start_requests_the_initial_window() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0xDEAD_BEEF).unwrap();

        let sent = &streams.link().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][1], id);
        assert_eq!(request_of(&sent[0]), (0, 1024));
        assert_eq!(streams.expected_crc(id), Some(0xDEAD_BEEF));
        assert_eq!(streams.length(id), Some(1024));
    }

    #[test]
    fn short_object_requests_only_its_length() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let _ = streams.start(300, 0).unwrap();
        assert_eq!(request_of(&streams.link().sent[0]), (0, 300));
    }

    #[test]
    fn ingest_then_count_then_read() {
        // 1 KiB object, host delivers the first 256 bytes of the window.
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();

        streams.handle_packet(&data_frame(id, 0, &pattern(0, 256)));
        assert_eq!(streams.last_receive(id), Some((0, 256)));

        assert_eq!(streams.count(id, 0).unwrap(), 256);
        let mut out = [0u8; 256];
        streams.read(id, 0, &mut out).unwrap();
        assert_eq!(&out[..], &pattern(0, 256)[..]);

        // The sender still owes [256, 1024); the 100 ms retry re-requests
        // from the first byte the stream does not hold.
        assert_eq!(streams.count(id, 256).unwrap(), 0);
        for _ in 0..REQUEST_TIMEOUT_MS {
            streams.tick_1ms();
        }
        let last = streams.link().sent.last().unwrap().clone();
        assert_eq!(request_of(&last), (256, 768));
    }

    #[test]
    fn out_of_order_chunks_promote_together() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();

        streams.handle_packet(&data_frame(id, 256, &pattern(256, 256)));
        assert_eq!(streams.count(id, 0).unwrap(), 0);

        streams.handle_packet(&data_frame(id, 0, &pattern(0, 256)));
        assert_eq!(streams.count(id, 0).unwrap(), 512);

        let mut out = [0u8; 512];
        streams.read(id, 0, &mut out).unwrap();
        assert_eq!(&out[..], &pattern(0, 512)[..]);
    }

    #[test]
    fn window_completion_promotes_partial_and_rerequests() {
        // 1000-byte object: the final buffer can only ever be partial.
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1000, 0).unwrap();
        assert_eq!(request_of(&streams.link().sent[0]), (0, 1000));

        streams.handle_packet(&data_frame(id, 0, &pattern(0, 512)));
        assert_eq!(streams.count(id, 0).unwrap(), 512);

        streams.handle_packet(&data_frame(id, 512, &pattern(512, 488)));
        // Window complete: the 232-byte tail buffer was promoted too.
        assert_eq!(streams.count(id, 0).unwrap(), 1000);
        // Everything is buffered, so no further request goes out.
        let requests = streams
            .link()
            .sent
            .iter()
            .filter(|f| f[0] == packet::DATA_REQUEST)
            .count();
        assert_eq!(requests, 1);
    }

    #[test]
    fn consuming_frees_buffers_for_the_next_window() {
        // 2 KiB object through 1 KiB of buffers.
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(2048, 0).unwrap();
        assert_eq!(request_of(&streams.link().sent[0]), (0, 1024));

        for chunk in 0..4 {
            let offset = chunk * 256;
            streams.handle_packet(&data_frame(id, offset, &pattern(offset, 256)));
        }
        // Window [0, 1024) fully delivered, but every buffer now sits in
        // the ready chain: nothing can be requested yet.
        let requests = streams
            .link()
            .sent
            .iter()
            .filter(|f| f[0] == packet::DATA_REQUEST)
            .count();
        assert_eq!(requests, 1);

        // Consuming the first kilobyte hands the buffers back; stepping the
        // offset past the old window fires the next request immediately.
        let mut out = [0u8; 1024];
        streams.read(id, 0, &mut out).unwrap();
        assert_eq!(streams.count(id, 1024).unwrap(), 0);
        let last = streams.link().sent.last().unwrap().clone();
        assert_eq!(request_of(&last), (1024, 1024));
        // Deliver the second kilobyte into the recycled buffers.
        for chunk in 4..8 {
            let offset = chunk * 256;
            streams.handle_packet(&data_frame(id, offset, &pattern(offset, 256)));
        }
        assert_eq!(streams.count(id, 1024).unwrap(), 1024);
        streams.read(id, 1024, &mut out).unwrap();
        assert_eq!(&out[..], &pattern(1024, 1024)[..]);
    }

    #[test]
    fn reads_are_idempotent_until_the_offset_moves() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();
        streams.handle_packet(&data_frame(id, 0, &pattern(0, 512)));

        let mut first = [0u8; 128];
        let mut second = [0u8; 128];
        streams.read(id, 64, &mut first).unwrap();
        streams.read(id, 64, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn strict_read_fails_short_but_partial_read_succeeds() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();
        streams.handle_packet(&data_frame(id, 0, &pattern(0, 100)));
        // 100 bytes buffered but the head buffer is still partial: nothing
        // is promoted yet, so nothing is readable.
        assert_eq!(streams.count(id, 0).unwrap(), 0);

        streams.handle_packet(&data_frame(id, 100, &pattern(100, 156)));
        assert_eq!(streams.count(id, 0).unwrap(), 256);

        let mut out = [0u8; 300];
        assert_eq!(
            streams.read(id, 0, &mut out),
            Err(StreamError::NotEnoughData)
        );
        assert_eq!(streams.read_partial(id, 0, &mut out).unwrap(), 256);
        assert_eq!(&out[..256], &pattern(0, 256)[..]);
    }

    #[test]
    fn keepalive_cadence_and_liveness() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();

        for tick in 1..=1000u32 {
            streams.tick_1ms();
            // Host answers promptly, so the link never times out.
            if tick % 400 == 0 {
                streams.handle_packet(&[packet::ALIVE, id]);
            }
        }
        assert!(streams.is_live(id));
        let keepalives = streams
            .link()
            .sent
            .iter()
            .filter(|f| f[0] == packet::KEEPALIVE)
            .count();
        // Saturated timer pings on the first tick, then every 500 ms.
        assert_eq!(keepalives, 2);
        assert!(!streams.link().sent.iter().any(|f| f[0] == packet::CLOSE));
    }

    #[test]
    fn silent_link_forces_a_single_close() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();

        for _ in 0..LINK_TIMEOUT_MS + 50 {
            streams.tick_1ms();
        }

        let closes = streams
            .link()
            .sent
            .iter()
            .filter(|f| f[0] == packet::CLOSE)
            .count();
        assert_eq!(closes, 1);
        assert!(!streams.is_live(id));

        let mut out = [0u8; 4];
        assert_eq!(streams.read(id, 0, &mut out), Err(StreamError::Closed));
        assert_eq!(streams.count(id, 0), Err(StreamError::Closed));
        assert_eq!(streams.open(id), Err(StreamError::Closed));
        assert_eq!(streams.close(id), Err(StreamError::Closed));
    }

    #[test]
    fn close_is_retried_until_the_link_accepts() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();
        streams.close(id).unwrap();

        streams.link_mut().refuse = true;
        streams.tick_1ms();
        streams.tick_1ms();
        assert!(streams.is_live(id));

        streams.link_mut().refuse = false;
        streams.tick_1ms();
        assert!(!streams.is_live(id));
        let closes = streams
            .link()
            .sent
            .iter()
            .filter(|f| f[0] == packet::CLOSE)
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn cancel_latches_and_takes_effect_on_tick() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(1024, 0).unwrap();
        streams.cancel(id);
        assert!(streams.is_live(id));
        streams.tick_1ms();
        assert!(!streams.is_live(id));
    }

    #[test]
    fn ids_are_unique_among_live_streams() {
        let mut streams: Streams<RecordingLink, 4> = Streams::new(RecordingLink::new());
        let a = streams.start(100, 0).unwrap();
        let b = streams.start(100, 0).unwrap();
        let c = streams.start(100, 0).unwrap();
        assert!(a != b && b != c && a != c);

        // Retire one and reuse its slot; the id counter keeps rolling.
        streams.cancel(b);
        streams.tick_1ms();
        let d = streams.start(100, 0).unwrap();
        assert!(d != a && d != c);

        let e = streams.start(100, 0).unwrap();
        assert!(e != a && e != c && e != d);
        assert_eq!(
            streams.start(100, 0),
            Err(StreamError::NotEnoughSpace)
        );
    }

    #[test]
    fn open_latches_until_terminal() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(64, 0).unwrap();
        streams.open(id).unwrap();
        streams.close(id).unwrap();
        assert_eq!(streams.open(id), Err(StreamError::Closed));
    }

    #[test]
    fn reading_behind_the_window_rerequests() {
        let mut streams: Streams<RecordingLink, 2> = Streams::new(RecordingLink::new());
        let id = streams.start(8192, 0).unwrap();

        // Deliver and consume the first window.
        for chunk in 0..4 {
            let offset = chunk * 256;
            streams.handle_packet(&data_frame(id, offset, &pattern(offset, 256)));
        }
        let mut out = [0u8; 1024];
        streams.read(id, 0, &mut out).unwrap();

        // Jumping far ahead of everything buffered or requested forces an
        // immediate DATA-REQUEST at the new offset.
        let before = streams.link().sent.len();
        assert_eq!(streams.count(id, 4096).unwrap(), 0);
        let sent = &streams.link().sent;
        assert_eq!(sent.len(), before + 1);
        assert_eq!(request_of(sent.last().unwrap()), (4096, 1024));
    }
}
