//! Log-structured file directory assembled from flash segments.
//!
//! Files are stored on flash as segments: a 19-byte header (15 described
//! bytes plus a trailing header CRC) followed by payload. At boot the
//! scanner walks the whole device once, accepts every segment whose STX and
//! header CRC check out and whose flags mark it valid and not deleted, and
//! strings accepted segments into per-file lists keyed by unique id.
//! Anything unreadable re-aligns the scan to the next sector boundary, so
//! a corrupt region costs at most the rest of its sector.
//!
//! The scanner runs off the fast tick and drives the flash driver with its
//! own read requests; it owns no flash access outside of that.

use crate::crc::crc32c;
use crate::error::IndexFault;
use crate::series25::{Flash, FlashRequest, Owner};
use crate::utils::{block_next, u16_le, u32_le};
use crate::SpiBus;
use bitflags::bitflags;
use embedded_hal::digital::v2::OutputPin;
use heapless::Vec;

/// On-flash segment header size: 15 described bytes plus the 4-byte header
/// CRC. Payload follows immediately.
pub const SEGMENT_OVERHEAD: usize = 19;

/// First byte of every segment.
pub const SEGMENT_STX: u8 = 0xA5;

/// Bytes read per scan probe.
pub const SCAN_PROBE_LEN: usize = 30;

/// Owner tag the scanner presents to the flash driver.
pub const INDEX_OWNER: Owner = Owner(0xF1);

bitflags! {
    /// Segment state flags. Stored inverted on flash so an erased (0xFF)
    /// flags byte reads back as no flags set.
    pub struct SegmentFlags: u8 {
        const VALID = 0x01;
        const DELETED = 0x02;
    }
}

/// A parsed segment header.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub unique_id: u32,
    pub order_no: u16,
    pub version: u8,
    /// Total segment bytes from STX to the end of the payload.
    pub length: u16,
    pub flags: SegmentFlags,
    pub data_crc: u32,
}

impl SegmentHeader {
    /// Parse a header from a scan probe.
    ///
    /// Acceptance is gated on the STX byte and the header CRC; the CRC is
    /// computed with the flags byte forced to its erased value (0xFF), so
    /// flag updates after the fact do not invalidate it.
    pub fn parse(data: &[u8]) -> Option<SegmentHeader> {
        if data.len() < SEGMENT_OVERHEAD || data[0] != SEGMENT_STX {
            return None;
        }

        let mut head = [0u8; 15];
        head.copy_from_slice(&data[..15]);
        head[10] = 0xFF;
        if crc32c(0, &head) != u32_le(data, 15) {
            return None;
        }

        Some(SegmentHeader {
            unique_id: u32_le(data, 1),
            order_no: u16_le(data, 5),
            version: data[7],
            length: u16_le(data, 8),
            flags: SegmentFlags::from_bits_truncate(!data[10]),
            data_crc: u32_le(data, 11),
        })
    }

    fn accepted(&self) -> bool {
        self.flags.contains(SegmentFlags::VALID) && !self.flags.contains(SegmentFlags::DELETED)
    }
}

/// An accepted segment and where it lives on flash.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub header: SegmentHeader,
    /// Flash address of the segment's STX byte.
    pub address: u32,
}

impl Segment {
    /// Flash address of the first payload byte.
    pub fn payload_address(&self) -> u32 {
        self.address + SEGMENT_OVERHEAD as u32
    }

    /// Payload bytes in this segment.
    pub fn payload_len(&self) -> u16 {
        self.header.length - SEGMENT_OVERHEAD as u16
    }
}

#[derive(Debug)]
struct SegmentEntry {
    segment: Segment,
    next: Option<u16>,
}

/// A file: every accepted segment sharing one unique id.
#[derive(Debug)]
pub struct File {
    unique_id: u32,
    length: u32,
    first_segment: Option<u16>,
}

impl File {
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Total payload bytes across the file's segments.
    pub fn length(&self) -> u32 {
        self.length
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Start,
    AwaitFlash,
    ReadHeader,
    ParseHeader,
    Complete,
    Halted,
}

/// The boot-time segment scanner and the directory it builds.
///
/// `MAX_FILES` and `MAX_SEGMENTS` bound the directory; exceeding either is
/// reported through the fatal hook and latched, and the scan halts.
pub struct FileIndex<'a, const MAX_FILES: usize = 16, const MAX_SEGMENTS: usize = 64> {
    state: ScanState,
    cursor: u32,
    scratch: Option<&'a mut [u8]>,
    files: Vec<File, MAX_FILES>,
    segments: Vec<SegmentEntry, MAX_SEGMENTS>,
    fault: Option<IndexFault>,
    on_fatal: Option<fn(IndexFault)>,
}

impl<'a, const MAX_FILES: usize, const MAX_SEGMENTS: usize> FileIndex<'a, MAX_FILES, MAX_SEGMENTS> {
    /// `scratch` is the probe buffer the scanner reads headers into; it is
    /// lent to the flash driver one probe at a time. [`SCAN_PROBE_LEN`]
    /// bytes is the conventional size; anything holding a full header
    /// works.
    pub fn new(scratch: &'a mut [u8]) -> Self {
        debug_assert!(scratch.len() >= SEGMENT_OVERHEAD);
        Self {
            state: ScanState::Start,
            cursor: 0,
            scratch: Some(scratch),
            files: Vec::new(),
            segments: Vec::new(),
            fault: None,
            on_fatal: None,
        }
    }

    /// Install the fatal-error sink, called once if a pool overflows.
    pub fn with_fatal_hook(mut self, hook: fn(IndexFault)) -> Self {
        self.on_fatal = Some(hook);
        self
    }

    /// True once the scan has covered the whole device.
    pub fn is_complete(&self) -> bool {
        self.state == ScanState::Complete
    }

    /// The latched fatal fault, if the scan halted.
    pub fn fault(&self) -> Option<IndexFault> {
        self.fault
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Files in discovery order.
    pub fn files(&self) -> impl Iterator<Item = &File> {
        self.files.iter()
    }

    pub fn file_by_id(&self, unique_id: u32) -> Option<&File> {
        self.files.iter().find(|f| f.unique_id == unique_id)
    }

    /// A file's segments in stored list order: descending order-no (the
    /// scanner inserts each segment before the first one with a smaller
    /// order-no). Use [`FileIndex::segments_ascending`] for stream order.
    pub fn segments(&self, file: &File) -> Segments<'_> {
        Segments {
            pool: &self.segments,
            cursor: file.first_segment,
        }
    }

    /// A file's segments in increasing order-no order.
    pub fn segments_ascending(&self, file: &File) -> SegmentsAscending<'_> {
        SegmentsAscending {
            pool: &self.segments,
            first: file.first_segment,
            last_order: None,
        }
    }

    /// Look up one segment of a file by its order number.
    pub fn segment(&self, file: &File, order_no: u16) -> Option<&Segment> {
        self.segments(file).find(|s| s.header.order_no == order_no)
    }

    /// Fast tick: run the scanner until indexing completes or halts.
    pub fn tick<SPI: SpiBus, CS: OutputPin>(&mut self, flash: &mut Flash<'a, SPI, CS>) {
        loop {
            match self.state {
                ScanState::Start => {
                    self.cursor = 0;
                    self.state = ScanState::AwaitFlash;
                }
                ScanState::AwaitFlash => {
                    if !flash.is_ready() {
                        return;
                    }
                    self.state = ScanState::ReadHeader;
                }
                ScanState::ReadHeader => {
                    let flash_size = match flash.info() {
                        Some(info) => info.flash_size,
                        None => return,
                    };
                    if self.cursor >= flash_size {
                        info!("file index: scan complete, {} files", self.files.len());
                        self.state = ScanState::Complete;
                        return;
                    }

                    let scratch = match self.scratch.take() {
                        Some(scratch) => scratch,
                        None => return,
                    };
                    match flash.submit(FlashRequest::read(INDEX_OWNER, self.cursor, scratch)) {
                        Ok(()) => self.state = ScanState::ParseHeader,
                        // Driver occupied; take the buffer back and retry.
                        Err((_, req)) => self.scratch = req.into_read_data(),
                    }
                    return;
                }
                ScanState::ParseHeader => {
                    let req = match flash.take_done(INDEX_OWNER) {
                        Some(req) => req,
                        None => return,
                    };
                    let result = req.result();
                    let header = SegmentHeader::parse(req.data());
                    self.scratch = req.into_read_data();

                    if result != Some(Ok(())) {
                        // Transient read failure: same cursor again.
                        self.state = ScanState::ReadHeader;
                        return;
                    }
                    self.parse_probe(header, flash);
                    return;
                }
                ScanState::Complete | ScanState::Halted => return,
            }
        }
    }

    fn parse_probe<SPI: SpiBus, CS: OutputPin>(
        &mut self,
        header: Option<SegmentHeader>,
        flash: &Flash<'a, SPI, CS>,
    ) {
        let sector_size = match flash.info() {
            Some(info) => info.sector_size,
            None => return,
        };
        self.state = ScanState::ReadHeader;

        let header = match header {
            Some(header) if header.length as usize >= SEGMENT_OVERHEAD => header,
            // Not a segment (or an impossible one): whatever is here does
            // not carry a length, so re-align to the next sector start.
            _ => {
                self.cursor = block_next(self.cursor, sector_size);
                return;
            }
        };

        if !header.flags.contains(SegmentFlags::VALID) {
            self.cursor = block_next(self.cursor, sector_size);
            return;
        }

        if header.flags.contains(SegmentFlags::DELETED) {
            self.cursor += u32::from(header.length);
            return;
        }

        let segment = Segment {
            header,
            address: self.cursor,
        };
        self.cursor += u32::from(header.length);
        self.materialize(segment);
    }

    fn materialize(&mut self, segment: Segment) {
        trace!(
            "file index: segment id={:08x} order={} at {:06x}",
            segment.header.unique_id,
            segment.header.order_no,
            segment.address
        );

        let seg_idx = self.segments.len() as u16;
        if self.segments.push(SegmentEntry { segment, next: None }).is_err() {
            self.fatal(IndexFault::SegmentPoolExhausted);
            return;
        }

        let file_pos = match self.files.iter().position(|f| f.unique_id == segment.header.unique_id) {
            Some(pos) => pos,
            None => {
                let file = File {
                    unique_id: segment.header.unique_id,
                    length: 0,
                    first_segment: None,
                };
                if self.files.push(file).is_err() {
                    self.segments.pop();
                    self.fatal(IndexFault::FilePoolExhausted);
                    return;
                }
                self.files.len() - 1
            }
        };

        // Insert before the first segment with a strictly smaller order-no,
        // leaving the list in descending order.
        let order_no = segment.header.order_no;
        let mut prev: Option<u16> = None;
        let mut cursor = self.files[file_pos].first_segment;
        while let Some(idx) = cursor {
            if self.segments[usize::from(idx)].segment.header.order_no <= order_no {
                break;
            }
            prev = Some(idx);
            cursor = self.segments[usize::from(idx)].next;
        }
        match prev {
            None => {
                self.segments[usize::from(seg_idx)].next = self.files[file_pos].first_segment;
                self.files[file_pos].first_segment = Some(seg_idx);
            }
            Some(prev) => {
                self.segments[usize::from(seg_idx)].next = self.segments[usize::from(prev)].next;
                self.segments[usize::from(prev)].next = Some(seg_idx);
            }
        }
        self.files[file_pos].length += u32::from(segment.payload_len());
    }

    fn fatal(&mut self, fault: IndexFault) {
        self.fault = Some(fault);
        self.state = ScanState::Halted;
        if let Some(hook) = self.on_fatal {
            hook(fault);
        }
    }
}

impl<const MAX_FILES: usize, const MAX_SEGMENTS: usize> core::fmt::Debug
    for FileIndex<'_, MAX_FILES, MAX_SEGMENTS>
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileIndex")
            .field("complete", &self.is_complete())
            .field("files", &self.files.len())
            .field("segments", &self.segments.len())
            .field("fault", &self.fault)
            .finish()
    }
}

/// Iterator over a file's segments in stored (descending order-no) order.
#[derive(Debug)]
pub struct Segments<'s> {
    pool: &'s [SegmentEntry],
    cursor: Option<u16>,
}

impl<'s> Iterator for Segments<'s> {
    type Item = &'s Segment;

    fn next(&mut self) -> Option<&'s Segment> {
        let entry = &self.pool[usize::from(self.cursor?)];
        self.cursor = entry.next;
        Some(&entry.segment)
    }
}

/// Iterator over a file's segments in increasing order-no order.
#[derive(Debug)]
pub struct SegmentsAscending<'s> {
    pool: &'s [SegmentEntry],
    first: Option<u16>,
    last_order: Option<u16>,
}

impl<'s> Iterator for SegmentsAscending<'s> {
    type Item = &'s Segment;

    fn next(&mut self) -> Option<&'s Segment> {
        let mut best: Option<&'s Segment> = None;
        let mut cursor = self.first;
        while let Some(idx) = cursor {
            let entry = &self.pool[usize::from(idx)];
            let order = entry.segment.header.order_no;
            let above_last = match self.last_order {
                Some(last) => order > last,
                None => true,
            };
            if above_last && best.map_or(true, |b| order < b.header.order_no) {
                best = Some(&entry.segment);
            }
            cursor = entry.next;
        }
        self.last_order = best.map(|b| b.header.order_no);
        best
    }
}
