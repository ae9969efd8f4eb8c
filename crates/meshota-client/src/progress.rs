//! Download progress.
//!
//! Three pieces of state move as data arrives:
//!
//! - [`TransferProgress`] counts only what storage has confirmed. Its offset
//!   and running checksum are what a checkpoint records.
//! - [`WriteBuffer`] stages received bytes until they are written.
//! - [`PageWindow`] collects the blocks of one page request, which may
//!   arrive out of order or not at all.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::image::{ImageDescriptor, TRAILER_LEN, extend_crc32};

/// Which part of the image the next file offset falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressStatus {
    /// Firmware body.
    Body,
    /// Integrity trailer.
    Trailer,
    /// Past the end of the image.
    Complete,
}

/// Committed progress of one download.
///
/// `current_file_offset + remaining_bytes == total_size` holds at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Bytes committed to storage.
    pub current_file_offset: u32,
    /// Bytes still to be committed, trailer included.
    pub remaining_bytes: u32,
    /// CRC-32 of the committed body bytes.
    pub running_checksum: u32,
    /// Length of the firmware body.
    pub sub_image_length: u32,
    /// Region addressed by `current_file_offset`.
    pub address_status: AddressStatus,
    total_size: u32,
    last_checkpoint: u32,
}

impl TransferProgress {
    /// Progress of a download starting from scratch.
    #[must_use]
    pub fn new(image: &ImageDescriptor) -> Self {
        Self::resume(image, 0, 0)
    }

    /// Progress of a download resuming after `offset` committed bytes whose
    /// checksum is `checksum`.
    #[must_use]
    pub fn resume(image: &ImageDescriptor, offset: u32, checksum: u32) -> Self {
        let body = image.body_len();
        let offset = offset.min(body);
        let mut progress = Self {
            current_file_offset: offset,
            remaining_bytes: image.total_size.saturating_sub(offset),
            running_checksum: checksum,
            sub_image_length: body,
            address_status: AddressStatus::Body,
            total_size: image.total_size,
            last_checkpoint: offset,
        };
        progress.refresh_status();
        progress
    }

    /// Image size, trailer included.
    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Body bytes not yet committed.
    #[must_use]
    pub fn body_remaining(&self) -> u32 {
        self.sub_image_length
            .saturating_sub(self.current_file_offset)
    }

    /// Whether the whole body has been committed.
    #[must_use]
    pub fn is_body_complete(&self) -> bool {
        self.current_file_offset >= self.sub_image_length
    }

    /// Record that `bytes` were written at `current_file_offset`.
    ///
    /// Only body bytes extend the checksum; anything beyond the body is
    /// ignored.
    pub fn commit_body(&mut self, bytes: &[u8]) {
        let room = usize::try_from(self.body_remaining()).unwrap_or(usize::MAX);
        let accepted = bytes.get(..room).unwrap_or(bytes);
        let len = u32::try_from(accepted.len()).unwrap_or(u32::MAX);

        self.running_checksum = extend_crc32(self.running_checksum, accepted);
        self.advance(len);
    }

    /// Record that the trailer was written after the body.
    pub fn commit_trailer(&mut self) {
        if self.is_body_complete() {
            self.advance(TRAILER_LEN);
        }
    }

    /// Whether at least `interval` bytes were committed since the last
    /// checkpoint.
    #[must_use]
    pub fn checkpoint_due(&self, interval: u32) -> bool {
        self.current_file_offset.saturating_sub(self.last_checkpoint) >= interval.max(1)
    }

    /// Note that a checkpoint covering the current offset was saved.
    pub fn mark_checkpointed(&mut self) {
        self.last_checkpoint = self.current_file_offset;
    }

    fn advance(&mut self, len: u32) {
        let len = len.min(self.remaining_bytes);
        self.current_file_offset = self.current_file_offset.saturating_add(len);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(len);
        self.refresh_status();
    }

    fn refresh_status(&mut self) {
        self.address_status = if self.remaining_bytes == 0 {
            AddressStatus::Complete
        } else if self.current_file_offset >= self.sub_image_length {
            AddressStatus::Trailer
        } else {
            AddressStatus::Body
        };
    }
}

/// Received bytes waiting to be written.
///
/// The buffer tracks the file offset of its first byte, so `next_offset` is
/// always the first byte that has been neither staged nor handed to storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBuffer {
    base: u32,
    bytes: Vec<u8>,
}

impl WriteBuffer {
    /// An empty buffer whose next byte lands at `offset`.
    #[must_use]
    pub fn at(offset: u32) -> Self {
        Self {
            base: offset,
            bytes: Vec::new(),
        }
    }

    /// Offset of the first staged byte.
    #[must_use]
    pub fn base_offset(&self) -> u32 {
        self.base
    }

    /// Offset the next received byte belongs at.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.base
            .saturating_add(u32::try_from(self.bytes.len()).unwrap_or(u32::MAX))
    }

    /// Staged byte count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether enough is staged to issue a write of at least `unit` bytes.
    /// A unit of zero writes whatever is staged.
    #[must_use]
    pub fn is_ready(&self, unit: u32) -> bool {
        !self.is_empty() && self.len() >= usize::try_from(unit).unwrap_or(usize::MAX)
    }

    /// Stage `bytes` after what is already staged.
    pub fn stage(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Hand all staged bytes over for writing. Returns their offset.
    pub fn take(&mut self) -> (u32, Vec<u8>) {
        let offset = self.base;
        let bytes = std::mem::take(&mut self.bytes);
        self.base = self.next_offset_after(&bytes);
        (offset, bytes)
    }

    fn next_offset_after(&self, bytes: &[u8]) -> u32 {
        self.base
            .saturating_add(u32::try_from(bytes.len()).unwrap_or(u32::MAX))
    }
}

/// Blocks received for one page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWindow {
    start: u32,
    data: Vec<u8>,
    received: Vec<Range<u32>>,
}

impl PageWindow {
    /// A window covering `len` bytes from `start`.
    #[must_use]
    pub fn new(start: u32, len: u32) -> Self {
        Self {
            start,
            data: vec![0; usize::try_from(len).unwrap_or(0)],
            received: Vec::new(),
        }
    }

    /// File offset of the first byte.
    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// File offset one past the last byte.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.len())
    }

    /// Number of bytes the window covers.
    #[must_use]
    pub fn len(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    /// Whether the window covers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Place a block received at file offset `offset`.
    ///
    /// Bytes outside the window are dropped. Returns how many bytes were not
    /// already present.
    pub fn fill(&mut self, offset: u32, bytes: &[u8]) -> u32 {
        let block_end = offset.saturating_add(u32::try_from(bytes.len()).unwrap_or(u32::MAX));
        let from = offset.max(self.start);
        let to = block_end.min(self.end());
        if from >= to {
            return 0;
        }

        let src = bytes.get(idx(from - offset)..idx(to - offset));
        let dst = self.data.get_mut(idx(from - self.start)..idx(to - self.start));
        if let (Some(src), Some(dst)) = (src, dst) {
            dst.copy_from_slice(src);
        }

        let before = self.received_len();
        self.insert(from - self.start..to - self.start);
        self.received_len() - before
    }

    /// Whether any byte has arrived.
    #[must_use]
    pub fn received_any(&self) -> bool {
        !self.received.is_empty()
    }

    /// Whether every byte has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received_len() == self.len()
    }

    /// First missing byte range, in file offsets.
    #[must_use]
    pub fn first_gap(&self) -> Option<Range<u32>> {
        let mut cursor = 0;
        for range in &self.received {
            if range.start > cursor {
                break;
            }
            cursor = range.end;
        }
        (cursor < self.len()).then(|| {
            let end = self
                .received
                .iter()
                .map(|r| r.start)
                .find(|&start| start > cursor)
                .unwrap_or(self.len());
            self.start + cursor..self.start + end
        })
    }

    /// The page bytes, once complete.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn received_len(&self) -> u32 {
        self.received.iter().map(|r| r.end - r.start).sum()
    }

    fn insert(&mut self, range: Range<u32>) {
        self.received.push(range);
        self.received.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<u32>> = Vec::with_capacity(self.received.len());
        for range in self.received.drain(..) {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        self.received = merged;
    }
}

fn idx(offset: u32) -> usize {
    usize::try_from(offset).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(total_size: u32) -> ImageDescriptor {
        ImageDescriptor {
            manufacturer_id: 0x1014,
            image_type: 0,
            firmware_version: 2,
            total_size,
        }
    }

    #[test]
    fn test_offsets_sum_to_total() {
        let mut progress = TransferProgress::new(&image(104));
        assert_eq!(progress.sub_image_length, 100);
        assert_eq!(progress.address_status, AddressStatus::Body);

        progress.commit_body(&[0xAB; 64]);
        assert_eq!(progress.current_file_offset + progress.remaining_bytes, 104);

        progress.commit_body(&[0xCD; 64]);
        assert_eq!(progress.current_file_offset, 100);
        assert_eq!(progress.remaining_bytes, 4);
        assert_eq!(progress.address_status, AddressStatus::Trailer);

        progress.commit_trailer();
        assert_eq!(progress.remaining_bytes, 0);
        assert_eq!(progress.address_status, AddressStatus::Complete);
    }

    #[test]
    fn test_checksum_covers_only_body() {
        let body: Vec<u8> = (0..100u8).collect();
        let mut progress = TransferProgress::new(&image(104));
        progress.commit_body(body.get(..60).unwrap_or_default());
        let mut tail = body.get(60..).unwrap_or_default().to_vec();
        tail.extend_from_slice(&[1, 2, 3, 4]);
        progress.commit_body(&tail);
        assert_eq!(progress.running_checksum, crate::image::crc32(&body));
    }

    #[test]
    fn test_checkpoint_interval() {
        let mut progress = TransferProgress::new(&image(4100));
        progress.commit_body(&[0; 512]);
        assert!(!progress.checkpoint_due(1024));
        progress.commit_body(&[0; 512]);
        assert!(progress.checkpoint_due(1024));
        progress.mark_checkpointed();
        assert!(!progress.checkpoint_due(1024));
    }

    #[test]
    fn test_write_buffer_offsets() {
        let mut buffer = WriteBuffer::at(128);
        buffer.stage(&[1; 10]);
        buffer.stage(&[2; 6]);
        assert_eq!(buffer.next_offset(), 144);
        assert!(buffer.is_ready(16));
        assert!(!buffer.is_ready(32));

        let (offset, bytes) = buffer.take();
        assert_eq!(offset, 128);
        assert_eq!(bytes.len(), 16);
        assert!(buffer.is_empty());
        assert_eq!(buffer.base_offset(), 144);
        assert_eq!(buffer.next_offset(), 144);
    }

    #[test]
    fn test_page_window_gaps() {
        let mut page = PageWindow::new(256, 192);
        assert_eq!(page.first_gap(), Some(256..448));

        assert_eq!(page.fill(256, &[1; 64]), 64);
        assert_eq!(page.fill(384, &[3; 64]), 64);
        assert_eq!(page.first_gap(), Some(320..384));
        assert!(!page.is_complete());

        assert_eq!(page.fill(256, &[1; 64]), 0);
        assert_eq!(page.fill(320, &[2; 64]), 64);
        assert!(page.is_complete());
        assert_eq!(page.first_gap(), None);

        let bytes = page.into_bytes();
        assert_eq!(bytes.get(64), Some(&2));
        assert_eq!(bytes.get(191), Some(&3));
    }

    #[test]
    fn test_page_window_clips_out_of_range() {
        let mut page = PageWindow::new(100, 50);
        assert_eq!(page.fill(90, &[7; 20]), 10);
        assert_eq!(page.fill(140, &[8; 30]), 10);
        assert_eq!(page.fill(200, &[9; 10]), 0);
        assert_eq!(page.first_gap(), Some(110..140));
    }
}
