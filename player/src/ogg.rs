//! Minimal Ogg page inspection.
//!
//! The timing path needs exactly two facts about a received chunk: the
//! granule position of the page it starts with, and whether that page is a
//! header/tags page. Both are probed directly on the raw bytes, without
//! demuxing. `PageScanner` does reassemble complete pages, but only for the
//! bundled decoder, which needs packet boundaries.

use tracing::trace;

/// Ogg capture pattern `"OggS"` as a big-endian 32-bit value.
pub const OGG_MAGIC: u32 = 0x4F67_6753;

/// Byte offset of the 64-bit little-endian granule position field.
const GRANULE_OFFSET: usize = 6;

/// Byte offset of the segment-count byte.
const SEGMENT_COUNT_OFFSET: usize = 26;

/// Fixed header length before the segment table.
const HEADER_LEN: usize = 27;

/// Identification header signature carried in the first page's payload.
const OPUS_HEAD: &[u8; 8] = b"OpusHead";

/// Comment header signature carried in the second page's payload.
const OPUS_TAGS: &[u8; 8] = b"OpusTags";

fn has_magic(chunk: &[u8]) -> bool {
    // ---
    match chunk.get(..4) {
        Some(prefix) => u32::from_be_bytes(prefix.try_into().expect("slice is 4 bytes")) == OGG_MAGIC,
        None => false,
    }
}

/// Extracts the granule position from a chunk beginning with an Ogg page.
///
/// Returns `None` when the chunk is empty, does not start with the capture
/// pattern, or is too short to contain the granule field. A missing result
/// is the error signal; malformed input never panics.
///
/// # Example
///
/// ```
/// let mut page = Vec::from(*b"OggS");
/// page.extend_from_slice(&[0, 0]); // version + header type
/// page.extend_from_slice(&1000u64.to_le_bytes());
/// assert_eq!(player::ogg::granule_position(&page), Some(1000));
/// ```
pub fn granule_position(chunk: &[u8]) -> Option<u64> {
    // ---
    if !has_magic(chunk) {
        return None;
    }

    let bytes = chunk.get(GRANULE_OFFSET..GRANULE_OFFSET + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().expect("slice is 8 bytes")))
}

/// Returns whether the chunk begins with a metadata-only page.
///
/// Metadata pages (`OpusHead` identification, `OpusTags` comments) carry no
/// audible payload and must not advance the audible-position estimate. A
/// chunk too short to inspect is "not metadata" rather than an error.
pub fn is_metadata_page(chunk: &[u8]) -> bool {
    // ---
    if !has_magic(chunk) {
        return false;
    }

    let segment_count = match chunk.get(SEGMENT_COUNT_OFFSET) {
        Some(&count) => count as usize,
        None => return false,
    };

    let payload_offset = HEADER_LEN + segment_count;
    match chunk.get(payload_offset..payload_offset + 8) {
        Some(signature) => signature == OPUS_HEAD || signature == OPUS_TAGS,
        None => false,
    }
}

/// One complete Ogg page, reassembled across chunk boundaries.
#[derive(Debug, Clone)]
pub struct ScannedPage {
    // ---
    /// Granule position of this page.
    pub granule_position: u64,

    /// Lacing values from the segment table.
    pub lacing: Vec<u8>,

    /// Concatenated segment payloads.
    pub body: Vec<u8>,
}

impl ScannedPage {
    // ---
    /// Walks the lacing values, yielding `(segment, completes_packet)` pairs.
    ///
    /// A lacing value of 255 means the packet continues in the next segment
    /// (possibly on the next page).
    pub fn segments(&self) -> impl Iterator<Item = (&[u8], bool)> {
        // ---
        self.lacing.iter().scan(0usize, move |offset, &lace| {
            let start = *offset;
            let end = start + lace as usize;
            *offset = end;
            Some((&self.body[start..end], lace < 255))
        })
    }
}

/// Incremental page reassembler.
///
/// Stream chunks do not have to align with page boundaries; the scanner
/// buffers bytes until a complete page is available. Garbage before the next
/// capture pattern is skipped so a mid-page join point resynchronizes on the
/// following page.
#[derive(Debug, Default)]
pub struct PageScanner {
    // ---
    buf: Vec<u8>,
}

impl PageScanner {
    // ---
    pub fn new() -> Self {
        // ---
        Self { buf: Vec::new() }
    }

    /// Appends freshly received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        // ---
        self.buf.extend_from_slice(chunk);
    }

    /// Removes and returns the next complete page, if one is buffered.
    pub fn next_page(&mut self) -> Option<ScannedPage> {
        // ---
        self.resync();

        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let segment_count = self.buf[SEGMENT_COUNT_OFFSET] as usize;
        let table_end = HEADER_LEN + segment_count;
        if self.buf.len() < table_end {
            return None;
        }

        let lacing = self.buf[HEADER_LEN..table_end].to_vec();
        let body_len: usize = lacing.iter().map(|&l| l as usize).sum();
        let page_end = table_end + body_len;
        if self.buf.len() < page_end {
            return None;
        }

        let granule_position = granule_position(&self.buf).expect("buffer starts with a page");
        let body = self.buf[table_end..page_end].to_vec();
        self.buf.drain(..page_end);

        Some(ScannedPage {
            granule_position,
            lacing,
            body,
        })
    }

    /// Drops bytes until the buffer starts with the capture pattern.
    fn resync(&mut self) {
        // ---
        if has_magic(&self.buf) {
            return;
        }

        let magic = OGG_MAGIC.to_be_bytes();
        match self.buf.windows(4).position(|w| w == magic) {
            Some(pos) => {
                if pos > 0 {
                    trace!("Skipping {} bytes before next page boundary", pos);
                    self.buf.drain(..pos);
                }
            }
            None => {
                // Keep a tail that might hold a partial capture pattern.
                let keep = self.buf.len().min(3);
                let drop_len = self.buf.len() - keep;
                if drop_len > 0 {
                    trace!("Discarding {} unsyncable bytes", drop_len);
                    self.buf.drain(..drop_len);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn make_page(granule: u64, segments: &[&[u8]]) -> Vec<u8> {
        // ---
        let mut page = Vec::from(*b"OggS");
        page.push(0); // version
        page.push(0); // header type
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&1u32.to_le_bytes()); // serial
        page.extend_from_slice(&0u32.to_le_bytes()); // sequence
        page.extend_from_slice(&0u32.to_le_bytes()); // checksum
        page.push(segments.len() as u8);
        for segment in segments {
            page.push(segment.len() as u8);
        }
        for segment in segments {
            page.extend_from_slice(segment);
        }
        page
    }

    #[test]
    fn test_granule_position_well_formed() {
        // ---
        let page = make_page(1000, &[b"audio"]);
        assert_eq!(granule_position(&page), Some(1000));
    }

    #[test]
    fn test_granule_position_high_bits() {
        // ---
        let granule = 5 * 0x1_0000_0000u64 + 42;
        let page = make_page(granule, &[b"audio"]);
        assert_eq!(granule_position(&page), Some(granule));
    }

    #[test]
    fn test_granule_position_rejects_short_or_magicless() {
        // ---
        assert_eq!(granule_position(&[]), None);
        assert_eq!(granule_position(b"Ogg"), None);
        assert_eq!(granule_position(b"RIFFxxxxxxxxxxxx"), None);

        // Magic matches but the granule field is truncated
        assert_eq!(granule_position(b"OggS\x00\x00\x01\x02"), None);
    }

    #[test]
    fn test_metadata_page_opus_head() {
        // ---
        let page = make_page(0, &[b"x", b"OpusHead rest of the id header"]);
        // Segment count 2, so the signature is read at offset 27 + 2 + 1
        assert!(!is_metadata_page(&page));

        let page = make_page(0, &[b"OpusHead\x01\x02"]);
        assert!(is_metadata_page(&page));

        // Two segments with the signature first: offset is 27 + 2
        let page = make_page(0, &[b"OpusHead", b"\x01\x02"]);
        assert!(is_metadata_page(&page));

        let page = make_page(0, &[b"OpusTags vendor"]);
        assert!(is_metadata_page(&page));
    }

    #[test]
    fn test_metadata_page_other_payload() {
        // ---
        let page = make_page(48000, &[b"OpusData"]);
        assert!(!is_metadata_page(&page));

        let page = make_page(48000, &[b"audio payload bytes"]);
        assert!(!is_metadata_page(&page));
    }

    #[test]
    fn test_metadata_page_truncated_payload() {
        // ---
        let mut page = make_page(0, &[b"OpusHead\x01"]);
        page.truncate(HEADER_LEN + 1 + 4); // cut inside the signature
        assert!(!is_metadata_page(&page));
    }

    #[test]
    fn test_scanner_reassembles_split_page() {
        // ---
        let page = make_page(96000, &[b"first", b"second"]);
        let (head, tail) = page.split_at(10);

        let mut scanner = PageScanner::new();
        scanner.push(head);
        assert!(scanner.next_page().is_none());

        scanner.push(tail);
        let scanned = scanner.next_page().expect("page should complete");
        assert_eq!(scanned.granule_position, 96000);
        assert_eq!(scanned.body, b"firstsecond");
    }

    #[test]
    fn test_scanner_skips_leading_garbage() {
        // ---
        let mut data = Vec::from(&b"garbage!"[..]);
        data.extend_from_slice(&make_page(48000, &[b"payload"]));

        let mut scanner = PageScanner::new();
        scanner.push(&data);

        let scanned = scanner.next_page().expect("page after garbage");
        assert_eq!(scanned.granule_position, 48000);
    }

    #[test]
    fn test_scanner_yields_pages_in_order() {
        // ---
        let mut data = make_page(48000, &[b"a"]);
        data.extend_from_slice(&make_page(96000, &[b"b"]));

        let mut scanner = PageScanner::new();
        scanner.push(&data);

        assert_eq!(scanner.next_page().unwrap().granule_position, 48000);
        assert_eq!(scanner.next_page().unwrap().granule_position, 96000);
        assert!(scanner.next_page().is_none());
    }

    #[test]
    fn test_segments_mark_packet_completion() {
        // ---
        let long = vec![0xAAu8; 255];
        let page = make_page(0, &[&long, b"tail", b"next"]);

        let mut scanner = PageScanner::new();
        scanner.push(&page);
        let scanned = scanner.next_page().unwrap();

        let marks: Vec<bool> = scanned.segments().map(|(_, complete)| complete).collect();
        assert_eq!(marks, vec![false, true, true]);
    }
}
