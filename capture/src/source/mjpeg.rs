use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

const HEADER_END: &[u8] = b"\r\n\r\n";
const DEFAULT_BOUNDARY: &str = "frame";
/// A part larger than this is assumed to be a lost boundary; the buffer is dropped.
const MAX_PART_BYTES: usize = 5 * 1024 * 1024;

/// Parse state for a `multipart/x-mixed-replace` JPEG stream.
enum ParseState {
    /// Looking for the boundary marker, e.g. `--frame`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until `Content-Length` is reached or the next boundary.
    CollectingJpeg { content_length: Option<usize> },
}

/// Incremental splitter turning an MJPEG byte stream into individual JPEGs.
///
/// Used for both remote HTTP streams and ffmpeg's `mpjpeg` output. Chunks may
/// split markers, headers or images at any byte.
pub struct MjpegSplitter {
    marker: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the next boundary.
    scan_from: usize,
}

impl MjpegSplitter {
    /// `boundary` is the multipart boundary parameter; a leading `--` is tolerated.
    pub fn new(boundary: &str) -> Self {
        let marker = if boundary.starts_with("--") {
            boundary.as_bytes().to_vec()
        } else {
            format!("--{boundary}").into_bytes()
        };
        Self {
            marker,
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Build a splitter from a response `Content-Type`. Returns `None` for
    /// non-multipart content; multipart without a boundary uses `frame`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let lower = content_type.to_ascii_lowercase();
        if !lower.trim_start().starts_with("multipart/") {
            return None;
        }
        let boundary = content_type
            .split(';')
            .skip(1)
            .filter_map(|param| {
                let (key, value) = param.split_once('=')?;
                key.trim()
                    .eq_ignore_ascii_case("boundary")
                    .then(|| value.trim().trim_matches('"').to_string())
            })
            .find(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
        Some(Self::new(&boundary))
    }

    /// Feed a chunk and return every JPEG completed by it, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        // Discard everything up to and including the boundary
                        let _ = self.buffer.split_to(pos + self.marker.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        let keep = self.marker.len().saturating_sub(1);
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let headers = self.buffer.split_to(pos + HEADER_END.len());
                        let content_length = parse_content_length(&headers[..pos]);
                        self.scan_from = 0;
                        self.state = ParseState::CollectingJpeg { content_length };
                    } else if self.buffer.len() > MAX_PART_BYTES {
                        warn!(bytes = self.buffer.len(), "MJPEG part headers never ended, resyncing");
                        self.resync();
                        break;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg {
                    content_length: Some(len),
                } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let jpeg = self.buffer.split_to(len).freeze();
                    if !jpeg.is_empty() {
                        debug!(bytes = jpeg.len(), "MJPEG part complete (content-length)");
                        frames.push(jpeg);
                    }
                    self.state = ParseState::SeekingBoundary;
                }
                ParseState::CollectingJpeg {
                    content_length: None,
                } => {
                    // Look for the next boundary to know where JPEG ends
                    let found = find_subsequence(&self.buffer[self.scan_from..], &self.marker);
                    if let Some(pos) = found {
                        let jpeg_end = self.scan_from + pos;
                        // Strip trailing \r\n before boundary
                        let end = if jpeg_end >= 2
                            && self.buffer[jpeg_end - 2] == b'\r'
                            && self.buffer[jpeg_end - 1] == b'\n'
                        {
                            jpeg_end - 2
                        } else {
                            jpeg_end
                        };

                        let jpeg = Bytes::copy_from_slice(&self.buffer[..end]);

                        // Advance past the boundary
                        let _ = self.buffer.split_to(jpeg_end + self.marker.len());

                        if !jpeg.is_empty() {
                            debug!(bytes = jpeg.len(), "MJPEG part complete (boundary)");
                            frames.push(jpeg);
                        }

                        // Already past boundary, go to header parsing
                        self.state = ParseState::SeekingHeaderEnd;
                    } else if self.buffer.len() > MAX_PART_BYTES {
                        warn!(bytes = self.buffer.len(), "MJPEG part exceeded size limit, resyncing");
                        self.resync();
                        break;
                    } else {
                        // Avoid re-scanning old data
                        self.scan_from = self.buffer.len().saturating_sub(self.marker.len());
                        break;
                    }
                }
            }
        }

        frames
    }

    fn resync(&mut self) {
        self.buffer.clear();
        self.scan_from = 0;
        self.state = ParseState::SeekingBoundary;
    }
}

fn parse_content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(jpeg: &[u8], with_length: bool) -> Vec<u8> {
        let mut out = b"--frame\r\nContent-Type: image/jpeg\r\n".to_vec();
        if with_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", jpeg.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(jpeg);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn boundary_delimited_parts_split_across_chunks() {
        let mut stream = Vec::new();
        stream.extend(part(&[0xFF, 0xD8, 1, 2, 0xFF, 0xD9], false));
        stream.extend(part(&[0xFF, 0xD8, 3, 4, 0xFF, 0xD9], false));
        stream.extend(part(&[0xFF, 0xD8, 5, 0xFF, 0xD9], false));

        let mut splitter = MjpegSplitter::new("frame");
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            frames.extend(splitter.push(chunk));
        }
        // The last part is only complete once another boundary arrives.
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        assert_eq!(&frames[1][..], &[0xFF, 0xD8, 3, 4, 0xFF, 0xD9]);

        let tail = splitter.push(b"--frame\r\n");
        assert_eq!(tail.len(), 1);
        assert_eq!(&tail[0][..], &[0xFF, 0xD8, 5, 0xFF, 0xD9]);
    }

    #[test]
    fn content_length_parts_emit_immediately() {
        let mut splitter = MjpegSplitter::new("frame");
        let frames = splitter.push(&part(&[0xFF, 0xD8, 9, 0xFF, 0xD9], true));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, 9, 0xFF, 0xD9]);

        let mut frames = Vec::new();
        for byte in part(&[0xFF, 0xD8, 7, 0xFF, 0xD9], true) {
            frames.extend(splitter.push(&[byte]));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, 7, 0xFF, 0xD9]);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut splitter = MjpegSplitter::new("frame");
        let mut stream = b"HTTP junk before the first part".to_vec();
        stream.extend(part(&[1, 2, 3], true));
        let frames = splitter.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[1, 2, 3]);
    }

    #[test]
    fn content_type_boundary_is_honoured() {
        let mut splitter =
            MjpegSplitter::from_content_type("multipart/x-mixed-replace; boundary=\"myboundary\"")
                .unwrap();
        let frames = splitter.push(b"--myboundary\r\nContent-Length: 2\r\n\r\nab\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"ab");

        assert!(MjpegSplitter::from_content_type("image/jpeg").is_none());
    }

    #[test]
    fn dashed_boundary_parameter_is_not_doubled() {
        let mut splitter =
            MjpegSplitter::from_content_type("multipart/x-mixed-replace;boundary=--ffmpeg").unwrap();
        let frames = splitter.push(b"--ffmpeg\r\nContent-Length: 1\r\n\r\nz\r\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn content_length_header_parsing() {
        assert_eq!(parse_content_length(b"Content-Type: image/jpeg\r\ncontent-length: 42"), Some(42));
        assert_eq!(parse_content_length(b"Content-Type: image/jpeg"), None);
    }
}
