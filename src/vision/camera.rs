//! MJPEG frame extraction from a raw HTTP byte stream.
//!
//! ESP32-CAM class devices serve `multipart/x-mixed-replace` MJPEG. Rather
//! than parse multipart headers (firmware boundary strings vary), the
//! splitter scans the byte stream for JPEG start/end markers and yields
//! complete frames.

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// A frame larger than this is not a camera frame; reset and resync.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Incremental JPEG frame splitter.
#[derive(Default)]
pub struct JpegFrameSplitter {
    buffer: Vec<u8>,
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < 2 {
        return None;
    }
    (from..haystack.len() - 1).find(|&i| haystack[i] == marker[0] && haystack[i + 1] == marker[1])
}

impl JpegFrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete frame it closed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buffer, SOI, 0) else {
                // No frame start in sight; keep one byte in case a marker
                // straddles the chunk boundary.
                if self.buffer.len() > 1 {
                    let tail = self.buffer.split_off(self.buffer.len() - 1);
                    self.buffer = tail;
                }
                break;
            };
            // Discard inter-frame noise (multipart headers, boundaries).
            if start > 0 {
                self.buffer.drain(..start);
            }

            match find_marker(&self.buffer, EOI, 2) {
                Some(end) => {
                    let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
                    frames.push(frame);
                }
                None => {
                    if self.buffer.len() > MAX_FRAME_BYTES {
                        self.buffer.clear();
                    }
                    break;
                }
            }
        }
        frames
    }
}
