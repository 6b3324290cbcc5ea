//! Spool file frame codec.
//!
//! Spool files are a sequence of length-prefixed JSON frames:
//!
//! ```text
//! [u32 little-endian length][JSON-encoded RawEvent]
//! [u32 little-endian length][JSON-encoded RawEvent]
//! ...
//! ```
//!
//! Closed files may be gzip-compressed, in which case their name ends in
//! `.gz`. [`EventDecoder`] is a lazy, single-pass iterator over the frames.

use crate::error::{Error, Result};
use crate::event::RawEvent;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::Path;

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Encode one event as a frame, returning the number of bytes written.
pub fn write_frame<W: Write>(writer: &mut W, event: &RawEvent) -> Result<usize> {
    let body = serde_json::to_vec(event)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    Ok(4 + body.len())
}

/// Whether a spool file is gzip-compressed, judged by extension.
pub fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Open a spool file for decoding, transparently handling gzip.
pub fn open_spool_file(path: &Path) -> Result<EventDecoder<Box<dyn Read + Send>>> {
    let file = File::open(path)?;

    let reader: Box<dyn Read + Send> = if is_compressed(path) {
        Box::new(BufReader::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Box::new(BufReader::new(file))
    };

    Ok(EventDecoder::new(reader))
}

/// Lazy decoder over the frames of a spool stream.
///
/// A frame whose body is not a valid [`RawEvent`] yields an error and decoding
/// continues with the next frame. A truncated frame (or a read error) yields an
/// error and ends the iteration, since frame boundaries are lost.
pub struct EventDecoder<R> {
    reader: R,
    finished: bool,
    frames_read: usize,
}

impl<R: Read> EventDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
            frames_read: 0,
        }
    }

    /// Number of frames consumed so far, including undecodable ones.
    pub fn frames_read(&self) -> usize {
        self.frames_read
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::TruncatedFrame {
                        expected: 4,
                        actual: filled,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        let mut body = Vec::with_capacity(len);
        let read = (&mut self.reader).take(len as u64).read_to_end(&mut body)?;
        if read < len {
            return Err(Error::TruncatedFrame {
                expected: len,
                actual: read,
            });
        }

        Ok(Some(body))
    }
}

impl<R: Read> Iterator for EventDecoder<R> {
    type Item = Result<RawEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_frame() {
            Ok(Some(body)) => {
                self.frames_read += 1;
                Some(serde_json::from_slice(&body).map_err(Error::from))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
