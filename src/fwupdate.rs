//! Chunked firmware-update injection tracking
//!
//! The update image is a fixed 256-byte header followed by a body whose
//! length the header declares. Chunks are injected through the fw-update
//! ioctl group; this module tracks how much has gone in on our side so a
//! later injected-size query can detect when the modem's own count desyncs
//! from ours. That desync has no recovery path; the engine aborts and
//! forces a modem reset.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::usrsock::errno::*;

/// Size of the update-image header block
pub(crate) const FW_HEADER_LEN: usize = 256;
/// Magic at offset 0 of the header
pub(crate) const FW_MAGIC: [u8; 4] = *b"ALTF";

/// Parsed firmware-update header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwHeader {
    /// Declared length of the body that follows the header
    pub body_len: u32,
    /// Target firmware version string, NUL-padded in the header
    pub version: String,
}

fn parse_header(raw: &[u8]) -> Option<FwHeader> {
    debug_assert_eq!(raw.len(), FW_HEADER_LEN);
    let mut buf = raw;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != FW_MAGIC {
        return None;
    }
    let body_len = buf.get_u32_le();
    let version_raw = &buf[..32];
    let end = version_raw
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(version_raw.len());
    let version = std::str::from_utf8(&version_raw[..end]).ok()?.to_owned();
    Some(FwHeader { body_len, version })
}

/// Injection progress, owned by the modem state
#[derive(Debug, Default)]
pub(crate) struct FwUpdater {
    header_buf: BytesMut,
    pub(crate) header: Option<FwHeader>,
    pub(crate) body_injected: u32,
}

impl FwUpdater {
    /// Accept a header chunk; returns the parsed header once complete
    ///
    /// Errors are negative errnos ready for the ack result.
    pub(crate) fn inject_header(&mut self, chunk: &Bytes) -> Result<Option<&FwHeader>, i32> {
        if self.header.is_some() {
            return Err(-EPERM);
        }
        if self.header_buf.len() + chunk.len() > FW_HEADER_LEN {
            return Err(-EINVAL);
        }
        self.header_buf.put_slice(chunk);
        if self.header_buf.len() < FW_HEADER_LEN {
            return Ok(None);
        }
        match parse_header(&self.header_buf) {
            Some(h) => {
                self.header = Some(h);
                Ok(self.header.as_ref())
            }
            None => {
                self.header_buf.clear();
                Err(-EINVAL)
            }
        }
    }

    /// Account for an accepted body chunk
    pub(crate) fn inject_body(&mut self, len: u32) -> Result<(), i32> {
        let header = self.header.as_ref().ok_or(-EPERM)?;
        if self.body_injected + len > header.body_len {
            return Err(-EINVAL);
        }
        self.body_injected += len;
        Ok(())
    }

    /// Whether a header chunk of `len` bytes still fits the header block
    pub(crate) fn header_fits(&self, len: usize) -> bool {
        self.header_buf.len() + len <= FW_HEADER_LEN
    }

    /// Whether a body chunk of `len` bytes fits the declared body length
    pub(crate) fn body_fits(&self, len: u32) -> bool {
        match &self.header {
            Some(h) => self.body_injected + len <= h.body_len,
            None => false,
        }
    }

    /// Bytes injected on our side, header included
    pub(crate) fn total_injected(&self) -> u32 {
        self.header_buf.len() as u32 + self.body_injected
    }

    /// Whether the modem's accepted-byte count matches ours
    pub(crate) fn verify_injected(&self, modem_count: u32) -> bool {
        modem_count == self.total_injected()
    }

    /// Whether the whole declared body has been injected
    pub(crate) fn complete(&self) -> bool {
        match &self.header {
            Some(h) => self.body_injected == h.body_len,
            None => false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.header_buf.clear();
        self.header = None;
        self.body_injected = 0;
    }
}
