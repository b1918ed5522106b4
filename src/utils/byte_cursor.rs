use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::bytes;
use crate::utils::utf16::decode_utf16le_bytes_z;

/// Reads little-endian fields out of a render buffer, advancing only on success.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// A cursor at `pos`, which may be the end of the buffer but not past it.
    pub(crate) fn at(
        buf: &'a [u8],
        pos: usize,
        what: &'static str,
    ) -> DeserializationResult<Self> {
        bytes::slice_r(buf, pos, 0, what).map(|_| Self { buf, pos })
    }

    /// Position a cursor at a pointer value found inside the buffer.
    ///
    /// Pointers in a render buffer are offsets relative to the start of the buffer.
    pub(crate) fn at_pointer(
        buf: &'a [u8],
        pointer: u64,
        at: u64,
        what: &'static str,
    ) -> DeserializationResult<Self> {
        let out_of_bounds = || DeserializationError::PointerOutOfBounds {
            what,
            offset: at,
            pointer,
            len: buf.len(),
        };
        let pos = usize::try_from(pointer).map_err(|_| out_of_bounds())?;
        if pos >= buf.len() {
            return Err(out_of_bounds());
        }
        Ok(Self { buf, pos })
    }

    pub(crate) fn position(&self) -> u64 {
        self.pos as u64
    }

    pub(crate) fn take_bytes(
        &mut self,
        len: usize,
        what: &'static str,
    ) -> DeserializationResult<&'a [u8]> {
        let taken = bytes::slice_r(self.buf, self.pos, len, what)?;
        self.pos += taken.len();
        Ok(taken)
    }

    pub(crate) fn array<const N: usize>(
        &mut self,
        what: &'static str,
    ) -> DeserializationResult<[u8; N]> {
        let fixed = bytes::read_array_r::<N>(self.buf, self.pos, what)?;
        self.pos += N;
        Ok(fixed)
    }

    pub(crate) fn u16_named(&mut self, what: &'static str) -> DeserializationResult<u16> {
        self.array::<2>(what).map(u16::from_le_bytes)
    }

    pub(crate) fn u32_named(&mut self, what: &'static str) -> DeserializationResult<u32> {
        self.array::<4>(what).map(u32::from_le_bytes)
    }

    pub(crate) fn u64_named(&mut self, what: &'static str) -> DeserializationResult<u64> {
        self.array::<8>(what).map(u64::from_le_bytes)
    }

    /// Read a serialized SID (revision, sub-authority count, 48-bit authority, sub-authorities).
    pub(crate) fn sid_bytes(&mut self) -> DeserializationResult<&'a [u8]> {
        let start = self.pos;
        let remaining = self.buf.len().saturating_sub(start);
        if remaining < 8 {
            return Err(DeserializationError::Truncated {
                what: "sid",
                offset: start as u64,
                need: 8,
                have: remaining,
            });
        }

        let sub_count = self.buf[start + 1] as usize;
        let len = 8 + sub_count * 4;
        self.take_bytes(len, "sid")
    }

    /// Read a NUL-terminated UTF-16LE string.
    ///
    /// A string running to the end of the buffer without a terminator is accepted.
    pub(crate) fn null_terminated_utf16_string(&mut self) -> DeserializationResult<String> {
        let start = self.pos;
        let rest = &self.buf[start..];
        let mut end = rest.len() - rest.len() % 2;
        let mut consumed = end;
        for (i, unit) in rest.chunks_exact(2).enumerate() {
            if unit == [0, 0] {
                end = i * 2;
                consumed = end + 2;
                break;
            }
        }

        let s = decode_utf16le_bytes_z(&rest[..end]).map_err(|_| {
            DeserializationError::FailedToDecodeUtf16String {
                offset: start as u64,
            }
        })?;
        self.pos += consumed;
        Ok(s)
    }

    /// Read a NUL-terminated single byte string.
    pub(crate) fn null_terminated_bytes(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos += (end + 1).min(rest.len());
        &rest[..end]
    }
}
