//! Symmetric binary serialisation
//!
//! A single [`Serialise`] implementation drives both directions: when writing
//! it reads the value and emits it, when reading it overwrites the value with
//! what the stream holds. All integers are little-endian.

use std::io::Write;

use crate::core::{Error, Result};
use crate::serialise::version::{CURRENT_VERSION, VersionGate};

/// A type that can be written to and read from a [`Serialiser`]
pub trait Serialise {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()>;
}

/// One direction of the binary stream
pub trait Serialiser {
    /// True when the stream fills values in
    fn is_reading(&self) -> bool;

    /// Format version of the stream
    fn version(&self) -> u32;

    fn serialise_u8(&mut self, value: &mut u8) -> Result<()>;
    fn serialise_u32(&mut self, value: &mut u32) -> Result<()>;
    fn serialise_u64(&mut self, value: &mut u64) -> Result<()>;

    /// Raw bytes without a length prefix
    ///
    /// Reading resizes `bytes` to `len`; writing emits exactly `len` bytes,
    /// padding with zeros if `bytes` is shorter.
    fn serialise_raw(&mut self, bytes: &mut Vec<u8>, len: u64) -> Result<()>;

    /// Skip `len` bytes (reading) or emit `len` zero bytes (writing)
    fn skip(&mut self, len: u64) -> Result<()>;

    /// Bytes consumed or produced so far
    fn position(&self) -> u64;

    /// Bytes left to read, if the stream is bounded
    fn remaining(&self) -> Option<u64>;

    fn is_writing(&self) -> bool {
        !self.is_reading()
    }

    /// Whether this stream's version carries an optional field
    fn has(&self, gate: VersionGate) -> bool {
        gate.present_in(self.version())
    }

    fn serialise_bool(&mut self, value: &mut bool) -> Result<()> {
        let mut byte = u8::from(*value);
        self.serialise_u8(&mut byte)?;
        *value = byte != 0;
        Ok(())
    }

    fn serialise_f32(&mut self, value: &mut f32) -> Result<()> {
        let mut bits = value.to_bits();
        self.serialise_u32(&mut bits)?;
        *value = f32::from_bits(bits);
        Ok(())
    }

    fn serialise_string(&mut self, value: &mut String) -> Result<()> {
        let mut bytes = std::mem::take(value).into_bytes();
        let mut len = u32::try_from(bytes.len())
            .map_err(|_| Error::SerialisationRead("string too long".into()))?;
        self.serialise_u32(&mut len)?;
        self.serialise_raw(&mut bytes, u64::from(len))?;
        *value = String::from_utf8(bytes)
            .map_err(|e| Error::SerialisationRead(format!("invalid UTF-8 string: {e}")))?;
        Ok(())
    }

    /// Count-prefixed array of serialisable values
    fn serialise_array<T: Serialise + Default>(&mut self, items: &mut Vec<T>) -> Result<()> {
        let mut count = items.len() as u64;
        self.serialise_u64(&mut count)?;
        if self.is_reading() {
            // every element takes at least one byte
            if let Some(remaining) = self.remaining() {
                if count > remaining {
                    return Err(Error::SerialisationRead(format!(
                        "array of {count} elements exceeds {remaining} remaining bytes"
                    )));
                }
            }
            items.clear();
            items.resize_with(count as usize, T::default);
        }
        for item in items.iter_mut() {
            item.serialise(self)?;
        }
        Ok(())
    }

    /// Presence flag followed by the value
    fn serialise_option<T: Serialise + Default>(&mut self, value: &mut Option<T>) -> Result<()> {
        let mut present = value.is_some();
        self.serialise_bool(&mut present)?;
        if self.is_reading() {
            *value = present.then(T::default);
        }
        if let Some(inner) = value.as_mut() {
            inner.serialise(self)?;
        }
        Ok(())
    }
}

impl Serialise for u8 {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_u8(self)
    }
}

impl Serialise for u32 {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_u32(self)
    }
}

impl Serialise for u64 {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_u64(self)
    }
}

impl Serialise for String {
    fn serialise<S: Serialiser + ?Sized>(&mut self, ser: &mut S) -> Result<()> {
        ser.serialise_string(self)
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Serialiser that emits values into a writer
pub struct WriteSerialiser<W: Write> {
    writer: W,
    version: u32,
    written: u64,
}

impl<W: Write> WriteSerialiser<W> {
    /// Write at the current format version
    pub fn new(writer: W) -> Self {
        Self::with_version(writer, CURRENT_VERSION)
    }

    /// Write at an older format version, omitting gated fields it lacks
    pub fn with_version(writer: W, version: u32) -> Self {
        Self { writer, version, written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

impl<W: Write> Serialiser for WriteSerialiser<W> {
    fn is_reading(&self) -> bool {
        false
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn serialise_u8(&mut self, value: &mut u8) -> Result<()> {
        self.emit(&[*value])
    }

    fn serialise_u32(&mut self, value: &mut u32) -> Result<()> {
        self.emit(&value.to_le_bytes())
    }

    fn serialise_u64(&mut self, value: &mut u64) -> Result<()> {
        self.emit(&value.to_le_bytes())
    }

    fn serialise_raw(&mut self, bytes: &mut Vec<u8>, len: u64) -> Result<()> {
        let len = len as usize;
        if bytes.len() >= len {
            self.emit(&bytes[..len])
        } else {
            let present = bytes.len();
            self.emit(&bytes[..present])?;
            self.emit(&vec![0u8; len - present])
        }
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        self.emit(&vec![0u8; len as usize])
    }

    fn position(&self) -> u64 {
        self.written
    }

    fn remaining(&self) -> Option<u64> {
        None
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Serialiser that fills values from a byte slice
pub struct ReadSerialiser<'a> {
    data: &'a [u8],
    pos: usize,
    version: u32,
}

impl<'a> ReadSerialiser<'a> {
    pub fn new(data: &'a [u8], version: u32) -> Self {
        Self { data, pos: 0, version }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(Error::SerialisationRead(format!(
                "read of {len} bytes at offset {} overruns {}-byte chunk",
                self.pos,
                self.data.len()
            ))),
        }
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

impl Serialiser for ReadSerialiser<'_> {
    fn is_reading(&self) -> bool {
        true
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn serialise_u8(&mut self, value: &mut u8) -> Result<()> {
        *value = self.take_array::<1>()?[0];
        Ok(())
    }

    fn serialise_u32(&mut self, value: &mut u32) -> Result<()> {
        *value = u32::from_le_bytes(self.take_array()?);
        Ok(())
    }

    fn serialise_u64(&mut self, value: &mut u64) -> Result<()> {
        *value = u64::from_le_bytes(self.take_array()?);
        Ok(())
    }

    fn serialise_raw(&mut self, bytes: &mut Vec<u8>, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| Error::SerialisationRead(format!("length {len} too large")))?;
        let src = self.take(len)?;
        bytes.clear();
        bytes.extend_from_slice(src);
        Ok(())
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| Error::SerialisationRead(format!("length {len} too large")))?;
        self.take(len).map(|_| ())
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn remaining(&self) -> Option<u64> {
        Some((self.data.len() - self.pos) as u64)
    }
}
