//! Payload readers and writers.
//!
//! Command payloads are encoded in device byte order (little-endian unless ping
//! reports a big-endian target). Strings are `u16` length-prefixed UTF-8.

use crate::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

pub struct PayloadWriter {
    buf: BytesMut,
    endian: Endian,
}

impl PayloadWriter {
    pub fn new(endian: Endian) -> Self {
        Self {
            buf: BytesMut::new(),
            endian,
        }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        match self.endian {
            Endian::Little => self.buf.put_u16_le(v),
            Endian::Big => self.buf.put_u16(v),
        }
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        match self.endian {
            Endian::Little => self.buf.put_u32_le(v),
            Endian::Big => self.buf.put_u32(v),
        }
        self
    }

    pub fn i32(self, v: i32) -> Self {
        self.u32(v as u32)
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.put_slice(data);
        self
    }

    /// Write `u32` length followed by raw bytes.
    pub fn blob(self, data: &[u8]) -> Self {
        self.u32(data.len() as u32).bytes(data)
    }

    pub fn string(self, s: &str) -> Self {
        let len = s.len().min(u16::MAX as usize);
        self.u16(len as u16).bytes(&s.as_bytes()[..len])
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a reply payload. `what` names the payload in errors.
pub struct PayloadReader {
    buf: Bytes,
    endian: Endian,
    what: &'static str,
}

impl PayloadReader {
    pub fn new(buf: Bytes, endian: Endian, what: &'static str) -> Self {
        Self { buf, endian, what }
    }

    fn ensure(&self, n: usize) -> Result<(), Error> {
        if self.buf.remaining() < n {
            return Err(Error::MalformedPayload(self.what));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, Error> {
        self.ensure(2)?;
        Ok(match self.endian {
            Endian::Little => self.buf.get_u16_le(),
            Endian::Big => self.buf.get_u16(),
        })
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        self.ensure(4)?;
        Ok(match self.endian {
            Endian::Little => self.buf.get_u32_le(),
            Endian::Big => self.buf.get_u32(),
        })
    }

    pub fn i32(&mut self) -> Result<i32, Error> {
        self.u32().map(|v| v as i32)
    }

    pub fn bytes(&mut self, n: usize) -> Result<Bytes, Error> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n))
    }

    pub fn blob(&mut self) -> Result<Bytes, Error> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    pub fn string(&mut self) -> Result<String, Error> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    /// Read a `u32` count followed by `count` items produced by `f`.
    pub fn list<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, Error>,
    ) -> Result<Vec<T>, Error> {
        let count = self.u32()? as usize;
        // every item takes at least one byte, protect against garbage counts
        if count > self.remaining() {
            return Err(Error::MalformedPayload(self.what));
        }
        (0..count).map(|_| f(self)).collect()
    }

    pub fn rest(self) -> Bytes {
        self.buf
    }
}
