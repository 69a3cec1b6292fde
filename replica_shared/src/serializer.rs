//! Serializer capability.
//!
//! A [`Serializer`] is symmetric: the same `serialize(&mut value, name)` call
//! writes the value in [`WriteSerializer`] and overwrites it in
//! [`ReadSerializer`]. Every call returns whether the serializer is still
//! valid; once invalid it stays invalid and further calls are no-ops, so
//! callers can chain with `&=` and check once.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::math::Vec3;

/// Upper bound on any length-prefixed string.
pub const MAX_STRING_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerMode {
    Write,
    Read,
}

pub trait Serializer {
    fn mode(&self) -> SerializerMode;
    fn is_valid(&self) -> bool;

    fn serialize_bool(&mut self, value: &mut bool, name: &str) -> bool;
    fn serialize_u8(&mut self, value: &mut u8, name: &str) -> bool;
    fn serialize_u32(&mut self, value: &mut u32, name: &str) -> bool;
    fn serialize_u64(&mut self, value: &mut u64, name: &str) -> bool;
    fn serialize_i64(&mut self, value: &mut i64, name: &str) -> bool;
    fn serialize_f32(&mut self, value: &mut f32, name: &str) -> bool;
    fn serialize_string(&mut self, value: &mut String, name: &str) -> bool;

    fn serialize_vec3(&mut self, value: &mut Vec3, name: &str) -> bool {
        self.serialize_f32(&mut value.x, name)
            && self.serialize_f32(&mut value.y, name)
            && self.serialize_f32(&mut value.z, name)
    }
}

/// Writes values into a growable buffer.
#[derive(Debug)]
pub struct WriteSerializer {
    buf: BytesMut,
    valid: bool,
}

impl Default for WriteSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteSerializer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            valid: true,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the written bytes, or `None` if any field was rejected.
    pub fn finish(self) -> Option<Bytes> {
        self.valid.then(|| self.buf.freeze())
    }
}

impl Serializer for WriteSerializer {
    fn mode(&self) -> SerializerMode {
        SerializerMode::Write
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn serialize_bool(&mut self, value: &mut bool, _name: &str) -> bool {
        if self.valid {
            self.buf.put_u8(u8::from(*value));
        }
        self.valid
    }

    fn serialize_u8(&mut self, value: &mut u8, _name: &str) -> bool {
        if self.valid {
            self.buf.put_u8(*value);
        }
        self.valid
    }

    fn serialize_u32(&mut self, value: &mut u32, _name: &str) -> bool {
        if self.valid {
            self.buf.put_u32(*value);
        }
        self.valid
    }

    fn serialize_u64(&mut self, value: &mut u64, _name: &str) -> bool {
        if self.valid {
            self.buf.put_u64(*value);
        }
        self.valid
    }

    fn serialize_i64(&mut self, value: &mut i64, _name: &str) -> bool {
        if self.valid {
            self.buf.put_i64(*value);
        }
        self.valid
    }

    fn serialize_f32(&mut self, value: &mut f32, _name: &str) -> bool {
        if self.valid {
            self.buf.put_f32(*value);
        }
        self.valid
    }

    fn serialize_string(&mut self, value: &mut String, name: &str) -> bool {
        if !self.valid {
            return false;
        }
        if value.len() > MAX_STRING_LEN {
            tracing::debug!(field = name, len = value.len(), "string field too long");
            self.valid = false;
            return false;
        }
        self.buf.put_u16(value.len() as u16);
        self.buf.extend_from_slice(value.as_bytes());
        true
    }
}

/// Reads values back out of a received payload.
#[derive(Debug)]
pub struct ReadSerializer {
    buf: Bytes,
    valid: bool,
}

impl ReadSerializer {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self {
            buf: buf.into(),
            valid: true,
        }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&mut self, n: usize, name: &str) -> bool {
        if self.valid && self.buf.remaining() < n {
            tracing::debug!(field = name, need = n, have = self.buf.remaining(), "payload truncated");
            self.valid = false;
        }
        self.valid
    }
}

impl Serializer for ReadSerializer {
    fn mode(&self) -> SerializerMode {
        SerializerMode::Read
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn serialize_bool(&mut self, value: &mut bool, name: &str) -> bool {
        if self.need(1, name) {
            match self.buf.get_u8() {
                0 => *value = false,
                1 => *value = true,
                _ => self.valid = false,
            }
        }
        self.valid
    }

    fn serialize_u8(&mut self, value: &mut u8, name: &str) -> bool {
        if self.need(1, name) {
            *value = self.buf.get_u8();
        }
        self.valid
    }

    fn serialize_u32(&mut self, value: &mut u32, name: &str) -> bool {
        if self.need(4, name) {
            *value = self.buf.get_u32();
        }
        self.valid
    }

    fn serialize_u64(&mut self, value: &mut u64, name: &str) -> bool {
        if self.need(8, name) {
            *value = self.buf.get_u64();
        }
        self.valid
    }

    fn serialize_i64(&mut self, value: &mut i64, name: &str) -> bool {
        if self.need(8, name) {
            *value = self.buf.get_i64();
        }
        self.valid
    }

    fn serialize_f32(&mut self, value: &mut f32, name: &str) -> bool {
        if self.need(4, name) {
            *value = self.buf.get_f32();
        }
        self.valid
    }

    fn serialize_string(&mut self, value: &mut String, name: &str) -> bool {
        if !self.need(2, name) {
            return false;
        }
        let len = self.buf.get_u16() as usize;
        if len > MAX_STRING_LEN || !self.need(len, name) {
            self.valid = false;
            return false;
        }
        let raw = self.buf.split_to(len);
        match std::str::from_utf8(&raw) {
            Ok(s) => {
                *value = s.to_owned();
                true
            }
            Err(_) => {
                self.valid = false;
                false
            }
        }
    }
}
