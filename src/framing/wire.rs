//! Little-endian primitive encoding shared by frame headers, handshakes and identifiers.

use crate::error::{GatewayError, Result};

/// Sink for little-endian primitive values.
pub trait WireWrite {
    /// Appends raw bytes.
    fn write_raw(&mut self, bytes: &[u8]);

    /// Appends a `u8`.
    fn write_u8(&mut self, value: u8) {
        self.write_raw(&[value]);
    }

    /// Appends a `bool` as one byte.
    fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    /// Appends a `u16`.
    fn write_u16(&mut self, value: u16) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends an `i32`.
    fn write_i32(&mut self, value: i32) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends a `u32`.
    fn write_u32(&mut self, value: u32) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends an `i64`.
    fn write_i64(&mut self, value: i64) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends a `u64`.
    fn write_u64(&mut self, value: u64) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends a `u128`.
    fn write_u128(&mut self, value: u128) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends an `f32`.
    fn write_f32(&mut self, value: f32) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends an `f64`.
    fn write_f64(&mut self, value: f64) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Appends an `i32` length followed by the bytes.
    fn write_len_prefixed(&mut self, bytes: &[u8]) {
        self.write_i32(bytes.len() as i32);
        self.write_raw(bytes);
    }

    /// Appends a length-prefixed UTF-8 string.
    fn write_str(&mut self, value: &str) {
        self.write_len_prefixed(value.as_bytes());
    }
}

impl WireWrite for Vec<u8> {
    fn write_raw(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Source of little-endian primitive values.
pub trait WireRead {
    /// Fills `dst` completely or fails without a partial guarantee.
    fn read_raw(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Bytes left to read.
    fn remaining(&self) -> usize;

    /// Reads a fixed-size array.
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut bytes = [0u8; N];
        self.read_raw(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads a `u8`.
    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a `bool`. Any non-zero byte is `true`.
    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `u16`.
    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Reads an `i32`.
    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Reads a `u32`.
    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Reads an `i64`.
    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Reads a `u64`.
    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Reads a `u128`.
    fn read_u128(&mut self) -> Result<u128> {
        Ok(u128::from_le_bytes(self.read_array()?))
    }

    /// Reads an `f32`.
    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Reads an `f64`.
    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Reads an `i32` length followed by that many bytes.
    fn read_len_prefixed(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| GatewayError::MalformedFrame(format!("negative length {len}")))?;
        if len > self.remaining() {
            return Err(GatewayError::MalformedFrame(format!(
                "length {len} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        let mut bytes = vec![0u8; len];
        self.read_raw(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads a length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_len_prefixed()?;
        String::from_utf8(bytes)
            .map_err(|err| GatewayError::MalformedFrame(format!("invalid utf-8 string: {err}")))
    }
}

impl WireRead for &[u8] {
    fn read_raw(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.len() < dst.len() {
            return Err(GatewayError::MalformedFrame(format!(
                "unexpected end of data: needed {} bytes, {} left",
                dst.len(),
                self.len()
            )));
        }
        let (head, tail) = self.split_at(dst.len());
        dst.copy_from_slice(head);
        *self = tail;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}
