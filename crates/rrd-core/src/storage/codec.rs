//! Fixed-width little-endian encoding helpers
//!
//! Every value has a constant encoded width so that a record's size only
//! depends on the archive definition, never on the values it holds.

use crate::error::RrdError;

/// Appends little-endian values to a byte buffer
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reads little-endian values from a byte slice
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], RrdError> {
        let end = self.offset + N;
        let slice = self.bytes.get(self.offset..end).ok_or_else(|| {
            RrdError::Corrupt(format!(
                "record truncated at byte {} (need {N} more)",
                self.offset
            ))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.offset = end;
        Ok(out)
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8, RrdError> {
        Ok(self.take::<1>()?[0])
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32, RrdError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub(crate) fn get_u64(&mut self) -> Result<u64, RrdError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    pub(crate) fn get_f64(&mut self) -> Result<f64, RrdError> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    pub(crate) fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], RrdError> {
        let end = self.offset + len;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| RrdError::Corrupt(format!("record truncated at byte {}", self.offset)))?;
        self.offset = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_values() {
        let mut writer = ByteWriter::default();
        writer.put_u8(7);
        writer.put_u32(0xDEAD_BEEF);
        writer.put_u64(1_641_600_000);
        writer.put_f64(f64::NAN);
        writer.put_f64(-273.15);
        assert_eq!(writer.len(), 1 + 4 + 8 + 8 + 8);

        let bytes = writer.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.get_u8().unwrap(), 7);
        assert_eq!(reader.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.get_u64().unwrap(), 1_641_600_000);
        assert!(reader.get_f64().unwrap().is_nan());
        assert_eq!(reader.get_f64().unwrap(), -273.15);
    }

    #[test]
    fn test_truncated_input_is_corrupt() {
        let mut reader = ByteReader::new(&[1, 2, 3]);
        assert!(matches!(reader.get_u32(), Err(RrdError::Corrupt(_))));
    }
}
