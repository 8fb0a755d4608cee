//! Byte-level patches between two equally sized buffers.
//!
//! A patch is a concatenation of `(u32 LE offset, u32 LE length, payload)`
//! records. The differ coalesces changed runs separated by fewer than eight
//! unchanged bytes, trading a few redundant payload bytes for fewer records.

use super::TraceError;

/// Changed runs closer than this many bytes are merged into one record.
const COALESCE_GAP: usize = 8;

/// An opaque byte patch, applied in place over the previous buffer contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytesPatch {
    data: Vec<u8>,
}

impl BytesPatch {
    /// Wraps raw patch records read from a trace file.
    pub fn from_data(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The raw patch records.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Computes the patch turning `old` into `new`. Both buffers must have the
    /// same length.
    pub fn diff(old: &[u8], new: &[u8]) -> Self {
        debug_assert_eq!(old.len(), new.len());
        let mut data = Vec::new();
        let mut run: Option<(usize, usize)> = None;
        let emit = |start: usize, end: usize, data: &mut Vec<u8>| {
            data.extend_from_slice(&(start as u32).to_le_bytes());
            data.extend_from_slice(&((end - start + 1) as u32).to_le_bytes());
            data.extend_from_slice(&new[start..=end]);
        };
        for (offset, (&o, &n)) in old.iter().zip(new.iter()).enumerate() {
            if o == n {
                continue;
            }
            match run {
                None => run = Some((offset, offset)),
                Some((start, end)) if offset - end < COALESCE_GAP => run = Some((start, offset)),
                Some((start, end)) => {
                    emit(start, end, &mut data);
                    run = Some((offset, offset));
                }
            }
        }
        if let Some((start, end)) = run {
            emit(start, end, &mut data);
        }
        Self { data }
    }

    /// Applies the patch over `base` in place.
    pub fn apply(&self, base: &mut [u8]) -> Result<(), TraceError> {
        let mut records = self.data.as_slice();
        while !records.is_empty() {
            if records.len() < 8 {
                return Err(TraceError::Format("truncated byte patch header".into()));
            }
            let offset = u32::from_le_bytes(records[0..4].try_into().expect("sized")) as usize;
            let length = u32::from_le_bytes(records[4..8].try_into().expect("sized")) as usize;
            records = &records[8..];
            if records.len() < length {
                return Err(TraceError::Format("truncated byte patch payload".into()));
            }
            let end = offset
                .checked_add(length)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| TraceError::Format("byte patch outside the buffer".into()))?;
            base[offset..end].copy_from_slice(&records[..length]);
            records = &records[length..];
        }
        Ok(())
    }
}
