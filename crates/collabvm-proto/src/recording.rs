//! On-disk layout of session recordings.
//!
//! A recording file is one encoded [`RecordingFileHeader`] followed by zero
//! or more concatenated [`ServerMessage`](crate::ServerMessage) frames. The
//! header is rewritten in place at offset 0 whenever a keyframe lands or the
//! file is closed, so its encoded size must never change after the first
//! write: the `keyframes` vector is allocated at full capacity up front and
//! `keyframe_count` tracks the filled prefix.

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Keyframe {
    /// Byte offset of the first frame recorded after this keyframe.
    pub file_offset: u64,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingFileHeader {
    pub vm_id: u32,
    /// Milliseconds since the Unix epoch.
    pub start_time: u64,
    /// Zero until the file is closed.
    pub stop_time: u64,
    /// Number of populated entries at the front of `keyframes`.
    pub keyframe_count: u32,
    pub keyframes: Vec<Keyframe>,
}

impl RecordingFileHeader {
    pub fn new(vm_id: u32, start_time: u64, keyframe_capacity: usize) -> Self {
        Self {
            vm_id,
            start_time,
            stop_time: 0,
            keyframe_count: 0,
            keyframes: vec![Keyframe::default(); keyframe_capacity],
        }
    }

    /// The populated prefix of the keyframe index, sorted by timestamp.
    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes[..self.keyframe_count as usize]
    }

    /// Record the next keyframe. Returns false when the index is full, which
    /// signals the caller to roll over to a new file.
    pub fn push_keyframe(&mut self, keyframe: Keyframe) -> bool {
        let index = self.keyframe_count as usize;
        if index >= self.keyframes.len() {
            return false;
        }
        self.keyframes[index] = keyframe;
        self.keyframe_count += 1;
        true
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(ProtoError::from)
    }

    pub fn read_from<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        bincode::deserialize_from(reader).map_err(ProtoError::from)
    }

    /// Encoded size of a header with the given keyframe capacity. Every
    /// rewrite of the same file produces exactly this many bytes.
    pub fn encoded_len(keyframe_capacity: usize) -> u64 {
        // vm_id + start_time + stop_time + keyframe_count + vec length prefix
        (4 + 8 + 8 + 4 + 8 + keyframe_capacity * 16) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_stable_across_rewrites() {
        let mut header = RecordingFileHeader::new(3, 1_000, 4);
        let empty = header.to_bytes().unwrap();
        assert_eq!(empty.len() as u64, RecordingFileHeader::encoded_len(4));

        assert!(header.push_keyframe(Keyframe {
            file_offset: 96,
            timestamp: 2_000,
        }));
        header.stop_time = 5_000;
        let filled = header.to_bytes().unwrap();
        assert_eq!(empty.len(), filled.len());
    }

    #[test]
    fn keyframe_index_fills_then_refuses() {
        let mut header = RecordingFileHeader::new(1, 0, 2);
        assert!(header.push_keyframe(Keyframe {
            file_offset: 10,
            timestamp: 1,
        }));
        assert!(header.push_keyframe(Keyframe {
            file_offset: 20,
            timestamp: 2,
        }));
        assert!(!header.push_keyframe(Keyframe {
            file_offset: 30,
            timestamp: 3,
        }));
        assert_eq!(header.keyframes().len(), 2);
    }

    #[test]
    fn header_roundtrip_through_reader() {
        let mut header = RecordingFileHeader::new(7, 123, 3);
        header.push_keyframe(Keyframe {
            file_offset: 64,
            timestamp: 456,
        });
        let bytes = header.to_bytes().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = RecordingFileHeader::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, header);
    }
}
