use anyhow::{Context, Result};
use std::io::Read;

use crate::binary_diff::{Delta, DiffChunk};
use crate::error::PatchError;
use crate::util;

/// Read a delta written by [`crate::binary_diff::write_delta`].
pub fn read_delta<R: Read>(input: &mut R) -> Result<Delta> {
    let decoder = zstd::Decoder::new(input).context("Failed to create zstd decoder")?;
    bincode::deserialize_from(decoder).context("Failed to deserialize delta")
}

/// Reconstruct the new file from the old file data and a delta.
///
/// Fails when a copy range points outside `old` or the result does not hash
/// to the value recorded when the delta was made, which means `old` is not
/// the file the delta was computed against.
pub fn apply_delta(old: &[u8], delta: &Delta) -> Result<Vec<u8>> {
    let expected = usize::try_from(delta.new_len)
        .map_err(|_| PatchError::CorruptPatch(format!("delta length {} too large", delta.new_len)))?;
    // The recorded length is untrusted; never reserve more than the chunks can produce.
    let inserted = delta
        .chunks
        .iter()
        .map(|chunk| match chunk {
            DiffChunk::Insert { data } => data.len(),
            DiffChunk::Copy { .. } => 0,
        })
        .fold(old.len(), usize::saturating_add);
    let mut result = Vec::with_capacity(expected.min(inserted));

    for chunk in &delta.chunks {
        match chunk {
            DiffChunk::Copy { offset, length } => {
                let range = usize::try_from(*offset)
                    .ok()
                    .zip(usize::try_from(*length).ok())
                    .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                    .filter(|range| range.end <= old.len())
                    .ok_or_else(|| {
                        PatchError::CorruptPatch(format!(
                            "copy of {} bytes at {} exceeds source of {} bytes",
                            length,
                            offset,
                            old.len()
                        ))
                    })?;
                result.extend_from_slice(&old[range]);
            }
            DiffChunk::Insert { data } => {
                result.extend_from_slice(data);
            }
        }
    }

    if result.len() as u64 != delta.new_len || util::hash_bytes(&result) != delta.new_hash {
        return Err(PatchError::CorruptPatch(
            "patched content does not match the expected hash".to_string(),
        )
        .into());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_for(new: &[u8], chunks: Vec<DiffChunk>) -> Delta {
        Delta {
            new_len: new.len() as u64,
            new_hash: util::hash_bytes(new),
            chunks,
        }
    }

    #[test]
    fn test_apply_copy_only() {
        let old = b"Hello, World!";
        let delta = delta_for(
            old,
            vec![DiffChunk::Copy {
                offset: 0,
                length: old.len() as u64,
            }],
        );
        assert_eq!(apply_delta(old, &delta).unwrap(), old);
    }

    #[test]
    fn test_apply_mixed() {
        let old = b"AAAA_BBBB_CCCC";
        let delta = delta_for(
            b"AAAA_XXXX_CCCC",
            vec![
                DiffChunk::Copy { offset: 0, length: 5 },
                DiffChunk::Insert {
                    data: b"XXXX_".to_vec(),
                },
                DiffChunk::Copy {
                    offset: 10,
                    length: 4,
                },
            ],
        );
        assert_eq!(apply_delta(old, &delta).unwrap(), b"AAAA_XXXX_CCCC");
    }

    #[test]
    fn test_out_of_range_copy_is_rejected() {
        let delta = delta_for(
            b"0123456789",
            vec![DiffChunk::Copy {
                offset: 4,
                length: 10,
            }],
        );
        let err = apply_delta(b"0123456789", &delta).unwrap_err();
        assert!(matches!(err.downcast_ref::<PatchError>(), Some(PatchError::CorruptPatch(_))));
    }

    #[test]
    fn test_wrong_source_is_detected() {
        let delta = delta_for(
            b"ABCD",
            vec![DiffChunk::Copy { offset: 0, length: 4 }],
        );
        assert!(apply_delta(b"ABCE", &delta).is_err());
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut delta = delta_for(
            b"tiny",
            vec![DiffChunk::Insert {
                data: b"tiny".to_vec(),
            }],
        );
        delta.new_len = u64::MAX;
        let err = apply_delta(b"", &delta).unwrap_err();
        assert!(matches!(err.downcast_ref::<PatchError>(), Some(PatchError::CorruptPatch(_))));
    }
}
