use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::patch_format::ZSTD_LEVEL;
use crate::rolling_hash::RollingChecksum;
use crate::util;

pub const BLOCK_SIZE: usize = 4096;

/// One step of rebuilding the new file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffChunk {
    /// Copy `length` bytes starting at `offset` of the old file.
    Copy { offset: u64, length: u64 },
    /// Literal bytes.
    Insert { data: Vec<u8> },
}

/// Reversible binary delta from one file version to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub new_len: u64,
    /// BLAKE3 hash of the expected result, checked after reconstruction.
    pub new_hash: [u8; 32],
    pub chunks: Vec<DiffChunk>,
}

/// Returns true for file types that are already compressed or otherwise incompressible,
/// where computing a binary diff would yield no meaningful savings.
pub fn is_incompressible(path: &str) -> bool {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "ico" | "tiff" | "tif" | "avif"
            // Video
            | "mp4" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v"
            // Audio
            | "mp3" | "aac" | "ogg" | "flac" | "opus" | "m4a" | "wma"
            // Archives
            | "gz" | "bz2" | "xz" | "zst" | "7z" | "rar"
            // Fonts
            | "woff" | "woff2"
        )
    )
}

/// Build a delta that stores `new` verbatim.
pub fn literal_delta(new: &[u8]) -> Delta {
    let chunks = if new.is_empty() {
        vec![]
    } else {
        vec![DiffChunk::Insert { data: new.to_vec() }]
    };
    Delta {
        new_len: new.len() as u64,
        new_hash: util::hash_bytes(new),
        chunks,
    }
}

/// Compute a binary delta between `old` and `new` data.
///
/// Uses a block-matching algorithm (rsync-like):
/// 1. Split old data into fixed-size blocks
/// 2. Build a hash table from rolling checksum -> block signatures
/// 3. Scan new data with a rolling checksum, matching against old blocks
/// 4. Emit Copy chunks for matches, Insert chunks for non-matching regions
pub fn compute_delta(old: &[u8], new: &[u8]) -> Delta {
    if old.is_empty() || new.len() < BLOCK_SIZE {
        return literal_delta(new);
    }

    let signatures = build_signatures(old);
    let table = build_table(&signatures);

    Delta {
        new_len: new.len() as u64,
        new_hash: util::hash_bytes(new),
        chunks: match_blocks(old, new, &table, &signatures),
    }
}

struct BlockSignature {
    weak: u32,
    strong: blake3::Hash,
    offset: u64,
}

fn build_signatures(data: &[u8]) -> Vec<BlockSignature> {
    data.chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, block)| BlockSignature {
            weak: RollingChecksum::over(block).value(),
            strong: blake3::hash(block),
            offset: (i * BLOCK_SIZE) as u64,
        })
        .collect()
}

fn build_table(signatures: &[BlockSignature]) -> HashMap<u32, Vec<usize>> {
    let mut table: HashMap<u32, Vec<usize>> = HashMap::with_capacity(signatures.len());
    for (idx, sig) in signatures.iter().enumerate() {
        table.entry(sig.weak).or_default().push(idx);
    }
    table
}

/// Appends a copy, extending the previous one when the old ranges are adjacent.
fn push_copy(chunks: &mut Vec<DiffChunk>, offset: u64, length: u64) {
    if let Some(DiffChunk::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = chunks.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    chunks.push(DiffChunk::Copy { offset, length });
}

fn match_blocks(
    old: &[u8],
    new: &[u8],
    table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Vec<DiffChunk> {
    let mut chunks: Vec<DiffChunk> = Vec::new();
    let mut literal_start: usize = 0;
    let mut pos: usize = 0;
    let mut rolling = RollingChecksum::over(&new[..BLOCK_SIZE]);

    while pos + BLOCK_SIZE <= new.len() {
        let window = &new[pos..pos + BLOCK_SIZE];

        if let Some((offset, length)) = find_match(rolling.value(), window, old, table, signatures) {
            if literal_start < pos {
                chunks.push(DiffChunk::Insert {
                    data: new[literal_start..pos].to_vec(),
                });
            }
            push_copy(&mut chunks, offset, length);

            pos += length as usize;
            literal_start = pos;
            if pos + BLOCK_SIZE <= new.len() {
                rolling = RollingChecksum::over(&new[pos..pos + BLOCK_SIZE]);
            }
        } else {
            pos += 1;
            if pos + BLOCK_SIZE <= new.len() {
                rolling.roll(new[pos - 1], new[pos + BLOCK_SIZE - 1]);
            }
        }
    }

    // Tail that does not fill a whole window.
    if literal_start < new.len() {
        chunks.push(DiffChunk::Insert {
            data: new[literal_start..].to_vec(),
        });
    }

    chunks
}

/// Try to find a matching old block for the current new window.
/// Returns (old_offset, length) on match.
fn find_match(
    weak: u32,
    window: &[u8],
    old: &[u8],
    table: &HashMap<u32, Vec<usize>>,
    signatures: &[BlockSignature],
) -> Option<(u64, u64)> {
    let candidates = table.get(&weak)?;
    let strong = blake3::hash(window);

    candidates
        .iter()
        .map(|&idx| &signatures[idx])
        .find(|sig| {
            // The last old block may be short; it only matches a window of equal length.
            let end = (sig.offset as usize + BLOCK_SIZE).min(old.len());
            end - sig.offset as usize == window.len() && sig.strong == strong
        })
        .map(|sig| (sig.offset, BLOCK_SIZE as u64))
}

/// Write a delta as a zstd-compressed bincode stream.
pub fn write_delta<W: Write>(delta: &Delta, out: &mut W) -> Result<()> {
    let mut encoder = zstd::Encoder::new(out, ZSTD_LEVEL).context("Failed to create zstd encoder")?;
    bincode::serialize_into(&mut encoder, delta).context("Failed to serialize delta")?;
    encoder.finish().context("Failed to finish delta stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_patch::{apply_delta, read_delta};

    fn round_trip(old: &[u8], new: &[u8]) -> Delta {
        let delta = compute_delta(old, new);
        assert_eq!(apply_delta(old, &delta).unwrap(), new);
        delta
    }

    #[test]
    fn test_identical_data() {
        let data: Vec<u8> = (0..BLOCK_SIZE * 3).map(|i| (i % 253) as u8).collect();
        let delta = round_trip(&data, &data);
        assert_eq!(
            delta.chunks,
            vec![DiffChunk::Copy {
                offset: 0,
                length: data.len() as u64
            }]
        );
    }

    #[test]
    fn test_completely_different() {
        round_trip(&vec![0u8; BLOCK_SIZE * 2], &vec![1u8; BLOCK_SIZE * 2]);
    }

    #[test]
    fn test_prefix_changed() {
        let old: Vec<u8> = (0..BLOCK_SIZE * 4).map(|i| (i % 256) as u8).collect();
        let mut new = old.clone();
        for b in new[..BLOCK_SIZE].iter_mut() {
            *b = 0xFF;
        }

        let delta = round_trip(&old, &new);

        let copied: u64 = delta
            .chunks
            .iter()
            .map(|c| match c {
                DiffChunk::Copy { length, .. } => *length,
                DiffChunk::Insert { .. } => 0,
            })
            .sum();
        assert!(copied >= (BLOCK_SIZE * 3) as u64, "unchanged blocks should be copied");
    }

    #[test]
    fn test_empty_sides() {
        round_trip(&[], &[1u8; 100]);
        round_trip(&[1u8; 100], &[]);
        round_trip(&[], &[]);
    }

    #[test]
    fn test_small_files() {
        round_trip(b"Hello, World!", b"Hello, Rust!");
    }

    #[test]
    fn test_insertion_in_middle() {
        let old: Vec<u8> = (0..BLOCK_SIZE * 4).map(|i| (i % 256) as u8).collect();
        let mut new = old.clone();
        let insert_pos = BLOCK_SIZE * 2;
        new.splice(insert_pos..insert_pos, vec![0xAA; 100]);

        round_trip(&old, &new);
    }

    #[test]
    fn test_short_last_block_and_unaligned_tail() {
        let old: Vec<u8> = (0..BLOCK_SIZE * 2 + 123).map(|i| (i * 31 % 256) as u8).collect();
        let mut new = vec![7u8; 17];
        new.extend_from_slice(&old);
        new.extend_from_slice(b"tail");

        round_trip(&old, &new);
    }

    #[test]
    fn test_serialized_delta_survives_stream() {
        let old: Vec<u8> = (0..BLOCK_SIZE * 3).map(|i| (i % 199) as u8).collect();
        let mut new = old.clone();
        new[BLOCK_SIZE + 5] ^= 0x55;

        let delta = compute_delta(&old, &new);
        let mut buf = Vec::new();
        write_delta(&delta, &mut buf).unwrap();
        let restored = read_delta(&mut buf.as_slice()).unwrap();

        assert_eq!(restored, delta);
        assert_eq!(apply_delta(&old, &restored).unwrap(), new);
    }

    #[test]
    fn test_incompressible_extensions() {
        assert!(is_incompressible("media/logo.PNG"));
        assert!(is_incompressible("lib/native.tar.gz"));
        assert!(!is_incompressible("lib/idea.jar"));
        assert!(!is_incompressible("bin/idea.sh"));
    }
}
