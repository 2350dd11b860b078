//! The three digest tiers of the identity pipeline, cheapest first.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::RawFd;

use sha2::{Digest, Sha256};

use crate::platform::fiemap::{ExtentRecord, fiemap};

/// Bytes hashed by the sample tier.
pub const SAMPLE_LEN: usize = 4096;

/// Read buffer for full-file hashing and byte comparison.
pub const READ_BUF: usize = 8192;

/// Offset of the sample window: 30% into the file, so header-only
/// matches (archives, VM images) separate early.
pub fn sample_offset(size: u64) -> u64 {
    (size as f64 * 0.3) as u64
}

/// A very cheap, very partial digest for quick disambiguation.
///
/// Reads up to 4 KiB at the sample offset. Fully zeroed or sparse files
/// all collide; acceptable, since this tier only gates the next one.
pub fn sample_hash(file: &mut File, size: u64) -> io::Result<u32> {
    file.seek(SeekFrom::Start(sample_offset(size)))?;
    let mut buf = [0u8; SAMPLE_LEN];
    let mut filled = 0usize;
    while filled < SAMPLE_LEN {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(crc32c::crc32c(&buf[..filled]))
}

/// Stable 64-bit digest of a physical extent map.
///
/// Byte-identical files with different on-disk layouts hash differently
/// on purpose: when the layouts already match, a clone would be a no-op
/// and the pair can be skipped.
pub fn extent_map_hash(extents: &[ExtentRecord]) -> u64 {
    let mut hasher = Sha256::new();
    for e in extents {
        hasher.update(e.logical.to_le_bytes());
        hasher.update(e.physical.to_le_bytes());
        hasher.update(e.length.to_le_bytes());
        hasher.update(e.flags.to_le_bytes());
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Fetch and hash the extent map of an open file.
pub fn extent_hash_of(fd: RawFd) -> io::Result<u64> {
    Ok(extent_map_hash(&fiemap(fd)?))
}

/// Full-file SHA-256, the last word before the byte compare.
pub fn content_hash(file: &mut File) -> io::Result<[u8; 32]> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sample_offset_is_thirty_percent() {
        assert_eq!(sample_offset(0), 0);
        assert_eq!(sample_offset(100), 30);
        assert_eq!(sample_offset(8 * 1024 * 1024), 2_516_582);
    }

    #[test]
    fn sample_hash_reads_window_at_offset() {
        let mut f = tempfile::tempfile().unwrap();
        let mut data = vec![0u8; 100_000];
        data[30_000] = 0xAB; // inside the window for size 100_000
        f.write_all(&data).unwrap();
        let h1 = sample_hash(&mut f, 100_000).unwrap();

        let mut g = tempfile::tempfile().unwrap();
        g.write_all(&vec![0u8; 100_000]).unwrap();
        let h2 = sample_hash(&mut g, 100_000).unwrap();

        assert_ne!(h1, h2, "byte inside the sample window must change the hash");
    }

    #[test]
    fn sample_hash_ignores_bytes_outside_window() {
        let mut f = tempfile::tempfile().unwrap();
        let mut data = vec![0u8; 100_000];
        data[0] = 0xCD; // before the window
        data[99_999] = 0xEF; // after the window
        f.write_all(&data).unwrap();
        let h1 = sample_hash(&mut f, 100_000).unwrap();

        let mut g = tempfile::tempfile().unwrap();
        g.write_all(&vec![0u8; 100_000]).unwrap();
        let h2 = sample_hash(&mut g, 100_000).unwrap();

        assert_eq!(h1, h2);
    }

    #[test]
    fn extent_hash_is_stable_and_layout_sensitive() {
        let a = [
            ExtentRecord { logical: 0, physical: 4096, length: 8192, flags: 0 },
            ExtentRecord { logical: 8192, physical: 65536, length: 4096, flags: 1 },
        ];
        let b = a;
        assert_eq!(extent_map_hash(&a), extent_map_hash(&b));

        let mut c = a;
        c[1].physical = 131072;
        assert_ne!(extent_map_hash(&a), extent_map_hash(&c));
    }

    #[test]
    fn extent_hash_distinguishes_split_points() {
        // One 8 KiB extent vs. two adjacent 4 KiB extents: same bytes on
        // disk, different maps.
        let one = [ExtentRecord { logical: 0, physical: 4096, length: 8192, flags: 0 }];
        let two = [
            ExtentRecord { logical: 0, physical: 4096, length: 4096, flags: 0 },
            ExtentRecord { logical: 4096, physical: 8192, length: 4096, flags: 0 },
        ];
        assert_ne!(extent_map_hash(&one), extent_map_hash(&two));
    }

    #[test]
    fn content_hash_matches_direct_sha256() {
        let mut f = tempfile::tempfile().unwrap();
        let data = b"identical bytes make identical digests".repeat(1000);
        f.write_all(&data).unwrap();
        let h = content_hash(&mut f).unwrap();
        let expected: [u8; 32] = Sha256::digest(&data).into();
        assert_eq!(h, expected);
    }
}
