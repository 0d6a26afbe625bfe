use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::{Digest as Md5Digest, Md5};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::segment::SegmentSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

pub fn verify_checksum(path: &Path, req: &ChecksumRequest) -> bool {
    match req.checksum_type {
        ChecksumType::Md5 => hash_file::<Md5>(path),
        ChecksumType::Sha1 => hash_file::<Sha1>(path),
        ChecksumType::Sha256 => hash_file::<Sha256>(path),
    }
    .map(|actual| actual.eq_ignore_ascii_case(&req.expected_hex))
    .unwrap_or(false)
}

fn hash_file<D: Digest>(path: &Path) -> Option<String>
where
    D: Default,
{
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::default();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => return None,
        };
        hasher.update(&buf[..read]);
    }
    Some(hasher.hex())
}

/// The three digest crates share the RustCrypto `Digest` trait but under
/// different re-exports; this small shim keeps `hash_file` generic.
trait Digest {
    fn update(&mut self, data: &[u8]);
    fn hex(self) -> String;
}

impl Digest for Md5 {
    fn update(&mut self, data: &[u8]) {
        Md5Digest::update(self, data);
    }
    fn hex(self) -> String {
        format!("{:x}", Md5Digest::finalize(self))
    }
}

impl Digest for Sha1 {
    fn update(&mut self, data: &[u8]) {
        Sha1Digest::update(self, data);
    }
    fn hex(self) -> String {
        format!("{:x}", Sha1Digest::finalize(self))
    }
}

impl Digest for Sha256 {
    fn update(&mut self, data: &[u8]) {
        Sha2Digest::update(self, data);
    }
    fn hex(self) -> String {
        format!("{:x}", Sha2Digest::finalize(self))
    }
}

/// CRC32 of the concatenation of two byte streams whose individual CRCs
/// are known (zlib's crc32_combine, GF(2) matrix form).
pub fn crc32_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u32; 32];
    let mut odd = [0u32; 32];

    // operator for one zero bit
    odd[0] = 0xedb8_8320;
    let mut row = 1u32;
    for cell in odd.iter_mut().skip(1) {
        *cell = row;
        row <<= 1;
    }

    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc = crc1;
    let mut len = len2;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&even, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }
        gf2_matrix_square(&mut odd, &even);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&odd, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }
    }

    crc ^ crc2
}

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0;
    let mut index = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[index];
        }
        vec >>= 1;
        index += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// Fold per-segment CRCs in offset order into the CRC of the whole file.
/// Segments must tile the range contiguously; returns `None` when a
/// snapshot has no settled length.
pub fn fold_segment_crcs(snapshots: &[SegmentSnapshot]) -> Option<u32> {
    let mut ordered: Vec<&SegmentSnapshot> = snapshots.iter().collect();
    ordered.sort_by_key(|snap| snap.start);

    let mut crc = 0u32;
    for snap in ordered {
        let len = snap.end - snap.start + 1;
        if len < 0 {
            continue;
        }
        if snap.current != snap.end + 1 {
            return None;
        }
        crc = crc32_combine(crc, snap.checksum, len as u64);
    }
    Some(crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn combine_matches_one_shot_crc() {
        let a = b"the quick brown fox ".as_slice();
        let b = b"jumps over the lazy dog".as_slice();
        let combined = crc32_combine(crc32fast::hash(a), crc32fast::hash(b), b.len() as u64);
        let whole: Vec<u8> = [a, b].concat();
        assert_eq!(combined, crc32fast::hash(&whole));
    }

    #[test]
    fn combine_with_empty_tail_is_identity() {
        let crc = crc32fast::hash(b"data");
        assert_eq!(crc32_combine(crc, 0, 0), crc);
    }

    #[test]
    fn folded_segment_crcs_equal_whole_file_crc() {
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 255) as u8).collect();
        let bounds = [(0usize, 300_000usize), (300_000, 650_000), (650_000, 1_000_000)];

        let mut snapshots = Vec::new();
        for (id, (start, end)) in bounds.iter().enumerate() {
            let segment = Segment::new(id as u32, *start as i64, *end as i64 - 1);
            segment.advance(&data[*start..*end]);
            snapshots.push(segment.snapshot());
        }

        // offset order must hold even when snapshots arrive shuffled
        snapshots.reverse();
        assert_eq!(fold_segment_crcs(&snapshots), Some(crc32fast::hash(&data)));
    }

    #[test]
    fn fold_rejects_unfinished_segments() {
        let segment = Segment::new(0, 0, 99);
        segment.advance(&[0u8; 50]);
        assert_eq!(fold_segment_crcs(&[segment.snapshot()]), None);
    }

    #[test]
    fn expected_hash_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"hello world").unwrap();
        drop(file);

        let ok = ChecksumRequest {
            checksum_type: ChecksumType::Sha256,
            expected_hex: "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
                .to_string(),
        };
        assert!(verify_checksum(&path, &ok));

        let bad = ChecksumRequest {
            checksum_type: ChecksumType::Sha256,
            expected_hex: "deadbeef".to_string(),
        };
        assert!(!verify_checksum(&path, &bad));

        let md5 = ChecksumRequest {
            checksum_type: ChecksumType::Md5,
            expected_hex: "5eb63bbbe01eeed093cb22bb8f5acdc3".to_string(),
        };
        assert!(verify_checksum(&path, &md5));
    }

    #[test]
    fn checksum_type_round_trips() {
        for t in [ChecksumType::Md5, ChecksumType::Sha1, ChecksumType::Sha256] {
            assert_eq!(ChecksumType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(ChecksumType::from_str("crc64"), None);
    }
}
