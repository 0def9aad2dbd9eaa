//! 2-bit DNA base compression and the sequence list file format.
//!
//! Mirrors `sand/src/compressed_sequence.c`: four bases pack into one byte,
//! `base_to_num` maps `C=0, A=1, T=2, G=3` with any other byte (including the
//! ambiguity code `N`) defaulting to `G`. This module packs base `i` into
//! bits `(i % 4) * 2` of byte `i / 4` (least-significant base first within a
//! byte) rather than the original's 16-bit-word-oriented order, so that
//! `uncompress(compress(s))` round-trips exactly as required.

use crate::error::CoreError;

fn base_to_num(base: u8) -> u8 {
    match base {
        b'C' | b'c' => 0,
        b'A' | b'a' => 1,
        b'T' | b't' => 2,
        b'G' | b'g' => 3,
        _ => 3,
    }
}

fn num_to_base(num: u8) -> u8 {
    match num & 3 {
        0 => b'C',
        1 => b'A',
        2 => b'T',
        _ => b'G',
    }
}

fn num_bytes(num_bases: usize) -> usize {
    num_bases.div_ceil(4)
}

/// Pack an ASCII base string into its 2-bit-per-base representation.
pub fn compress(bases: &str) -> Vec<u8> {
    let bases = bases.as_bytes();
    let mut out = vec![0u8; num_bytes(bases.len())];
    for (i, &b) in bases.iter().enumerate() {
        let byte = i / 4;
        let shift = (i % 4) * 2;
        out[byte] |= base_to_num(b) << shift;
    }
    out
}

/// Unpack `num_bases` bases from their 2-bit-per-base representation.
///
/// Non-ACGT input is lossy: every byte that mapped to the sentinel (`G`)
/// decompresses back to `G`, never to the original ambiguity code.
pub fn uncompress(packed: &[u8], num_bases: usize) -> String {
    let mut out = String::with_capacity(num_bases);
    for i in 0..num_bases {
        let byte = packed.get(i / 4).copied().unwrap_or(0);
        let shift = (i % 4) * 2;
        out.push(num_to_base((byte >> shift) & 3) as char);
    }
    out
}

/// An entry in a compressed sequence list: a name, its base count, free-form
/// metadata, and the packed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedSequence {
    /// Sequence identifier.
    pub name: String,
    /// Number of bases represented (the uncompressed length).
    pub num_bases: usize,
    /// Free-form metadata string carried alongside the sequence.
    pub metadata: String,
    /// Packed 2-bit-per-base bytes, length `ceil(num_bases / 4)`.
    pub data: Vec<u8>,
}

impl CompressedSequence {
    /// Compress a raw base string into a named, packed record.
    pub fn from_bases(name: &str, bases: &str, metadata: &str) -> Self {
        Self {
            name: name.to_string(),
            num_bases: bases.len(),
            metadata: metadata.to_string(),
            data: compress(bases),
        }
    }

    /// Recover the base string this record was compressed from.
    pub fn to_bases(&self) -> String {
        uncompress(&self.data, self.num_bases)
    }

    /// Serialize one record (or, for `None`, the end-of-list sentinel) in the
    /// `>name num_bases num_bytes metadata\n<packed bytes>\n` format used by
    /// sequence list files, with an optional extra field appended to the
    /// header line (as `cseq_sprint`'s `extra_data` parameter does).
    pub fn write(record: Option<&Self>, extra: Option<&str>, out: &mut Vec<u8>) {
        let Some(rec) = record else {
            out.extend_from_slice(b">>\n");
            return;
        };
        let header = match extra {
            Some(extra) => format!(
                ">{} {} {} {} {}\n",
                rec.name,
                rec.num_bases,
                rec.data.len(),
                rec.metadata,
                extra
            ),
            None => format!(
                ">{} {} {} {}\n",
                rec.name,
                rec.num_bases,
                rec.data.len(),
                rec.metadata
            ),
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&rec.data);
        out.push(b'\n');
    }

    /// Parse one record, or `Ok(None)` at the end-of-list sentinel `>>`.
    ///
    /// `reader` must be positioned at the start of a header line.
    pub fn read(reader: &mut impl std::io::BufRead) -> Result<Option<Self>, CoreError> {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 {
            return Ok(None);
        }
        let header = header.trim_end_matches('\n');
        if header.starts_with(">>") {
            return Ok(None);
        }
        let rest = header
            .strip_prefix('>')
            .ok_or_else(|| CoreError::MalformedSequence(header.to_string()))?;
        let mut parts = rest.splitn(4, ' ');
        let name = parts
            .next()
            .ok_or_else(|| CoreError::MalformedSequence(header.to_string()))?
            .to_string();
        let num_bases: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::MalformedSequence(header.to_string()))?;
        let declared_bytes: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::MalformedSequence(header.to_string()))?;
        let metadata = parts.next().unwrap_or("").to_string();

        let mut data = vec![0u8; declared_bytes];
        reader.read_exact(&mut data)?;
        let mut newline = [0u8; 1];
        let _ = reader.read(&mut newline)?;

        Ok(Some(Self {
            name,
            num_bases,
            metadata,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_acgt() {
        let packed = compress("ACGTACGT");
        assert_eq!(uncompress(&packed, 8), "ACGTACGT");
    }

    #[test]
    fn ambiguity_code_maps_to_sentinel() {
        let packed = compress("ACGTACGTN");
        assert_eq!(uncompress(&packed, 9), "ACGTACGTG");
    }

    #[test]
    fn lowercase_normalizes_to_uppercase_bases() {
        let packed = compress("acgt");
        assert_eq!(uncompress(&packed, 4), "ACGT");
    }

    #[test]
    fn write_then_read_round_trips() {
        let rec = CompressedSequence::from_bases("read_1", "ACGTACGTN", "len=9");
        let mut buf = Vec::new();
        CompressedSequence::write(Some(&rec), None, &mut buf);
        CompressedSequence::write(None, None, &mut buf);

        let mut cursor = std::io::Cursor::new(buf);
        let got = CompressedSequence::read(&mut cursor).unwrap().unwrap();
        assert_eq!(got.name, "read_1");
        assert_eq!(got.to_bases(), "ACGTACGTG");
        assert!(CompressedSequence::read(&mut cursor).unwrap().is_none());
    }
}
