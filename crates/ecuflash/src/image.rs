//! Motorola S-record firmware image decoding
//!
//! Pure decoder: ASCII text in, a sparse `address -> byte` map plus the
//! list of maximal contiguous blocks out. Only S1/S2/S3 records carry data;
//! every other record type is skipped.

use std::collections::{btree_map, BTreeMap};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One maximal run of contiguous addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: u32,
    pub len: u32,
}

/// Decoded firmware image.
#[derive(Debug, Clone, Default)]
pub struct FirmwareImage {
    map: BTreeMap<u32, u8>,
    blocks: Vec<Block>,
}

impl FirmwareImage {
    /// Decode S1/S2/S3 records from ASCII text.
    ///
    /// A record's trailing checksum byte is parsed past but not verified.
    /// TODO: validate the per-line checksum byte.
    pub fn parse(text: &str) -> Result<Self, ImageError> {
        let mut map = BTreeMap::new();
        for (index, raw_line) in text.lines().enumerate() {
            let lineno = index + 1;
            let line = raw_line.trim();
            if !line.starts_with('S') {
                continue;
            }
            let addr_len = match line.as_bytes().get(1) {
                Some(b'1') => 2usize,
                Some(b'2') => 3,
                Some(b'3') => 4,
                _ => continue,
            };
            let payload = hex::decode(&line[2..]).map_err(|e| ImageError::Malformed {
                line: lineno,
                reason: format!("invalid hex: {e}"),
            })?;
            // layout: [count][address...][data...][checksum]
            if payload.len() < 1 + addr_len + 1 {
                return Err(ImageError::Malformed {
                    line: lineno,
                    reason: format!("record too short ({} bytes)", payload.len()),
                });
            }
            let mut address: u32 = 0;
            for &byte in &payload[1..1 + addr_len] {
                address = (address << 8) | byte as u32;
            }
            let data = &payload[1 + addr_len..payload.len() - 1];
            for (offset, &byte) in data.iter().enumerate() {
                map.insert(address + offset as u32, byte);
            }
        }
        let blocks = contiguous_blocks(&map);
        Ok(Self { map, blocks })
    }

    pub fn from_file(path: &Path) -> Result<Self, ImageError> {
        let text = std::fs::read_to_string(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Total number of decoded bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Contiguous blocks in ascending address order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn byte_at(&self, address: u32) -> Option<u8> {
        self.map.get(&address).copied()
    }

    fn range(&self, block: Block) -> btree_map::Range<'_, u32, u8> {
        let end = block.start + (block.len - 1);
        self.map.range(block.start..=end)
    }

    /// Bytes of one block in ascending address order.
    pub fn block_bytes(&self, block: Block) -> Vec<u8> {
        self.range(block).map(|(_, &byte)| byte).collect()
    }

    /// Successive `chunk_size`-byte windows over one block; the trailing
    /// partial chunk is yielded as-is.
    pub fn chunks(&self, block: Block, chunk_size: usize) -> BlockChunks<'_> {
        BlockChunks {
            bytes: self.range(block),
            chunk_size,
        }
    }
}

fn contiguous_blocks(map: &BTreeMap<u32, u8>) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut addresses = map.keys().copied();
    let Some(first) = addresses.next() else {
        return blocks;
    };
    let (mut start, mut prev) = (first, first);
    for address in addresses {
        if address != prev + 1 {
            blocks.push(Block { start, len: prev - start + 1 });
            start = address;
        }
        prev = address;
    }
    blocks.push(Block { start, len: prev - start + 1 });
    blocks
}

/// Streaming chunk iterator over one block's bytes.
pub struct BlockChunks<'a> {
    bytes: btree_map::Range<'a, u32, u8>,
    chunk_size: usize,
}

impl Iterator for BlockChunks<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let chunk: Vec<u8> = self
            .bytes
            .by_ref()
            .take(self.chunk_size)
            .map(|(_, &byte)| byte)
            .collect();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one S-record line with a correct count and checksum.
    fn record(rectype: char, addr_len: usize, address: u32, data: &[u8]) -> String {
        let addr_bytes = &address.to_be_bytes()[4 - addr_len..];
        let count = (addr_len + data.len() + 1) as u8;
        let mut sum = count as u32;
        let mut line = format!("S{rectype}{count:02X}");
        for &byte in addr_bytes.iter().chain(data) {
            sum += byte as u32;
            line.push_str(&format!("{byte:02X}"));
        }
        line.push_str(&format!("{:02X}", 0xFF - (sum & 0xFF) as u8));
        line
    }

    #[test]
    fn decodes_a_single_s1_block() {
        let data = b"Foo Bar Got gri";
        let text = format!("{}\nS9030000FC\n", record('1', 2, 0x0000, data));
        let image = FirmwareImage::parse(&text).unwrap();
        assert_eq!(image.blocks(), &[Block { start: 0, len: data.len() as u32 }]);
        assert_eq!(image.block_bytes(image.blocks()[0]), data);
    }

    #[test]
    fn ignores_non_data_records() {
        let text = "S00600004844521B\nS5030001FB\nS9030000FC\n";
        let image = FirmwareImage::parse(text).unwrap();
        assert!(image.is_empty());
        assert!(image.blocks().is_empty());
    }

    #[test]
    fn splits_discontiguous_addresses_into_blocks() {
        let text = format!(
            "{}\n{}\n{}\n",
            record('3', 4, 0xFF1E_0000, &[1, 2, 3, 4]),
            record('3', 4, 0xFF1E_0004, &[5, 6]),
            record('3', 4, 0xFF20_0000, &[7, 8, 9]),
        );
        let image = FirmwareImage::parse(&text).unwrap();
        assert_eq!(
            image.blocks(),
            &[
                Block { start: 0xFF1E_0000, len: 6 },
                Block { start: 0xFF20_0000, len: 3 },
            ]
        );
        assert_eq!(image.block_bytes(image.blocks()[0]), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(image.byte_at(0xFF20_0002), Some(9));
    }

    #[test]
    fn s2_records_use_three_byte_addresses() {
        let text = record('2', 3, 0x012345, &[0xAB]);
        let image = FirmwareImage::parse(&text).unwrap();
        assert_eq!(image.byte_at(0x012345), Some(0xAB));
    }

    #[test]
    fn union_of_blocks_covers_every_decoded_byte() {
        let text = format!(
            "{}\n{}\n",
            record('1', 2, 0x0100, &[1, 2, 3]),
            record('1', 2, 0x0200, &[4, 5]),
        );
        let image = FirmwareImage::parse(&text).unwrap();
        let covered: usize = image.blocks().iter().map(|b| b.len as usize).sum();
        assert_eq!(covered, image.len());
    }

    #[test]
    fn bad_hex_fails_the_whole_decode_with_line_number() {
        let text = format!("{}\nS105000012GG\n", record('1', 2, 0, &[0x11]));
        let err = FirmwareImage::parse(&text).unwrap_err();
        match err {
            ImageError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_record_is_malformed() {
        let err = FirmwareImage::parse("S10200FF\n").unwrap_err();
        assert!(matches!(err, ImageError::Malformed { line: 1, .. }));
    }

    #[test]
    fn empty_input_yields_empty_image() {
        let image = FirmwareImage::parse("").unwrap();
        assert!(image.blocks().is_empty());
    }

    #[test]
    fn crlf_line_endings_are_tolerated() {
        let text = format!("{}\r\nS9030000FC\r\n", record('1', 2, 0x10, &[0xAA, 0xBB]));
        let image = FirmwareImage::parse(&text).unwrap();
        assert_eq!(image.byte_at(0x11), Some(0xBB));
    }

    #[test]
    fn chunk_iterator_emits_partial_tail() {
        let data: Vec<u8> = (0..10).collect();
        let text = record('1', 2, 0, &data);
        let image = FirmwareImage::parse(&text).unwrap();
        let block = image.blocks()[0];
        let chunks: Vec<Vec<u8>> = image.chunks(block, 4).collect();
        assert_eq!(chunks, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[test]
    fn chunk_iterator_respects_block_bounds() {
        let text = format!(
            "{}\n{}\n",
            record('1', 2, 0x0000, &[1, 2, 3]),
            record('1', 2, 0x0010, &[9, 9, 9]),
        );
        let image = FirmwareImage::parse(&text).unwrap();
        let first = image.blocks()[0];
        let flat: Vec<u8> = image.chunks(first, 2).flatten().collect();
        assert_eq!(flat, vec![1, 2, 3]);
    }
}
