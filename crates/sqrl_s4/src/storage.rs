//! Ordered block documents and the text armor used for identity export.

use crate::{Block, S4Error, S4Result};
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};

/// Signature prefixing a binary identity file.
pub const BINARY_MARKER: &[u8; 8] = b"sqrldata";

/// Signature prefixing a base64 (text armored) identity export.
pub const BASE64_MARKER: &[u8; 8] = b"SQRLDATA";

/// Export encoding for a storage document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Binary file signature followed by the raw block stream.
    Binary,

    /// Text marker followed by the url-safe base64 of the block stream.
    Base64,
}

/// An ordered sequence of storage blocks.
///
/// Blocks are self-describing; a document is simply their concatenation,
/// read until input exhaustion. Known block types conventionally appear
/// in ascending type order, unknown types are carried verbatim so a
/// load/save cycle preserves them.
#[derive(Debug, Default)]
pub struct Storage {
    blocks: Vec<Block>,
}

impl Storage {
    /// Create an empty document.
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Parse a document, auto-detecting text armor.
    ///
    /// Input starting with the base64 marker is decoded first (line breaks
    /// and other whitespace inside the armor are tolerated); the binary
    /// file signature is skipped when present; anything else is treated as
    /// a bare block stream.
    pub fn parse(input: &[u8]) -> S4Result<Self> {
        if input.starts_with(BASE64_MARKER) {
            let armor: Vec<u8> = input[BASE64_MARKER.len()..]
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            let raw = BASE64_URL_SAFE_NO_PAD.decode(armor).map_err(|e| {
                S4Error::MalformedBlock(format!("bad base64 armor: {e}"))
            })?;
            Self::from_block_stream(&raw)
        } else if input.starts_with(BINARY_MARKER) {
            Self::from_block_stream(&input[BINARY_MARKER.len()..])
        } else {
            Self::from_block_stream(input)
        }
    }

    /// Parse a bare block stream.
    pub fn from_block_stream(mut data: &[u8]) -> S4Result<Self> {
        let mut blocks = Vec::new();
        while !data.is_empty() {
            if data.len() < 4 {
                return Err(S4Error::MalformedBlock(format!(
                    "truncated header: {} trailing bytes",
                    data.len()
                )));
            }
            let len = LittleEndian::read_u16(&data[0..2]) as usize;
            if len < 4 || len > data.len() {
                return Err(S4Error::MalformedBlock(format!(
                    "block length {} exceeds remaining {}",
                    len,
                    data.len()
                )));
            }
            blocks.push(Block::from_bytes(&data[..len])?);
            data = &data[len..];
        }
        Ok(Self { blocks })
    }

    /// The bare block stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for block in &self.blocks {
            out.extend_from_slice(block.as_bytes());
        }
        out
    }

    /// Serialize with the requested export encoding.
    pub fn to_export(&self, encoding: Encoding) -> Vec<u8> {
        let raw = self.to_bytes();
        match encoding {
            Encoding::Binary => {
                let mut out = BINARY_MARKER.to_vec();
                out.extend_from_slice(&raw);
                out
            }
            Encoding::Base64 => {
                let mut out = BASE64_MARKER.to_vec();
                out.extend_from_slice(
                    BASE64_URL_SAFE_NO_PAD.encode(&raw).as_bytes(),
                );
                out
            }
        }
    }

    /// Append a block to the document.
    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// The blocks in document order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// First block of the given type, if present.
    pub fn find(&self, block_type: u16) -> Option<&Block> {
        self.blocks.iter().find(|b| b.block_type() == block_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> Storage {
        let mut doc = Storage::new();
        let mut b1 = Block::init(1, 60).unwrap();
        b1.write_u16(45).unwrap();
        b1.write(&[0xaa; 41]).unwrap();
        doc.push(b1);
        let mut b2 = Block::init(2, 12).unwrap();
        b2.write(&[0xbb; 8]).unwrap();
        doc.push(b2);
        doc
    }

    #[test]
    fn it_parses_a_single_block_header() {
        let mut raw = vec![0x3c, 0x00, 0x01, 0x00];
        raw.extend_from_slice(&[0_u8; 56]);
        let doc = Storage::parse(&raw).unwrap();
        assert_eq!(1, doc.blocks().len());
        let block = doc.find(1).unwrap();
        assert_eq!(1, block.block_type());
        assert_eq!(60, block.len());
        assert_eq!(4, block.cursor());
    }

    #[test]
    fn it_round_trips_documents() {
        let doc = sample_doc();
        let raw = doc.to_bytes();
        let reparsed = Storage::parse(&raw).unwrap();
        assert_eq!(raw, reparsed.to_bytes());
        assert_eq!(2, reparsed.blocks().len());
        assert_eq!(60, reparsed.find(1).unwrap().len());
        assert_eq!(12, reparsed.find(2).unwrap().len());
    }

    #[test]
    fn it_round_trips_text_armor() {
        let doc = sample_doc();
        let text = doc.to_export(Encoding::Base64);
        assert!(text.starts_with(BASE64_MARKER));
        let reparsed = Storage::parse(&text).unwrap();
        assert_eq!(doc.to_bytes(), reparsed.to_bytes());
    }

    #[test]
    fn it_accepts_line_wrapped_armor() {
        let doc = sample_doc();
        let text = doc.to_export(Encoding::Base64);
        let mut wrapped = text[..8].to_vec();
        for chunk in text[8..].chunks(24) {
            wrapped.extend_from_slice(chunk);
            wrapped.extend_from_slice(b"\r\n");
        }
        let reparsed = Storage::parse(&wrapped).unwrap();
        assert_eq!(doc.to_bytes(), reparsed.to_bytes());
    }

    #[test]
    fn it_skips_the_binary_signature() {
        let doc = sample_doc();
        let file = doc.to_export(Encoding::Binary);
        assert!(file.starts_with(BINARY_MARKER));
        let reparsed = Storage::parse(&file).unwrap();
        assert_eq!(doc.to_bytes(), reparsed.to_bytes());
    }

    #[test]
    fn it_rejects_an_overlong_block_length() {
        let raw = vec![0xff, 0x00, 0x01, 0x00, 0x00];
        assert!(matches!(
            Storage::parse(&raw),
            Err(S4Error::MalformedBlock(_))
        ));
    }

    #[test]
    fn it_rejects_trailing_garbage() {
        let mut raw = sample_doc().to_bytes();
        raw.extend_from_slice(&[1, 2]);
        assert!(matches!(
            Storage::parse(&raw),
            Err(S4Error::MalformedBlock(_))
        ));
    }
}
