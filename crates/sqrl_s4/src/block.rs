//! Typed, length-prefixed storage block with a random-access cursor.

use crate::{S4Error, S4Result};
use byteorder::{ByteOrder, LittleEndian};
use zeroize::Zeroize;

/// Size of the `(length, type)` block header in bytes.
pub const HEADER_LEN: u16 = 4;

/// A single storage block.
///
/// A block owns its full wire image (header included) and a cursor used for
/// both parsing and serialization. All multi-byte integers are little-endian.
/// The length header counts the *total* block size, header included.
#[derive(Clone)]
pub struct Block {
    data: Vec<u8>,
    block_type: u16,
    cur: u16,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("type", &self.block_type)
            .field("len", &self.data.len())
            .field("cur", &self.cur)
            .finish()
    }
}

impl Block {
    /// Allocate a zeroed block of `block_len` total bytes, write the header,
    /// and position the cursor just past it.
    pub fn init(block_type: u16, block_len: u16) -> S4Result<Self> {
        if block_len < HEADER_LEN {
            return Err(S4Error::OutOfRange);
        }
        let mut data = vec![0_u8; block_len as usize];
        LittleEndian::write_u16(&mut data[0..2], block_len);
        LittleEndian::write_u16(&mut data[2..4], block_type);
        Ok(Self {
            data,
            block_type,
            cur: HEADER_LEN,
        })
    }

    /// Reconstruct a block from its full wire image.
    ///
    /// The length header must match the input length exactly. The cursor is
    /// left just past the header.
    pub fn from_bytes(bytes: &[u8]) -> S4Result<Self> {
        if bytes.len() < HEADER_LEN as usize || bytes.len() > u16::MAX as usize
        {
            return Err(S4Error::MalformedBlock(format!(
                "invalid block size: {} bytes",
                bytes.len()
            )));
        }
        let len = LittleEndian::read_u16(&bytes[0..2]);
        if len as usize != bytes.len() {
            return Err(S4Error::MalformedBlock(format!(
                "length field {} != {} input bytes",
                len,
                bytes.len()
            )));
        }
        let block_type = LittleEndian::read_u16(&bytes[2..4]);
        Ok(Self {
            data: bytes.to_vec(),
            block_type,
            cur: HEADER_LEN,
        })
    }

    /// The block type.
    pub fn block_type(&self) -> u16 {
        self.block_type
    }

    /// Total block length in bytes, header included.
    pub fn len(&self) -> u16 {
        self.data.len() as u16
    }

    /// True for a cleared (zero-length) block.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current cursor position.
    pub fn cursor(&self) -> u16 {
        self.cur
    }

    /// Bytes remaining between the cursor and the end of the block.
    pub fn remaining(&self) -> u16 {
        self.data.len() as u16 - self.cur
    }

    /// Scrub the buffer and reset to an empty block.
    pub fn clear(&mut self) {
        self.data.zeroize();
        self.data.clear();
        self.block_type = 0;
        self.cur = 0;
    }

    /// Grow or shrink the block to `new_len` total bytes.
    ///
    /// Newly exposed bytes are zeroed, removed bytes are scrubbed before
    /// release, the length header is rewritten and the cursor is clamped.
    pub fn resize(&mut self, new_len: u16) -> S4Result<()> {
        if new_len < HEADER_LEN {
            return Err(S4Error::OutOfRange);
        }
        let new = new_len as usize;
        if new < self.data.len() {
            self.data[new..].zeroize();
            self.data.truncate(new);
        } else {
            self.data.resize(new, 0);
        }
        LittleEndian::write_u16(&mut self.data[0..2], new_len);
        if self.cur > new_len {
            self.cur = new_len;
        }
        Ok(())
    }

    /// Move the cursor to an absolute position.
    ///
    /// Positioning the cursor exactly at the end of the block is allowed;
    /// any further read or write there fails with `ShortBuffer`.
    pub fn seek(&mut self, dest: u16) -> S4Result<u16> {
        if dest as usize > self.data.len() {
            return Err(S4Error::OutOfRange);
        }
        self.cur = dest;
        Ok(self.cur)
    }

    /// Move the cursor by a signed offset.
    pub fn seek_by(&mut self, delta: i32) -> S4Result<u16> {
        let dest = i64::from(self.cur) + i64::from(delta);
        if dest < 0 || dest as usize > self.data.len() {
            return Err(S4Error::OutOfRange);
        }
        self.cur = dest as u16;
        Ok(self.cur)
    }

    /// Move the cursor to `dest` bytes before the end of the block.
    pub fn seek_back(&mut self, dest: u16) -> S4Result<u16> {
        let len = self.data.len() as u16;
        if dest > len {
            return Err(S4Error::OutOfRange);
        }
        self.cur = len - dest;
        Ok(self.cur)
    }

    /// Copy `out.len()` bytes from the cursor, advancing it.
    pub fn read(&mut self, out: &mut [u8]) -> S4Result<()> {
        let start = self.cur as usize;
        let end = start + out.len();
        if end > self.data.len() {
            return Err(S4Error::ShortBuffer);
        }
        out.copy_from_slice(&self.data[start..end]);
        self.cur = end as u16;
        Ok(())
    }

    /// Copy `src` into the block at the cursor, advancing it.
    pub fn write(&mut self, src: &[u8]) -> S4Result<()> {
        let start = self.cur as usize;
        let end = start + src.len();
        if end > self.data.len() {
            return Err(S4Error::ShortBuffer);
        }
        self.data[start..end].copy_from_slice(src);
        self.cur = end as u16;
        Ok(())
    }

    /// Read a u8 at the cursor.
    pub fn read_u8(&mut self) -> S4Result<u8> {
        let mut b = [0_u8; 1];
        self.read(&mut b)?;
        Ok(b[0])
    }

    /// Read a little-endian u16 at the cursor.
    pub fn read_u16(&mut self) -> S4Result<u16> {
        let mut b = [0_u8; 2];
        self.read(&mut b)?;
        Ok(LittleEndian::read_u16(&b))
    }

    /// Read a little-endian u32 at the cursor.
    pub fn read_u32(&mut self) -> S4Result<u32> {
        let mut b = [0_u8; 4];
        self.read(&mut b)?;
        Ok(LittleEndian::read_u32(&b))
    }

    /// Write a u8 at the cursor.
    pub fn write_u8(&mut self, val: u8) -> S4Result<()> {
        self.write(&[val])
    }

    /// Write a little-endian u16 at the cursor.
    pub fn write_u16(&mut self, val: u16) -> S4Result<()> {
        let mut b = [0_u8; 2];
        LittleEndian::write_u16(&mut b, val);
        self.write(&b)
    }

    /// Write a little-endian u32 at the cursor.
    pub fn write_u32(&mut self, val: u32) -> S4Result<()> {
        let mut b = [0_u8; 4];
        LittleEndian::write_u32(&mut b, val);
        self.write(&b)
    }

    /// The full wire image of the block, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The bytes from the cursor to the end of the block.
    pub fn bytes_from_cursor(&self) -> &[u8] {
        &self.data[self.cur as usize..]
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_round_trips_cursor_io() {
        let mut block = Block::init(1, 32).unwrap();
        assert_eq!(4, block.cursor());
        block.write_u16(45).unwrap();
        block.write_u32(0xdead_beef).unwrap();
        block.write_u8(9).unwrap();
        block.write(&[0x42; 8]).unwrap();

        block.seek(HEADER_LEN).unwrap();
        assert_eq!(45, block.read_u16().unwrap());
        assert_eq!(0xdead_beef, block.read_u32().unwrap());
        assert_eq!(9, block.read_u8().unwrap());
        let mut buf = [0_u8; 8];
        block.read(&mut buf).unwrap();
        assert_eq!([0x42; 8], buf);
    }

    #[test]
    fn it_writes_the_header_little_endian() {
        let block = Block::init(1, 125).unwrap();
        assert_eq!(&[125, 0, 1, 0], &block.as_bytes()[0..4]);
        assert_eq!(1, block.block_type());
        assert_eq!(125, block.len());
    }

    #[test]
    fn it_fails_short_reads_at_end() {
        let mut block = Block::init(2, 8).unwrap();
        block.seek_back(0).unwrap();
        assert_eq!(8, block.cursor());
        assert!(matches!(block.read_u8(), Err(S4Error::ShortBuffer)));
        assert!(matches!(block.write_u8(0), Err(S4Error::ShortBuffer)));
    }

    #[test]
    fn it_rejects_out_of_range_seeks() {
        let mut block = Block::init(2, 8).unwrap();
        assert!(matches!(block.seek(9), Err(S4Error::OutOfRange)));
        assert!(matches!(block.seek_by(-5), Err(S4Error::OutOfRange)));
        assert!(matches!(block.seek_back(9), Err(S4Error::OutOfRange)));
        assert_eq!(8, block.seek(8).unwrap());
    }

    #[test]
    fn it_clamps_the_cursor_on_shrink() {
        let mut block = Block::init(3, 64).unwrap();
        block.seek(60).unwrap();
        block.resize(16).unwrap();
        assert_eq!(16, block.cursor());
        assert_eq!(16, block.len());
        assert_eq!(&[16, 0, 3, 0], &block.as_bytes()[0..4]);
    }

    #[test]
    fn it_zeroes_bytes_exposed_by_growth() {
        let mut block = Block::init(3, 8).unwrap();
        block.write(&[0xff; 4]).unwrap();
        block.resize(16).unwrap();
        assert_eq!(&[0_u8; 8], &block.as_bytes()[8..16]);
        assert_eq!(8, block.cursor());
    }

    #[test]
    fn it_rejects_a_mismatched_length_field() {
        let mut raw = Block::init(1, 12).unwrap().as_bytes().to_vec();
        raw.push(0);
        assert!(matches!(
            Block::from_bytes(&raw),
            Err(S4Error::MalformedBlock(_))
        ));
    }
}
