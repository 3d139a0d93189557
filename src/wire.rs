use crate::status::ErrorCode;

pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;
pub const MAX_VARINT_LEN: usize = 10;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WireType {
    Varint = 0,
    I64 = 1,
    Len = 2,
    StartGroup = 3,
    EndGroup = 4,
    I32 = 5,
}

impl WireType {
    #[inline]
    pub fn from_tag(tag: u32) -> Option<WireType> {
        Some(match tag & 7 {
            0 => WireType::Varint,
            1 => WireType::I64,
            2 => WireType::Len,
            3 => WireType::StartGroup,
            4 => WireType::EndGroup,
            5 => WireType::I32,
            _ => return None,
        })
    }
}

#[inline]
pub const fn make_tag(number: u32, wire_type: WireType) -> u32 {
    (number << 3) | wire_type as u32
}

pub fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ (-((n & 1) as i64))
}

pub fn zigzag_encode(n: i64) -> u64 {
    ((n as u64) << 1) ^ ((n >> 63) as u64)
}

pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ (-((n & 1) as i32))
}

pub fn zigzag_encode32(n: i32) -> u32 {
    ((n as u32) << 1) ^ ((n >> 31) as u32)
}

#[inline]
pub fn varint_size(n: u64) -> usize {
    let log2 = (n | 1).ilog2();
    ((log2 * 9 + 64 + 9) / 64) as usize
}

#[inline]
pub fn tag_size(number: u32) -> usize {
    varint_size((number as u64) << 3)
}

/// Writes `n` as a varint into `out`, returning the number of bytes used.
pub fn encode_varint(mut n: u64, out: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    while n >= 0x80 {
        out[i] = n as u8 | 0x80;
        n >>= 7;
        i += 1;
    }
    out[i] = n as u8;
    i + 1
}

#[inline(never)]
fn read_varint_slow(buf: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;
    for (i, &b) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        result |= ((b & 0x7f) as u64) << (7 * i);
        if b < 0x80 {
            return Some((result, i + 1));
        }
    }
    None
}

/// Forward reader over one input buffer. Every read is bounded by `limit`,
/// the end of the innermost length-delimited range being parsed.
#[derive(Clone, Copy)]
pub struct ReadCursor<'b> {
    buf: &'b [u8],
    pos: usize,
    limit: usize,
}

impl<'b> ReadCursor<'b> {
    pub fn new(buf: &'b [u8]) -> Self {
        ReadCursor {
            buf,
            pos: 0,
            limit: buf.len(),
        }
    }

    #[inline(always)]
    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline(always)]
    pub fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit <= self.buf.len());
        self.limit = limit;
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    #[inline(always)]
    pub fn at_limit(&self) -> bool {
        self.pos >= self.limit
    }

    /// The whole input, regardless of the current limit.
    #[inline(always)]
    pub fn data(&self) -> &'b [u8] {
        self.buf
    }

    #[inline(always)]
    fn window(&self) -> &'b [u8] {
        &self.buf[self.pos..self.limit]
    }

    #[inline(always)]
    pub fn read_varint(&mut self) -> Result<u64, ErrorCode> {
        match self.window().first() {
            Some(&b) if b < 0x80 => {
                self.pos += 1;
                Ok(b as u64)
            }
            Some(_) => {
                let (value, len) = read_varint_slow(self.window()).ok_or(ErrorCode::TruncatedVarint)?;
                self.pos += len;
                Ok(value)
            }
            None => Err(ErrorCode::TruncatedVarint),
        }
    }

    #[inline(always)]
    pub fn read_tag(&mut self) -> Result<u32, ErrorCode> {
        let tag = self.read_varint()?;
        if tag > u32::MAX as u64 {
            return Err(ErrorCode::InvalidFieldNumber);
        }
        Ok(tag as u32)
    }

    // Reads a length prefix and checks it against the current limit.
    #[inline(always)]
    pub fn read_size(&mut self) -> Result<usize, ErrorCode> {
        let size = self.read_varint()?;
        if size > i32::MAX as u64 || size as usize > self.remaining() {
            return Err(ErrorCode::LengthOutOfBounds);
        }
        Ok(size as usize)
    }

    #[inline(always)]
    pub fn read_fixed32(&mut self) -> Result<u32, ErrorCode> {
        let bytes = self.read_bytes(4).map_err(|_| ErrorCode::TruncatedInput)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[inline(always)]
    pub fn read_fixed64(&mut self) -> Result<u64, ErrorCode> {
        let bytes = self.read_bytes(8).map_err(|_| ErrorCode::TruncatedInput)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    #[inline(always)]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'b [u8], ErrorCode> {
        if len > self.remaining() {
            return Err(ErrorCode::LengthOutOfBounds);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    #[inline(always)]
    pub fn skip(&mut self, len: usize) -> Result<(), ErrorCode> {
        if len > self.remaining() {
            return Err(ErrorCode::TruncatedInput);
        }
        self.pos += len;
        Ok(())
    }

    /// Up to two upcoming bytes, little endian, zero padded.
    #[inline(always)]
    pub fn peek_u16(&self) -> u16 {
        match self.window() {
            [a, b, ..] => u16::from_le_bytes([*a, *b]),
            [a] => *a as u16,
            [] => 0,
        }
    }

    #[inline(always)]
    pub fn peek_byte(&self) -> Option<u8> {
        self.window().first().copied()
    }

    /// Moves back (or forward) to `pos`, which must lie within the limit.
    #[inline(always)]
    pub fn set_pos(&mut self, pos: usize) {
        debug_assert!(pos <= self.limit);
        self.pos = pos;
    }

    #[inline(always)]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.pos += n;
    }
}

/// Forward writer into a buffer that was sized from a previous size pass.
pub struct WriteCursor<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> WriteCursor<'b> {
    pub fn new(buf: &'b mut [u8]) -> Self {
        WriteCursor { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn write_varint(&mut self, mut n: u64) {
        while n >= 0x80 {
            self.buf[self.pos] = n as u8 | 0x80;
            self.pos += 1;
            n >>= 7;
        }
        self.buf[self.pos] = n as u8;
        self.pos += 1;
    }

    #[inline]
    pub fn write_tag(&mut self, number: u32, wire_type: WireType) {
        self.write_varint(make_tag(number, wire_type) as u64);
    }

    #[inline]
    pub fn write_fixed32(&mut self, value: u32) {
        self.write_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_fixed64(&mut self, value: u64) {
        self.write_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_slice(&mut self, slice: &[u8]) {
        self.buf[self.pos..self.pos + slice.len()].copy_from_slice(slice);
        self.pos += slice.len();
    }
}
