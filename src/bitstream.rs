//! Low-level bitstream primitives for the grammar container.
//!
//! The container is an LLVM-bitcode-style bitstream: values are packed
//! little-endian into a byte stream, blocks nest with a per-block abbreviation
//! width, and records are either emitted through abbreviations the writer
//! installs at the start of a block (`DEFINE_ABBREV`) or through the
//! self-describing `UNABBREV_RECORD` escape. Block lengths are backpatched in
//! 32-bit words so a reader can skip any block it does not understand.

/// Builtin abbreviation ids, valid in every block.
const END_BLOCK: u64 = 0;
const ENTER_SUBBLOCK: u64 = 1;
const DEFINE_ABBREV: u64 = 2;
const UNABBREV_RECORD: u64 = 3;
/// The first id assigned to an installed abbreviation.
const FIRST_ABBREV_ID: u64 = 4;
/// The abbreviation width in effect outside any block.
const TOP_LEVEL_WIDTH: u32 = 2;

const ENCODING_FIXED: u64 = 1;
const ENCODING_VBR: u64 = 2;
const ENCODING_ARRAY: u64 = 3;

/// One operand of an abbreviation definition. An [`AbbrevOp::Array`] must be
/// the second-to-last operand; the operand after it describes the elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbbrevOp {
    /// A value baked into the abbreviation itself, not present in the stream.
    Literal(u64),
    /// A fixed-width field.
    Fixed(u32),
    /// A variable-width field with the given chunk size.
    Vbr(u32),
    /// A length-prefixed run of elements.
    Array,
}

/// The error type for malformed bitstream input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum BitstreamError {
    /// The stream ended in the middle of a value.
    #[error("bitstream truncated at bit {0}")]
    Truncated(usize),
    /// An abbreviation id that was never defined.
    #[error("undefined abbreviation id {0}")]
    UndefinedAbbrev(u64),
    /// An abbreviation definition used an encoding this reader cannot decode.
    #[error("unsupported abbreviation encoding {0}")]
    UnsupportedEncoding(u64),
    /// END_BLOCK at the top level, or the stream ended inside a block.
    #[error("unbalanced block structure")]
    UnbalancedBlock,
    /// The magic number is wrong.
    #[error("bad magic number")]
    BadMagic,
}

#[derive(Debug, Clone)]
struct WriterScope {
    patch_pos: usize,
    prev_width: u32,
    prev_abbrevs: usize,
}

/// Serializes a bitstream.
#[derive(Debug)]
pub(crate) struct BitstreamWriter {
    buf: Vec<u8>,
    cur: u64,
    cur_bits: u32,
    width: u32,
    scopes: Vec<WriterScope>,
    abbrevs: Vec<Vec<AbbrevOp>>,
}

impl BitstreamWriter {
    pub(crate) fn new(magic: &[u8; 2]) -> Self {
        let mut writer = Self {
            buf: Vec::new(),
            cur: 0,
            cur_bits: 0,
            width: TOP_LEVEL_WIDTH,
            scopes: Vec::new(),
            abbrevs: Vec::new(),
        };
        writer.write_bits(magic[0] as u64, 8);
        writer.write_bits(magic[1] as u64, 8);
        writer
    }

    fn total_bits(&self) -> usize {
        self.buf.len() * 8 + self.cur_bits as usize
    }

    pub(crate) fn write_bits(&mut self, value: u64, bits: u32) {
        debug_assert!(bits <= 32);
        debug_assert!(bits == 64 || value < (1u64 << bits));
        self.cur |= value << self.cur_bits;
        self.cur_bits += bits;
        while self.cur_bits >= 8 {
            self.buf.push((self.cur & 0xff) as u8);
            self.cur >>= 8;
            self.cur_bits -= 8;
        }
    }

    pub(crate) fn write_vbr(&mut self, mut value: u64, width: u32) {
        let chunk_bits = width - 1;
        let mask = (1u64 << chunk_bits) - 1;
        loop {
            let chunk = value & mask;
            value >>= chunk_bits;
            if value != 0 {
                self.write_bits(chunk | (mask + 1), width);
            } else {
                self.write_bits(chunk, width);
                break;
            }
        }
    }

    fn align32(&mut self) {
        let rem = self.total_bits() % 32;
        if rem != 0 {
            let mut pad = 32 - rem as u32;
            while pad > 0 {
                let step = pad.min(8);
                self.write_bits(0, step);
                pad -= step;
            }
        }
    }

    /// Open a subblock; abbreviations installed inside it are dropped again
    /// when the block ends.
    pub(crate) fn enter_subblock(&mut self, block_id: u64, new_width: u32) {
        self.write_bits(ENTER_SUBBLOCK, self.width);
        self.write_vbr(block_id, 8);
        self.write_vbr(new_width as u64, 4);
        self.align32();
        let patch_pos = self.buf.len();
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        self.scopes.push(WriterScope {
            patch_pos,
            prev_width: self.width,
            prev_abbrevs: self.abbrevs.len(),
        });
        self.width = new_width;
    }

    pub(crate) fn end_block(&mut self) {
        self.write_bits(END_BLOCK, self.width);
        self.align32();
        let scope = self.scopes.pop().expect("end_block without enter_subblock");
        let words = ((self.buf.len() - scope.patch_pos - 4) / 4) as u32;
        self.buf[scope.patch_pos..scope.patch_pos + 4].copy_from_slice(&words.to_le_bytes());
        self.width = scope.prev_width;
        self.abbrevs.truncate(scope.prev_abbrevs);
    }

    /// Install an abbreviation in the current block; returns its id.
    pub(crate) fn define_abbrev(&mut self, ops: &[AbbrevOp]) -> u64 {
        self.write_bits(DEFINE_ABBREV, self.width);
        self.write_vbr(ops.len() as u64, 5);
        for op in ops {
            match *op {
                AbbrevOp::Literal(value) => {
                    self.write_bits(1, 1);
                    self.write_vbr(value, 8);
                }
                AbbrevOp::Fixed(width) => {
                    self.write_bits(0, 1);
                    self.write_bits(ENCODING_FIXED, 3);
                    self.write_vbr(width as u64, 5);
                }
                AbbrevOp::Vbr(width) => {
                    self.write_bits(0, 1);
                    self.write_bits(ENCODING_VBR, 3);
                    self.write_vbr(width as u64, 5);
                }
                AbbrevOp::Array => {
                    self.write_bits(0, 1);
                    self.write_bits(ENCODING_ARRAY, 3);
                }
            }
        }
        self.abbrevs.push(ops.to_vec());
        FIRST_ABBREV_ID + (self.abbrevs.len() - self.scope_abbrevs_start()) as u64 - 1
    }

    /// Where the current block's abbreviation ids start in the scoped list.
    fn scope_abbrevs_start(&self) -> usize {
        self.scopes.last().map(|s| s.prev_abbrevs).unwrap_or(0)
    }

    /// Emit a record through an installed abbreviation. `values` supplies
    /// every non-literal field; array operands consume all remaining values.
    pub(crate) fn emit_record(&mut self, abbrev_id: u64, values: &[u64]) {
        let index = self.scope_abbrevs_start() + (abbrev_id - FIRST_ABBREV_ID) as usize;
        let ops = self.abbrevs[index].clone();
        self.write_bits(abbrev_id, self.width);
        let mut next = 0usize;
        let mut i = 0usize;
        while i < ops.len() {
            match ops[i] {
                AbbrevOp::Literal(_) => {}
                AbbrevOp::Fixed(width) => {
                    self.write_bits(values[next], width);
                    next += 1;
                }
                AbbrevOp::Vbr(width) => {
                    self.write_vbr(values[next], width);
                    next += 1;
                }
                AbbrevOp::Array => {
                    let elem = ops[i + 1];
                    let rest = &values[next..];
                    self.write_vbr(rest.len() as u64, 6);
                    for &value in rest {
                        match elem {
                            AbbrevOp::Fixed(width) => self.write_bits(value, width),
                            AbbrevOp::Vbr(width) => self.write_vbr(value, width),
                            _ => unreachable!("array elements are fixed or vbr"),
                        }
                    }
                    next = values.len();
                    i += 1;
                }
            }
            i += 1;
        }
        debug_assert_eq!(next, values.len(), "abbreviation arity mismatch");
    }

    /// Emit a record through the self-describing escape.
    pub(crate) fn emit_unabbrev_record(&mut self, code: u64, values: &[u64]) {
        self.write_bits(UNABBREV_RECORD, self.width);
        self.write_vbr(code, 6);
        self.write_vbr(values.len() as u64, 6);
        for &value in values {
            self.write_vbr(value, 6);
        }
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        debug_assert!(self.scopes.is_empty(), "unclosed block");
        self.align32();
        self.buf
    }
}

#[derive(Debug, Clone)]
struct ReaderScope {
    width: u32,
    end_bit: usize,
    abbrevs_start: usize,
}

/// One step of bitstream traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Entry {
    EnterBlock(u64),
    EndBlock,
    Record { code: u64, fields: Vec<u64> },
}

/// Decodes a bitstream produced by [`BitstreamWriter`] (or anything
/// compatible with the same subset of the format).
#[derive(Debug)]
pub(crate) struct BitstreamReader<'a> {
    data: &'a [u8],
    bit: usize,
    width: u32,
    scopes: Vec<ReaderScope>,
    abbrevs: Vec<Vec<AbbrevOp>>,
}

impl<'a> BitstreamReader<'a> {
    pub(crate) fn new(data: &'a [u8], magic: &[u8; 2]) -> Result<Self, BitstreamError> {
        let mut reader = Self {
            data,
            bit: 0,
            width: TOP_LEVEL_WIDTH,
            scopes: Vec::new(),
            abbrevs: Vec::new(),
        };
        let m0 = reader.read_bits(8)?;
        let m1 = reader.read_bits(8)?;
        if m0 != magic[0] as u64 || m1 != magic[1] as u64 {
            return Err(BitstreamError::BadMagic);
        }
        Ok(reader)
    }

    fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit
    }

    pub(crate) fn read_bits(&mut self, bits: u32) -> Result<u64, BitstreamError> {
        if self.remaining_bits() < bits as usize {
            return Err(BitstreamError::Truncated(self.bit));
        }
        let mut value = 0u64;
        for i in 0..bits {
            let byte = self.data[self.bit / 8];
            let bit = (byte >> (self.bit % 8)) & 1;
            value |= (bit as u64) << i;
            self.bit += 1;
        }
        Ok(value)
    }

    pub(crate) fn read_vbr(&mut self, width: u32) -> Result<u64, BitstreamError> {
        let chunk_bits = width - 1;
        let hi = 1u64 << chunk_bits;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let chunk = self.read_bits(width)?;
            value |= (chunk & (hi - 1)) << shift;
            if chunk & hi == 0 {
                return Ok(value);
            }
            shift += chunk_bits;
            if shift >= 64 {
                return Err(BitstreamError::Truncated(self.bit));
            }
        }
    }

    fn align32(&mut self) {
        let rem = self.bit % 32;
        if rem != 0 {
            self.bit += 32 - rem;
        }
    }

    /// Advance to the next block boundary or record. Returns `None` at the
    /// end of the top-level stream.
    pub(crate) fn advance(&mut self) -> Result<Option<Entry>, BitstreamError> {
        loop {
            if self.scopes.is_empty() && self.remaining_bits() < self.width as usize {
                return Ok(None);
            }
            let id = self.read_bits(self.width)?;
            match id {
                END_BLOCK => {
                    self.align32();
                    let scope = self.scopes.pop().ok_or(BitstreamError::UnbalancedBlock)?;
                    self.width = match self.scopes.last() {
                        Some(parent) => parent.width,
                        None => TOP_LEVEL_WIDTH,
                    };
                    self.abbrevs.truncate(scope.abbrevs_start);
                    return Ok(Some(Entry::EndBlock));
                }
                ENTER_SUBBLOCK => {
                    let block_id = self.read_vbr(8)?;
                    let new_width = self.read_vbr(4)? as u32;
                    if new_width == 0 || new_width > 32 {
                        return Err(BitstreamError::UnsupportedEncoding(new_width as u64));
                    }
                    self.align32();
                    let words = self.read_bits(32)?;
                    let end_bit = self.bit + words as usize * 32;
                    if end_bit > self.data.len() * 8 {
                        return Err(BitstreamError::Truncated(self.bit));
                    }
                    self.scopes.push(ReaderScope {
                        width: new_width,
                        end_bit,
                        abbrevs_start: self.abbrevs.len(),
                    });
                    self.width = new_width;
                    return Ok(Some(Entry::EnterBlock(block_id)));
                }
                DEFINE_ABBREV => {
                    let ops = self.read_abbrev_def()?;
                    self.abbrevs.push(ops);
                }
                UNABBREV_RECORD => {
                    let code = self.read_vbr(6)?;
                    let count = self.read_vbr(6)?;
                    let mut fields = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        fields.push(self.read_vbr(6)?);
                    }
                    return Ok(Some(Entry::Record { code, fields }));
                }
                abbrev_id => {
                    let index = (abbrev_id - FIRST_ABBREV_ID) as usize;
                    let start = self
                        .scopes
                        .last()
                        .map(|s| s.abbrevs_start)
                        .unwrap_or(0);
                    let ops = self
                        .abbrevs
                        .get(start + index)
                        .ok_or(BitstreamError::UndefinedAbbrev(abbrev_id))?
                        .clone();
                    return Ok(Some(self.read_abbreviated(&ops)?));
                }
            }
        }
    }

    /// Skip the rest of the block most recently entered.
    pub(crate) fn skip_block(&mut self) -> Result<(), BitstreamError> {
        let scope = self.scopes.pop().ok_or(BitstreamError::UnbalancedBlock)?;
        self.bit = scope.end_bit;
        self.width = match self.scopes.last() {
            Some(parent) => parent.width,
            None => TOP_LEVEL_WIDTH,
        };
        self.abbrevs.truncate(scope.abbrevs_start);
        Ok(())
    }

    fn read_abbrev_def(&mut self) -> Result<Vec<AbbrevOp>, BitstreamError> {
        let count = self.read_vbr(5)?;
        let mut ops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let is_literal = self.read_bits(1)?;
            if is_literal == 1 {
                ops.push(AbbrevOp::Literal(self.read_vbr(8)?));
            } else {
                let encoding = self.read_bits(3)?;
                match encoding {
                    ENCODING_FIXED => ops.push(AbbrevOp::Fixed(self.read_vbr(5)? as u32)),
                    ENCODING_VBR => ops.push(AbbrevOp::Vbr(self.read_vbr(5)? as u32)),
                    ENCODING_ARRAY => ops.push(AbbrevOp::Array),
                    other => return Err(BitstreamError::UnsupportedEncoding(other)),
                }
            }
        }
        Ok(ops)
    }

    fn read_abbreviated(&mut self, ops: &[AbbrevOp]) -> Result<Entry, BitstreamError> {
        let mut code: Option<u64> = None;
        let mut fields = Vec::new();
        let mut push = |value: u64, code: &mut Option<u64>, fields: &mut Vec<u64>| {
            if code.is_none() {
                *code = Some(value);
            } else {
                fields.push(value);
            }
        };
        let mut i = 0usize;
        while i < ops.len() {
            match ops[i] {
                AbbrevOp::Literal(value) => push(value, &mut code, &mut fields),
                AbbrevOp::Fixed(width) => {
                    let value = self.read_bits(width)?;
                    push(value, &mut code, &mut fields);
                }
                AbbrevOp::Vbr(width) => {
                    let value = self.read_vbr(width)?;
                    push(value, &mut code, &mut fields);
                }
                AbbrevOp::Array => {
                    let elem = ops[i + 1];
                    let count = self.read_vbr(6)?;
                    for _ in 0..count {
                        let value = match elem {
                            AbbrevOp::Fixed(width) => self.read_bits(width)?,
                            AbbrevOp::Vbr(width) => self.read_vbr(width)?,
                            _ => return Err(BitstreamError::UnsupportedEncoding(ENCODING_ARRAY)),
                        };
                        push(value, &mut code, &mut fields);
                    }
                    i += 1;
                }
            }
            i += 1;
        }
        Ok(Entry::Record {
            code: code.unwrap_or(0),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vbr_roundtrip() {
        let mut writer = BitstreamWriter::new(b"GH");
        for &value in &[0u64, 1, 31, 32, 63, 64, 1000, u32::MAX as u64] {
            writer.write_vbr(value, 6);
        }
        let data = writer.finish();
        let mut reader = BitstreamReader::new(&data, b"GH").unwrap();
        for &value in &[0u64, 1, 31, 32, 63, 64, 1000, u32::MAX as u64] {
            assert_eq!(reader.read_vbr(6).unwrap(), value);
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let writer = BitstreamWriter::new(b"XX");
        let data = writer.finish();
        assert_eq!(
            BitstreamReader::new(&data, b"GH").unwrap_err(),
            BitstreamError::BadMagic
        );
    }

    #[test]
    fn blocks_and_records_roundtrip() {
        let mut writer = BitstreamWriter::new(b"GH");
        writer.enter_subblock(10, 4);
        let abbrev = writer.define_abbrev(&[AbbrevOp::Literal(0), AbbrevOp::Array, AbbrevOp::Fixed(8)]);
        writer.emit_record(abbrev, &[b'h' as u64, b'i' as u64]);
        writer.emit_unabbrev_record(7, &[1, 2, 3]);
        writer.end_block();
        let data = writer.finish();

        let mut reader = BitstreamReader::new(&data, b"GH").unwrap();
        assert_eq!(reader.advance().unwrap(), Some(Entry::EnterBlock(10)));
        assert_eq!(
            reader.advance().unwrap(),
            Some(Entry::Record {
                code: 0,
                fields: vec![b'h' as u64, b'i' as u64],
            })
        );
        assert_eq!(
            reader.advance().unwrap(),
            Some(Entry::Record {
                code: 7,
                fields: vec![1, 2, 3],
            })
        );
        assert_eq!(reader.advance().unwrap(), Some(Entry::EndBlock));
        assert_eq!(reader.advance().unwrap(), None);
    }

    #[test]
    fn unknown_blocks_can_be_skipped() {
        let mut writer = BitstreamWriter::new(b"GH");
        writer.enter_subblock(99, 3);
        writer.emit_unabbrev_record(1, &[42]);
        writer.enter_subblock(100, 2);
        writer.end_block();
        writer.end_block();
        writer.enter_subblock(10, 2);
        writer.emit_unabbrev_record(5, &[9]);
        writer.end_block();
        let data = writer.finish();

        let mut reader = BitstreamReader::new(&data, b"GH").unwrap();
        assert_eq!(reader.advance().unwrap(), Some(Entry::EnterBlock(99)));
        reader.skip_block().unwrap();
        assert_eq!(reader.advance().unwrap(), Some(Entry::EnterBlock(10)));
        assert_eq!(
            reader.advance().unwrap(),
            Some(Entry::Record {
                code: 5,
                fields: vec![9],
            })
        );
        assert_eq!(reader.advance().unwrap(), Some(Entry::EndBlock));
        assert_eq!(reader.advance().unwrap(), None);
    }

    #[test]
    fn truncation_is_detected() {
        let mut writer = BitstreamWriter::new(b"GH");
        writer.enter_subblock(10, 4);
        writer.emit_unabbrev_record(1, &[1, 2, 3, 4, 5]);
        writer.end_block();
        let data = writer.finish();
        let cut = &data[..data.len() - 6];
        let mut reader = BitstreamReader::new(cut, b"GH").unwrap();
        let mut saw_error = false;
        for _ in 0..16 {
            match reader.advance() {
                Err(_) => {
                    saw_error = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(_)) => {}
            }
        }
        assert!(saw_error, "truncated stream decoded cleanly");
    }

    #[test]
    fn nested_abbrevs_are_scoped() {
        let mut writer = BitstreamWriter::new(b"GH");
        writer.enter_subblock(8, 4);
        let outer = writer.define_abbrev(&[AbbrevOp::Literal(1), AbbrevOp::Vbr(6)]);
        writer.emit_record(outer, &[5]);
        writer.enter_subblock(9, 4);
        let inner = writer.define_abbrev(&[AbbrevOp::Literal(2), AbbrevOp::Vbr(6)]);
        writer.emit_record(inner, &[6]);
        writer.end_block();
        writer.emit_record(outer, &[7]);
        writer.end_block();
        let data = writer.finish();

        let mut reader = BitstreamReader::new(&data, b"GH").unwrap();
        assert_eq!(reader.advance().unwrap(), Some(Entry::EnterBlock(8)));
        assert_eq!(
            reader.advance().unwrap(),
            Some(Entry::Record { code: 1, fields: vec![5] })
        );
        assert_eq!(reader.advance().unwrap(), Some(Entry::EnterBlock(9)));
        assert_eq!(
            reader.advance().unwrap(),
            Some(Entry::Record { code: 2, fields: vec![6] })
        );
        assert_eq!(reader.advance().unwrap(), Some(Entry::EndBlock));
        assert_eq!(
            reader.advance().unwrap(),
            Some(Entry::Record { code: 1, fields: vec![7] })
        );
        assert_eq!(reader.advance().unwrap(), Some(Entry::EndBlock));
        assert_eq!(reader.advance().unwrap(), None);
    }
}
