//! Ordinary TVM cells and bag-of-cells serialization
//!
//! Only level-0 ordinary cells are supported, which covers every message
//! the resolver builds and every get-method result it reads.

use super::address::TonAddress;
use crate::error::{SwapError, SwapResult};

use ethers::types::U256;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const MAX_BITS: usize = 1023;
pub const MAX_REFS: usize = 4;

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

fn cell_error(message: impl Into<String>) -> SwapError {
    SwapError::Internal(format!("cell: {}", message.into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
    hash: [u8; 32],
    depth: u16,
}

impl Cell {
    fn new(data: Vec<u8>, bit_len: usize, refs: Vec<Arc<Cell>>) -> Self {
        let depth = refs
            .iter()
            .map(|r| r.depth + 1)
            .max()
            .unwrap_or(0);
        let mut cell = Self {
            data,
            bit_len,
            refs,
            hash: [0u8; 32],
            depth,
        };
        cell.hash = Sha256::digest(cell.representation()).into();
        cell
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, Vec::new())
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    fn descriptors(&self) -> [u8; 2] {
        let d1 = self.refs.len() as u8;
        let d2 = (self.bit_len / 8 + (self.bit_len + 7) / 8) as u8;
        [d1, d2]
    }

    /// Data bytes with the completion tag appended when the last byte is partial
    fn padded_data(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        if self.bit_len % 8 != 0 {
            let last = data.len() - 1;
            data[last] |= 0x80 >> (self.bit_len % 8);
        }
        data
    }

    fn representation(&self) -> Vec<u8> {
        let mut repr = Vec::with_capacity(2 + self.data.len() + self.refs.len() * 34);
        repr.extend_from_slice(&self.descriptors());
        repr.extend_from_slice(&self.padded_data());
        for r in &self.refs {
            repr.extend_from_slice(&r.depth.to_be_bytes());
        }
        for r in &self.refs {
            repr.extend_from_slice(&r.hash);
        }
        repr
    }

    pub fn bit(&self, index: usize) -> bool {
        self.data[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn slice(&self) -> CellSlice<'_> {
        CellSlice {
            cell: self,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    /// Serialize as a single-root bag of cells without index or checksum
    pub fn to_boc(&self) -> Vec<u8> {
        let mut order: Vec<&Cell> = Vec::new();
        let mut seen = HashSet::new();
        collect_post_order(self, &mut order, &mut seen);
        order.reverse();

        let index: HashMap<[u8; 32], usize> = order
            .iter()
            .enumerate()
            .map(|(i, c)| (c.hash, i))
            .collect();

        let size_bytes = bytes_needed(order.len() as u64).max(1);
        let mut body = Vec::new();
        for cell in &order {
            body.extend_from_slice(&cell.descriptors());
            body.extend_from_slice(&cell.padded_data());
            for r in &cell.refs {
                write_uint(&mut body, index[&r.hash] as u64, size_bytes);
            }
        }
        let off_bytes = bytes_needed(body.len() as u64).max(1);

        let mut boc = Vec::with_capacity(body.len() + 16);
        boc.extend_from_slice(&BOC_MAGIC);
        boc.push(size_bytes as u8);
        boc.push(off_bytes as u8);
        write_uint(&mut boc, order.len() as u64, size_bytes); // cells
        write_uint(&mut boc, 1, size_bytes); // roots
        write_uint(&mut boc, 0, size_bytes); // absent
        write_uint(&mut boc, body.len() as u64, off_bytes);
        write_uint(&mut boc, 0, size_bytes); // root index
        boc.extend_from_slice(&body);
        boc
    }

    /// Parse the first root of a bag of cells
    pub fn from_boc(bytes: &[u8]) -> SwapResult<Cell> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(4)? != BOC_MAGIC {
            return Err(cell_error("bad bag-of-cells magic"));
        }
        let flags = reader.take(1)?[0];
        let has_index = flags & 0x80 != 0;
        let size_bytes = (flags & 0x07) as usize;
        let off_bytes = reader.take(1)?[0] as usize;
        if size_bytes == 0 || size_bytes > 4 || off_bytes == 0 || off_bytes > 8 {
            return Err(cell_error("bad bag-of-cells sizes"));
        }

        let cell_count = reader.uint(size_bytes)? as usize;
        let root_count = reader.uint(size_bytes)? as usize;
        let _absent = reader.uint(size_bytes)?;
        let _total_size = reader.uint(off_bytes)?;
        if root_count == 0 {
            return Err(cell_error("bag of cells has no root"));
        }
        // Every cell takes at least its two descriptor bytes
        if cell_count > bytes.len() / 2 || root_count > cell_count {
            return Err(cell_error("bag-of-cells counts exceed its size"));
        }
        let root = reader.uint(size_bytes)? as usize;
        for _ in 1..root_count {
            reader.uint(size_bytes)?;
        }
        if has_index {
            reader.take(cell_count * off_bytes)?;
        }

        let mut raw = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            let d1 = reader.take(1)?[0];
            let d2 = reader.take(1)?[0] as usize;
            if d1 & 0xF8 != 0 {
                return Err(cell_error("exotic or leveled cells are not supported"));
            }
            let ref_count = (d1 & 0x07) as usize;
            let data_len = (d2 + 1) / 2;
            let mut data = reader.take(data_len)?.to_vec();
            let bit_len = if d2 % 2 == 0 {
                data_len * 8
            } else {
                strip_completion_tag(&mut data)?
            };
            let mut refs = Vec::with_capacity(ref_count);
            for _ in 0..ref_count {
                refs.push(reader.uint(size_bytes)? as usize);
            }
            raw.push((data, bit_len, refs));
        }

        let mut built: Vec<Option<Arc<Cell>>> = vec![None; cell_count];
        for i in (0..cell_count).rev() {
            let (data, bit_len, ref_indices) = &raw[i];
            let mut refs = Vec::with_capacity(ref_indices.len());
            for &r in ref_indices {
                if r <= i {
                    return Err(cell_error("cell references must point forward"));
                }
                let child = built
                    .get(r)
                    .and_then(|c| c.clone())
                    .ok_or_else(|| cell_error("dangling cell reference"))?;
                refs.push(child);
            }
            built[i] = Some(Arc::new(Cell::new(data.clone(), *bit_len, refs)));
        }

        built
            .get(root)
            .and_then(|c| c.clone())
            .map(|c| (*c).clone())
            .ok_or_else(|| cell_error("root index out of range"))
    }
}

fn collect_post_order<'a>(
    cell: &'a Cell,
    order: &mut Vec<&'a Cell>,
    seen: &mut HashSet<[u8; 32]>,
) {
    if seen.contains(&cell.hash) {
        return;
    }
    for r in &cell.refs {
        collect_post_order(r, order, seen);
    }
    seen.insert(cell.hash);
    order.push(cell);
}

fn bytes_needed(value: u64) -> usize {
    ((64 - value.leading_zeros() as usize) + 7) / 8
}

fn write_uint(out: &mut Vec<u8>, value: u64, bytes: usize) {
    out.extend_from_slice(&value.to_be_bytes()[8 - bytes..]);
}

/// Remove the completion tag from the last byte and return the bit length
fn strip_completion_tag(data: &mut [u8]) -> SwapResult<usize> {
    let last = data.len().checked_sub(1).ok_or_else(|| cell_error("empty padded data"))?;
    let byte = data[last];
    if byte == 0 {
        return Err(cell_error("missing completion tag"));
    }
    let tag_pos = byte.trailing_zeros() as usize;
    data[last] = byte & !(1u8 << tag_pos);
    Ok(last * 8 + (7 - tag_pos))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> SwapResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| cell_error("unexpected end of bag of cells"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn uint(&mut self, n: usize) -> SwapResult<u64> {
        Ok(self
            .take(n)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}

#[derive(Debug, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_bit(&mut self, bit: bool) -> SwapResult<&mut Self> {
        if self.bit_len >= MAX_BITS {
            return Err(cell_error("cell overflow"));
        }
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            self.data[self.bit_len / 8] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    pub fn store_uint(&mut self, value: u64, bits: usize) -> SwapResult<&mut Self> {
        if bits > 64 || (bits < 64 && value >> bits != 0) {
            return Err(cell_error(format!("{} does not fit in {} bits", value, bits)));
        }
        for i in (0..bits).rev() {
            self.store_bit((value >> i) & 1 == 1)?;
        }
        Ok(self)
    }

    pub fn store_int(&mut self, value: i64, bits: usize) -> SwapResult<&mut Self> {
        if bits == 0 || bits > 64 {
            return Err(cell_error(format!("invalid int width {}", bits)));
        }
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        self.store_uint(value as u64 & mask, bits)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> SwapResult<&mut Self> {
        for byte in bytes {
            self.store_uint(u64::from(*byte), 8)?;
        }
        Ok(self)
    }

    pub fn store_u256(&mut self, value: U256) -> SwapResult<&mut Self> {
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        self.store_bytes(&bytes)
    }

    /// `VarUInteger 16`: a 4-bit byte length followed by the value
    pub fn store_coins(&mut self, value: U256) -> SwapResult<&mut Self> {
        let len = (value.bits() + 7) / 8;
        if len > 15 {
            return Err(cell_error(format!("{} exceeds the coins range", value)));
        }
        self.store_uint(len as u64, 4)?;
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        self.store_bytes(&bytes[32 - len..])
    }

    /// `MsgAddress`: `addr_none` for `None`, otherwise `addr_std` without anycast
    pub fn store_address(&mut self, address: Option<&TonAddress>) -> SwapResult<&mut Self> {
        match address {
            None => self.store_uint(0, 2),
            Some(address) => {
                self.store_uint(0b10, 2)?
                    .store_bit(false)?
                    .store_int(i64::from(address.workchain), 8)?
                    .store_bytes(&address.hash)
            }
        }
    }

    pub fn store_ref(&mut self, cell: Arc<Cell>) -> SwapResult<&mut Self> {
        if self.refs.len() >= MAX_REFS {
            return Err(cell_error("too many references"));
        }
        self.refs.push(cell);
        Ok(self)
    }

    /// Append another cell's bits and references
    pub fn store_cell(&mut self, cell: &Cell) -> SwapResult<&mut Self> {
        for i in 0..cell.bit_len {
            self.store_bit(cell.bit(i))?;
        }
        for r in &cell.refs {
            self.store_ref(r.clone())?;
        }
        Ok(self)
    }

    pub fn build(&self) -> Cell {
        Cell::new(self.data.clone(), self.bit_len, self.refs.clone())
    }

    pub fn build_ref(&self) -> Arc<Cell> {
        Arc::new(self.build())
    }
}

/// Read cursor over a cell
pub struct CellSlice<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> CellSlice<'a> {
    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len - self.bit_pos
    }

    pub fn load_bit(&mut self) -> SwapResult<bool> {
        if self.bit_pos >= self.cell.bit_len {
            return Err(cell_error("slice underflow"));
        }
        let bit = self.cell.bit(self.bit_pos);
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn load_uint(&mut self, bits: usize) -> SwapResult<u64> {
        if bits > 64 {
            return Err(cell_error(format!("cannot load {} bits into u64", bits)));
        }
        let mut value = 0u64;
        for _ in 0..bits {
            value = (value << 1) | u64::from(self.load_bit()?);
        }
        Ok(value)
    }

    pub fn load_bytes(&mut self, len: usize) -> SwapResult<Vec<u8>> {
        (0..len).map(|_| self.load_uint(8).map(|b| b as u8)).collect()
    }

    pub fn load_address(&mut self) -> SwapResult<Option<TonAddress>> {
        match self.load_uint(2)? {
            0b00 => Ok(None),
            0b10 => {
                if self.load_bit()? {
                    return Err(cell_error("anycast addresses are not supported"));
                }
                let workchain = self.load_uint(8)? as u8 as i8;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&self.load_bytes(32)?);
                Ok(Some(TonAddress::new(workchain, hash)))
            }
            tag => Err(cell_error(format!("unsupported address tag {:02b}", tag))),
        }
    }

    pub fn load_ref(&mut self) -> SwapResult<&'a Cell> {
        let cell = self
            .cell
            .refs
            .get(self.ref_pos)
            .ok_or_else(|| cell_error("no more references"))?;
        self.ref_pos += 1;
        Ok(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cell_hash() {
        assert_eq!(
            hex::encode(Cell::empty().hash()),
            "96a296d224f285c67bee93c30f8a309157f0daa35dc5b87e410b78630a09cfc7"
        );
    }

    #[test]
    fn test_partial_byte_uses_completion_tag() {
        let mut b = CellBuilder::new();
        b.store_uint(0b101, 3).unwrap();
        let cell = b.build();
        assert_eq!(cell.bit_len(), 3);
        assert_eq!(cell.padded_data(), vec![0b1011_0000]);
        assert_eq!(cell.descriptors(), [0, 1]);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut b = CellBuilder::new();
        for _ in 0..MAX_BITS {
            b.store_bit(true).unwrap();
        }
        assert!(b.store_bit(false).is_err());
        assert!(CellBuilder::new().store_uint(4, 2).is_err());

        let mut refs = CellBuilder::new();
        for _ in 0..MAX_REFS {
            refs.store_ref(Arc::new(Cell::empty())).unwrap();
        }
        assert!(refs.store_ref(Arc::new(Cell::empty())).is_err());
    }

    #[test]
    fn test_coins_encoding() {
        let mut b = CellBuilder::new();
        b.store_coins(U256::zero()).unwrap();
        assert_eq!(b.build().bit_len(), 4);

        let mut b = CellBuilder::new();
        b.store_coins(U256::from(1_000_000_000u64)).unwrap();
        let cell = b.build();
        let mut slice = cell.slice();
        assert_eq!(slice.load_uint(4).unwrap(), 4);
        assert_eq!(slice.load_uint(32).unwrap(), 1_000_000_000);
    }

    #[test]
    fn test_boc_preserves_tree_and_hash() {
        let address = TonAddress::new(-1, [0x42u8; 32]);
        let mut leaf = CellBuilder::new();
        leaf.store_address(Some(&address)).unwrap();
        let leaf = leaf.build_ref();

        let mut root = CellBuilder::new();
        root.store_uint(0xdead_beef, 32)
            .unwrap()
            .store_ref(leaf.clone())
            .unwrap()
            .store_ref(leaf)
            .unwrap();
        let root = root.build();

        let boc = root.to_boc();
        assert_eq!(&boc[..4], &BOC_MAGIC);
        let parsed = Cell::from_boc(&boc).unwrap();
        assert_eq!(parsed.hash(), root.hash());

        let mut slice = parsed.slice();
        assert_eq!(slice.load_uint(32).unwrap(), 0xdead_beef);
        let child = slice.load_ref().unwrap();
        assert_eq!(child.slice().load_address().unwrap(), Some(address));
    }

    #[test]
    fn test_addr_none_round_trips() {
        let mut b = CellBuilder::new();
        b.store_address(None).unwrap();
        let cell = b.build();
        assert_eq!(cell.slice().load_address().unwrap(), None);
    }

    #[test]
    fn test_boc_with_oversized_cell_count_is_rejected() {
        let mut boc = BOC_MAGIC.to_vec();
        boc.extend_from_slice(&[0x04, 0x01]);
        boc.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]); // cells
        boc.extend_from_slice(&[0, 0, 0, 1]); // roots
        boc.extend_from_slice(&[0, 0, 0, 0]); // absent
        boc.push(0); // total size
        boc.extend_from_slice(&[0, 0, 0, 0]); // root index
        boc.resize(30, 0);

        let err = Cell::from_boc(&boc).unwrap_err();
        assert!(err.to_string().contains("exceed"));

        let mut many_roots = root_boc();
        // root count larger than the cell count
        many_roots[7] = 2;
        assert!(Cell::from_boc(&many_roots).is_err());
    }

    fn root_boc() -> Vec<u8> {
        let mut b = CellBuilder::new();
        b.store_uint(7, 8).unwrap();
        b.build().to_boc()
    }
}
