//! Large-record chain through the overflow subfile (spec §3.3, §4.4).
//!
//! A record whose data exceeds `params.big_rec_size` is split into
//! fixed-size chunks, each stored in its own overflow block linked by a
//! `next` block number; the first chunk's block also stores the total
//! data length so a reader can pre-size its buffer.

/// One link of a big-record chain.
#[derive(Debug, Clone)]
pub struct BigRecBlock {
    pub total_len: u32,
    pub next: u32,
    pub data: Vec<u8>,
}

/// Splits `data` into a chain of blocks of at most `chunk_size` payload
/// bytes each. The caller assigns real block numbers as it allocates
/// free overflow blocks and wires up `next`; this returns the chain in
/// allocation order with `next` left at `0` (the caller patches it in,
/// since block numbers aren't known until allocation, spec §4.4 "write
/// it to the overflow chain via split_chain allocations").
pub fn split_chain(data: &[u8], chunk_size: usize) -> Vec<BigRecBlock> {
    if data.is_empty() {
        return vec![BigRecBlock { total_len: 0, next: 0, data: Vec::new() }];
    }
    let total_len = data.len() as u32;
    data.chunks(chunk_size.max(1))
        .map(|chunk| BigRecBlock { total_len, next: 0, data: chunk.to_vec() })
        .collect()
}

/// Reassembles a big-record chain's data given an accessor that reads
/// block `n`'s `BigRecBlock`. Stops once `next == 0` or the gathered
/// length reaches the first block's `total_len`.
pub fn gather_chain(start_block: u32, mut read_block: impl FnMut(u32) -> BigRecBlock) -> Vec<u8> {
    let mut out = Vec::new();
    let mut block_no = start_block;
    let mut total_len: Option<u32> = None;
    while block_no != 0 {
        let block = read_block(block_no);
        if total_len.is_none() {
            total_len = Some(block.total_len);
        }
        out.extend_from_slice(&block.data);
        block_no = block.next;
        if let Some(len) = total_len {
            if out.len() as u32 >= len {
                break;
            }
        }
    }
    out
}

impl BigRecBlock {
    /// Packs `(total_len, next, data)` into a fixed-size block, zero
    /// padded to `capacity`.
    pub fn to_bytes(&self, capacity: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(&self.total_len.to_le_bytes());
        out.extend_from_slice(&self.next.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out.resize(capacity, 0);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> BigRecBlock {
        let total_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let next = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let data_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let data = bytes[12..12 + data_len].to_vec();
        BigRecBlock { total_len, next, data }
    }

    pub const HEADER_LEN: usize = 12;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn split_then_gather_round_trips() {
        let data: Vec<u8> = (0..250u16).map(|v| (v % 256) as u8).collect();
        let mut chain = split_chain(&data, 64);
        let mut store: HashMap<u32, BigRecBlock> = HashMap::new();
        for (i, block) in chain.iter_mut().enumerate() {
            block.next = 0;
            store.insert((i + 1) as u32, block.clone());
        }
        for i in 0..chain.len() {
            let next = if i + 1 < chain.len() { (i + 2) as u32 } else { 0 };
            store.get_mut(&((i + 1) as u32)).unwrap().next = next;
        }
        let gathered = gather_chain(1, |n| store.get(&n).unwrap().clone());
        assert_eq!(gathered, data);
    }

    #[test]
    fn empty_data_yields_single_empty_block() {
        let chain = split_chain(&[], 64);
        assert_eq!(chain.len(), 1);
        assert!(chain[0].data.is_empty());
    }
}
