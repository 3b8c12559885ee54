//! Static Huffman coder.
//!
//! The code tree is built from a fixed frequency table sampled from packed
//! snapshot traffic, so both ends derive identical codes without transmitting
//! a table. Codes are emitted least-significant bit first and every stream is
//! terminated by a dedicated EOF symbol.

use std::sync::OnceLock;

use super::CompressionError;

/// Symbol that terminates every compressed stream.
pub const EOF_SYMBOL: usize = 256;
/// Byte symbols plus EOF.
pub const MAX_SYMBOLS: usize = EOF_SYMBOL + 1;
const MAX_NODES: usize = MAX_SYMBOLS * 2 - 1;
const NO_LEAF: u16 = 0xffff;

/// Symbol frequencies of the network/demo coder. The EOF entry is ignored and
/// forced to 1 during tree construction.
pub const FREQUENCY_TABLE: [u32; MAX_SYMBOLS] = [
    1 << 30, 4545, 2657, 431, 1950, 919, 444, 482, 2244, 617, 838, 542, 715, 1814, 304, 240, 754, 212, 647, 186,
    283, 131, 146, 166, 543, 164, 167, 136, 179, 859, 363, 113, 157, 154, 204, 108, 137, 180, 202, 176,
    872, 404, 168, 134, 151, 111, 113, 109, 120, 126, 129, 100, 41, 20, 16, 22, 18, 18, 17, 19,
    16, 37, 13, 21, 362, 166, 99, 78, 95, 88, 81, 70, 83, 284, 91, 187, 77, 68, 52, 68,
    59, 66, 61, 638, 71, 157, 50, 46, 69, 43, 11, 24, 13, 19, 10, 12, 12, 20, 14, 9,
    20, 20, 10, 10, 15, 15, 12, 12, 7, 19, 15, 14, 13, 18, 35, 19, 17, 14, 8, 5,
    15, 17, 9, 15, 14, 18, 8, 10, 2173, 134, 157, 68, 188, 60, 170, 60, 194, 62, 175, 71,
    148, 67, 167, 78, 211, 67, 156, 69, 1674, 90, 174, 53, 147, 89, 181, 51, 174, 63, 163, 80,
    167, 94, 128, 122, 223, 153, 218, 77, 200, 110, 190, 73, 174, 69, 145, 66, 277, 143, 141, 60,
    136, 53, 180, 57, 142, 57, 158, 61, 166, 112, 152, 92, 26, 22, 21, 28, 20, 26, 30, 21,
    32, 27, 20, 17, 23, 21, 30, 22, 22, 21, 27, 25, 17, 27, 23, 18, 39, 26, 15, 21,
    12, 18, 18, 27, 20, 18, 15, 19, 11, 17, 33, 12, 18, 15, 19, 18, 16, 26, 17, 18,
    9, 10, 25, 22, 22, 17, 20, 16, 6, 16, 15, 20, 14, 18, 24, 335, 1517,
];

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Code bits, first bit in the lowest position.
    bits: u64,
    /// Code length for leaves, 0 for inner nodes.
    num_bits: u32,
    leaves: [u16; 2],
    symbol: u16,
}

/// A constructed code tree.
#[derive(Debug, Clone)]
pub struct Huffman {
    nodes: Vec<Node>,
    start: usize,
}

impl Huffman {
    /// Build the code tree for a frequency table.
    pub fn new(frequencies: &[u32; MAX_SYMBOLS]) -> Self {
        let mut nodes = Vec::with_capacity(MAX_NODES);
        for symbol in 0..MAX_SYMBOLS {
            nodes.push(Node {
                bits: 0,
                num_bits: u32::MAX,
                leaves: [NO_LEAF; 2],
                symbol: symbol as u16,
            });
        }

        // (node id, frequency) of every subtree still waiting to be merged
        let mut pending: Vec<(u16, u64)> = (0..MAX_SYMBOLS)
            .map(|symbol| {
                let frequency = if symbol == EOF_SYMBOL {
                    1
                } else {
                    frequencies[symbol] as u64
                };
                (symbol as u16, frequency)
            })
            .collect();

        while pending.len() > 1 {
            // stable: equal frequencies keep their relative order
            pending.sort_by(|a, b| b.1.cmp(&a.1));

            let (last_id, last_freq) = pending[pending.len() - 1];
            let (second_id, second_freq) = pending[pending.len() - 2];
            let id = nodes.len() as u16;
            nodes.push(Node {
                bits: 0,
                num_bits: 0,
                leaves: [last_id, second_id],
                symbol: 0,
            });

            pending.pop();
            if let Some(merged) = pending.last_mut() {
                *merged = (id, last_freq + second_freq);
            }
        }

        let start = nodes.len() - 1;
        let mut huffman = Self { nodes, start };
        huffman.set_bits(start, 0, 0);
        huffman
    }

    /// The coder shared by demo chunks, built on first use.
    pub fn shared() -> &'static Huffman {
        static SHARED: OnceLock<Huffman> = OnceLock::new();
        SHARED.get_or_init(|| Huffman::new(&FREQUENCY_TABLE))
    }

    fn set_bits(&mut self, index: usize, bits: u64, depth: u32) {
        let [zero, one] = self.nodes[index].leaves;
        if one != NO_LEAF {
            self.set_bits(one as usize, bits | (1 << depth), depth + 1);
        }
        if zero != NO_LEAF {
            self.set_bits(zero as usize, bits, depth + 1);
        }

        let node = &mut self.nodes[index];
        if node.num_bits != 0 {
            node.bits = bits;
            node.num_bits = depth;
        }
    }

    /// Code length of a symbol in bits.
    pub fn code_len(&self, symbol: usize) -> u32 {
        self.nodes[symbol].num_bits
    }

    /// Encode `input` followed by the EOF symbol.
    pub fn compress(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() + 1);
        let mut bits: u64 = 0;
        let mut bitcount: u32 = 0;

        let symbols = input
            .iter()
            .map(|&b| b as usize)
            .chain(std::iter::once(EOF_SYMBOL));
        for symbol in symbols {
            let node = &self.nodes[symbol];
            bits |= node.bits << bitcount;
            bitcount += node.num_bits;
            while bitcount >= 8 {
                out.push(bits as u8);
                bits >>= 8;
                bitcount -= 8;
            }
        }

        // remaining bits, always at least one byte
        out.push(bits as u8);
        out
    }

    /// Decode a stream produced by [`Huffman::compress`], refusing to produce
    /// more than `limit` bytes.
    pub fn decompress(&self, input: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(input.len().saturating_mul(2).min(limit));
        let mut bytes = input.iter();
        let mut bits: u32 = 0;
        let mut bitcount: u32 = 0;

        loop {
            let mut index = self.start;
            while self.nodes[index].num_bits == 0 {
                if bitcount == 0 {
                    bits = *bytes.next().ok_or(CompressionError::Truncated)? as u32;
                    bitcount = 8;
                }
                index = self.nodes[index].leaves[(bits & 1) as usize] as usize;
                bits >>= 1;
                bitcount -= 1;
            }

            if index == EOF_SYMBOL {
                return Ok(out);
            }
            if out.len() >= limit {
                return Err(CompressionError::OutputOverflow { limit });
            }
            out.push(self.nodes[index].symbol as u8);
        }
    }
}
