//! Fixed-table Huffman coder for the compressed wire string form.
//!
//! Both ends of the protocol build the identical code tree from the byte
//! weights below, so no dictionary ever travels on the wire. The weights
//! favor the lowercase ASCII that dominates server names, game types and
//! status text; every byte value gets at least weight 1 so arbitrary
//! payloads still encode.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::OnceLock;

fn weight(byte: u8) -> u32 {
    match byte {
        b' ' => 120,
        b'e' => 90,
        b't' => 64,
        b'a' => 60,
        b'o' => 56,
        b'i' => 52,
        b'n' => 50,
        b's' => 46,
        b'r' => 44,
        b'h' => 38,
        b'l' => 30,
        b'd' => 27,
        b'c' => 22,
        b'u' => 20,
        b'm' => 18,
        b'f' => 16,
        b'p' => 15,
        b'g' => 13,
        b'w' => 12,
        b'y' => 11,
        b'b' => 10,
        b'v' => 7,
        b'k' => 6,
        b'0'..=b'9' => 8,
        b'A'..=b'Z' => 6,
        b'.' | b':' | b'-' | b'_' => 5,
        0x20..=0x7E => 2,
        _ => 1,
    }
}

struct Node {
    symbol: Option<u8>,
    children: Option<(usize, usize)>,
}

struct Coder {
    nodes: Vec<Node>,
    root: usize,
    // (bits, bit count) per byte value, MSB-aligned within `bits`'s low end
    codes: [(u32, u8); 256],
}

impl Coder {
    fn build() -> Coder {
        let mut nodes = Vec::with_capacity(511);
        // Heap keyed on (weight, insertion order) so the merge order, and
        // therefore the tree, is identical everywhere.
        let mut heap = BinaryHeap::new();
        for sym in 0..=255u8 {
            nodes.push(Node {
                symbol: Some(sym),
                children: None,
            });
            heap.push(Reverse((weight(sym), nodes.len() - 1)));
        }
        while heap.len() > 1 {
            let Reverse((wa, a)) = heap.pop().unwrap();
            let Reverse((wb, b)) = heap.pop().unwrap();
            nodes.push(Node {
                symbol: None,
                children: Some((a, b)),
            });
            heap.push(Reverse((wa + wb, nodes.len() - 1)));
        }
        let root = heap.pop().unwrap().0 .1;

        let mut codes = [(0u32, 0u8); 256];
        let mut stack = vec![(root, 0u32, 0u8)];
        while let Some((idx, bits, len)) = stack.pop() {
            match nodes[idx].children {
                Some((left, right)) => {
                    stack.push((left, bits << 1, len + 1));
                    stack.push((right, (bits << 1) | 1, len + 1));
                }
                None => {
                    if let Some(sym) = nodes[idx].symbol {
                        codes[sym as usize] = (bits, len);
                    }
                }
            }
        }
        Coder { nodes, root, codes }
    }
}

fn coder() -> &'static Coder {
    static CODER: OnceLock<Coder> = OnceLock::new();
    CODER.get_or_init(Coder::build)
}

/// Packs `data` into MSB-first Huffman bits. The result is not
/// self-delimiting; the caller frames it with the original length.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let coder = coder();
    let mut out = Vec::new();
    let mut used: u32 = 0;
    for &byte in data {
        let (bits, len) = coder.codes[byte as usize];
        for i in (0..len).rev() {
            if used % 8 == 0 {
                out.push(0);
            }
            if (bits >> i) & 1 != 0 {
                let last = out.len() - 1;
                out[last] |= 1 << (7 - (used % 8));
            }
            used += 1;
        }
    }
    out
}

/// Decodes exactly `count` symbols from `packed`. Returns `None` when the
/// bit stream runs out early.
pub fn decode(packed: &[u8], count: usize) -> Option<Vec<u8>> {
    let coder = coder();
    let mut out = Vec::with_capacity(count);
    let mut pos: usize = 0;
    let total_bits = packed.len() * 8;
    for _ in 0..count {
        let mut idx = coder.root;
        while let Some((left, right)) = coder.nodes[idx].children {
            if pos >= total_bits {
                return None;
            }
            let bit = (packed[pos / 8] >> (7 - (pos % 8))) & 1;
            idx = if bit == 0 { left } else { right };
            pos += 1;
        }
        out.push(coder.nodes[idx].symbol?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_text() {
        let samples: [&[u8]; 5] = [
            b"",
            b"CTF",
            b"Sunny's deathmatch arena",
            b"mission.one has spaces and 123 digits",
            &[0u8, 255, 7, 31, 128],
        ];
        for data in samples {
            let packed = encode(data);
            assert_eq!(decode(&packed, data.len()).as_deref(), Some(data));
        }
    }

    #[test]
    fn common_text_actually_shrinks() {
        let data = b"the eastern server lists on the lan segment";
        assert!(encode(data).len() < data.len());
    }

    #[test]
    fn truncated_stream_is_detected() {
        let data = b"some status string";
        let mut packed = encode(data);
        packed.truncate(packed.len() / 2);
        assert_eq!(decode(&packed, data.len()), None);
    }

    #[test]
    fn deterministic_across_calls() {
        let data = b"Determinism check";
        assert_eq!(encode(data), encode(data));
    }
}
