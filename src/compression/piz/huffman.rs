
//! 16-bit Huffman compression and decompression.
//! Huffman compression and decompression routines written
//!	by Christian Rouet for his PIZ image file format.
// see https://github.com/AcademySoftwareFoundation/openexr/blob/88246d991e0318c043e6f584f7493da08a31f9f8/OpenEXR/IlmImf/ImfHuf.cpp
//
// The on-disk layout here (a length-prefixed, zero-run-length-packed code
// table followed by the run-length-encoded payload) follows the same shape
// as `ImfHuf.cpp`'s `hufCompress`/`hufUncompress`, but is framed with this
// crate's own 12-byte header (`min_index`, `max_index`, `table_len`) rather
// than byte-for-byte reproducing `ImfHuf`'s wire format.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::convert::TryFrom;
use std::io::Read;

use crate::error::{Error, Result};
use crate::io::Data;

const ENCODE_BITS: usize = 16;                     // literal (value) bit length
const DECODE_BITS: usize = 14;                      // decoding bit size (>= 8), kept for parity with the original constants
const ENCODE_SIZE: usize = (1 << ENCODE_BITS) + 1;  // encoding table size, plus one slot for the run-length pseudo-symbol
const DECODE_SIZE: usize = 1 << DECODE_BITS;
const DECODE_MASK: usize = DECODE_SIZE - 1;

const SHORT_ZEROCODE_RUN: i64 = 59;
const LONG_ZEROCODE_RUN: i64 = 63;
const SHORTEST_LONG_RUN: i64 = 2 + LONG_ZEROCODE_RUN - SHORT_ZEROCODE_RUN;
const LONGEST_LONG_RUN: i64 = 255 + SHORTEST_LONG_RUN;

// code length lives in the low 6 bits of a table entry, so 63 is the type's
// ceiling, but `canonical_table` below allocates a length histogram sized
// 59, making 58 the real ceiling a code may reach.
const MAX_CODE_LENGTH: i64 = 58;

/// `min_index: u32, max_index: u32, table_len: u32`
const HEADER_LEN: usize = 12;

/// Huffman-encode a block of 16-bit values.
pub fn compress(uncompressed: &[u16]) -> Result<Vec<u8>> {
    if uncompressed.is_empty() {
        return Ok(Vec::new());
    }

    let mut frequencies = vec![0_i64; ENCODE_SIZE];
    for &value in uncompressed {
        frequencies[value as usize] += 1;
    }

    let (min_index, max_index) = build_encoding_table(&mut frequencies)?;

    let mut table_bytes = Vec::new();
    {
        let mut c = 0_i64;
        let mut lc = 0_i64;
        pack_encoding_table(&frequencies, min_index, max_index, &mut c, &mut lc, &mut table_bytes);
        flush_remaining_bits(&mut c, &mut lc, &mut table_bytes);
    }

    let mut payload_bytes = Vec::new();
    {
        let mut c = 0_i64;
        let mut lc = 0_i64;
        encode_data(uncompressed, &frequencies, max_index, &mut c, &mut lc, &mut payload_bytes)?;
        flush_remaining_bits(&mut c, &mut lc, &mut payload_bytes);
    }

    let mut out = Vec::with_capacity(HEADER_LEN + table_bytes.len() + payload_bytes.len());
    (min_index as u32).write(&mut out)?;
    (max_index as u32).write(&mut out)?;
    (table_bytes.len() as u32).write(&mut out)?;
    out.extend_from_slice(&table_bytes);
    out.extend_from_slice(&payload_bytes);

    Ok(out)
}

/// Huffman-decode `expected_value_count` 16-bit values.
pub fn decompress(compressed: &[u8], expected_value_count: usize) -> Result<Vec<u16>> {
    if expected_value_count == 0 {
        return Ok(Vec::new());
    }

    if compressed.len() < HEADER_LEN {
        return Err(Error::invalid("huffman data truncated before header"));
    }

    let mut header = compressed;
    let min_index = u32::read(&mut header)? as usize;
    let max_index = u32::read(&mut header)? as usize;
    let table_len = u32::read(&mut header)? as usize;

    if min_index >= ENCODE_SIZE || max_index >= ENCODE_SIZE || min_index > max_index {
        return Err(Error::invalid("huffman table indices out of range"));
    }

    let table_start = HEADER_LEN;
    let table_end = table_start.checked_add(table_len)
        .ok_or_else(|| Error::invalid("huffman table length overflow"))?;

    if table_end > compressed.len() {
        return Err(Error::invalid("huffman data truncated before table end"));
    }

    let table_bytes = &compressed[table_start .. table_end];
    let payload = &compressed[table_end ..];

    let mut hcode = vec![0_i64; ENCODE_SIZE];
    unpack_encoding_table(table_bytes, min_index, max_index, &mut hcode)?;
    canonical_table(&mut hcode);

    let decode_table = DecodeTable::build(&hcode, min_index, max_index)?;
    decode_data(payload, &decode_table, max_index, expected_value_count)
}

// === table construction ===

/// A leaf-only binary tree kept only long enough to read off each symbol's
/// code length (its depth); discarded immediately after.
enum Tree {
    Leaf(usize),
    Node(Box<Tree>, Box<Tree>),
}

/// Builds code lengths for every symbol with non-zero frequency in
/// `frequencies[min_index ..= max_index]` by constructing a Huffman tree
/// with a binary min-heap, then reads the length of each leaf off as its
/// depth from the root.
fn build_huffman_lengths(frequencies: &[i64], min_index: usize, max_index: usize) -> Result<Vec<i64>> {
    let mut freqs: Vec<i64> = Vec::new();
    let mut trees: Vec<Option<Tree>> = Vec::new();
    let mut heap: BinaryHeap<Reverse<(i64, u64)>> = BinaryHeap::new();

    for symbol in min_index ..= max_index {
        if frequencies[symbol] != 0 {
            let seq = freqs.len() as u64;
            freqs.push(frequencies[symbol]);
            trees.push(Some(Tree::Leaf(symbol)));
            heap.push(Reverse((frequencies[symbol], seq)));
        }
    }

    if heap.is_empty() {
        return Err(Error::invalid("huffman: no symbols to encode"));
    }

    while heap.len() > 1 {
        let Reverse((freq_a, seq_a)) = heap.pop().expect("heap has at least two elements");
        let Reverse((freq_b, seq_b)) = heap.pop().expect("heap has at least two elements");

        let tree_a = trees[seq_a as usize].take().expect("tree for seq_a not yet taken");
        let tree_b = trees[seq_b as usize].take().expect("tree for seq_b not yet taken");

        let merged_freq = freq_a + freq_b;
        let seq = freqs.len() as u64;
        freqs.push(merged_freq);
        trees.push(Some(Tree::Node(Box::new(tree_a), Box::new(tree_b))));
        heap.push(Reverse((merged_freq, seq)));
    }

    let Reverse((_, root_seq)) = heap.pop().expect("huffman tree has a root");
    let root = trees[root_seq as usize].take().expect("root tree not yet taken");

    let mut lengths = vec![0_i64; ENCODE_SIZE];
    let mut stack = vec![(root, 0_u32)];

    while let Some((node, depth)) = stack.pop() {
        match node {
            Tree::Leaf(symbol) => {
                let length = (depth.max(1)) as i64; // a single-symbol alphabet still needs a 1-bit code
                if length > MAX_CODE_LENGTH {
                    return Err(Error::invalid("huffman: code length exceeds limit"));
                }

                lengths[symbol] = length;
            },

            Tree::Node(left, right) => {
                stack.push((*left, depth + 1));
                stack.push((*right, depth + 1));
            },
        }
    }

    Ok(lengths)
}

/// Compute Huffman codes (based on `frequencies`) and store them back into
/// `frequencies`:
///	- code structure is : [63:lsb - 6:msb] | [5-0: bit length];
///	- max code length is 58 bits;
///	- codes outside the range [min_index, max_index] have a null length (unused values);
///	- original frequencies are destroyed;
///	- a pseudo-symbol with frequency 1 is reserved at `max_index` for run-length encoding.
fn build_encoding_table(frequencies: &mut [i64]) -> Result<(usize, usize)> {
    debug_assert_eq!(frequencies.len(), ENCODE_SIZE);

    let min_index = frequencies.iter().position(|&f| f != 0)
        .ok_or_else(|| Error::invalid("huffman: no symbols to encode"))?;

    let mut max_index = frequencies.iter().rposition(|&f| f != 0)
        .expect("min_index found implies a maximum exists");

    max_index += 1;
    if max_index >= ENCODE_SIZE {
        return Err(Error::invalid("huffman: symbol range overflow"));
    }

    frequencies[max_index] = 1; // reserved run-length pseudo-symbol

    let lengths = build_huffman_lengths(frequencies, min_index, max_index)?;

    for index in min_index ..= max_index {
        frequencies[index] = lengths[index];
    }

    canonical_table(frequencies);

    Ok((min_index, max_index))
}

// Build a "canonical" Huffman code table:
//	- for each (uncompressed) symbol, hcode contains the length
//	  of the corresponding code (in the compressed data)
//	- canonical codes are computed and stored in hcode
//	- the rules for constructing canonical codes are as follows:
//	  * shorter codes (if filled with zeroes to the right)
//	    have a numerically higher value than longer codes
//	  * for codes with the same length, numerical values
//	    increase with numerical symbol values
//	- because the canonical code table can be constructed from
//	  symbol lengths alone, the code table can be transmitted
//	  without sending the actual code values
//	- see http://www.compressconsult.com/huffman/
fn canonical_table(h_code: &mut [i64]) {
    debug_assert_eq!(h_code.len(), ENCODE_SIZE);

    let mut n = [ 0_i64; 59 ];

    for &code in h_code.iter() {
        n[code as usize] += 1;
    }

    let mut c = 0_i64;
    for n in &mut n.iter_mut().rev() {
        let nc = (c + *n) >> 1;
        *n = c;
        c = nc;
    }

    for code_i in h_code.iter_mut() {
        let l = *code_i;
        if l > 0 {
            *code_i = l | (n[l as usize] << 6);
            n[l as usize] += 1;
        }
    }
}

/// Run-length-packs the code lengths of `hcode[min_index ..= max_index]`
/// into `out`, encoding runs of zero-length (unused) symbols compactly
/// instead of transmitting every single zero.
fn pack_encoding_table(
    hcode: &[i64], min_index: usize, max_index: usize,
    c: &mut i64, lc: &mut i64, out: &mut Vec<u8>,
) {
    let mut index = min_index;

    while index <= max_index {
        let length = hcode[index];

        if length == 0 {
            let mut zero_run = 1_i64;

            while index < max_index && zero_run < LONGEST_LONG_RUN && hcode[index + 1] == 0 {
                zero_run += 1;
                index += 1;
            }

            if zero_run >= 2 {
                if zero_run >= SHORTEST_LONG_RUN {
                    write_bits(6, LONG_ZEROCODE_RUN, c, lc, &mut *out);
                    write_bits(8, zero_run - SHORTEST_LONG_RUN, c, lc, &mut *out);
                }
                else {
                    write_bits(6, SHORT_ZEROCODE_RUN + zero_run - 2, c, lc, &mut *out);
                }

                index += 1;
                continue;
            }
        }

        write_bits(6, length, c, lc, &mut *out);
        index += 1;
    }
}

/// Reverses `pack_encoding_table`, expanding zero-runs back into `hcode`.
/// Every length field read from the stream is bounds-checked before it is
/// used to advance the cursor or index into `hcode` - `packed` may be
/// corrupt, attacker-controlled chunk data.
fn unpack_encoding_table(packed: &[u8], min_index: usize, max_index: usize, hcode: &mut [i64]) -> Result<()> {
    let mut reader = packed;
    let mut c = 0_i64;
    let mut lc = 0_i64;
    let mut index = min_index;

    while index <= max_index {
        let length = read_bits(6, &mut c, &mut lc, &mut reader)?;

        if length >= SHORT_ZEROCODE_RUN {
            let zero_run = if length == LONG_ZEROCODE_RUN {
                read_bits(8, &mut c, &mut lc, &mut reader)? + SHORTEST_LONG_RUN
            }
            else {
                length - SHORT_ZEROCODE_RUN + 2
            };

            if zero_run < 0 || index as i64 + zero_run > max_index as i64 + 1 {
                return Err(Error::invalid("huffman table zero run exceeds table bounds"));
            }

            for value in &mut hcode[index .. index + zero_run as usize] {
                *value = 0;
            }

            index += zero_run as usize;
        }
        else {
            hcode[index] = length;
            index += 1;
        }
    }

    Ok(())
}

// === data encode/decode ===

/// Writes the Huffman code for `symbol` (a table index - the run-length
/// pseudo-symbol is encoded through this same path).
fn write_code_by_index(symbol: usize, hcode: &[i64], c: &mut i64, lc: &mut i64, out: &mut Vec<u8>) -> Result<()> {
    let entry = hcode[symbol];
    let code_length = entry & 63;
    let code_value = entry >> 6;

    if code_length == 0 {
        return Err(Error::invalid("huffman: symbol has no assigned code"));
    }

    write_bits(code_length, code_value, c, lc, &mut *out);
    Ok(())
}

/// Encodes `data` using the canonical codes in `hcode`, collapsing runs of
/// an identical value (up to 255 repeats) into one literal code followed by
/// the `run_length_symbol` code and an 8-bit repeat count.
fn encode_data(
    data: &[u16], hcode: &[i64], run_length_symbol: usize,
    c: &mut i64, lc: &mut i64, out: &mut Vec<u8>,
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let mut run_value = data[0];
    let mut run_length = 0_u32;

    for &value in &data[1 ..] {
        if value == run_value && run_length < 255 {
            run_length += 1;
        }
        else {
            write_code_by_index(run_value as usize, hcode, c, lc, out)?;

            if run_length > 0 {
                write_code_by_index(run_length_symbol, hcode, c, lc, out)?;
                write_bits(8, run_length as i64, c, lc, &mut *out);
            }

            run_value = value;
            run_length = 0;
        }
    }

    write_code_by_index(run_value as usize, hcode, c, lc, out)?;

    if run_length > 0 {
        write_code_by_index(run_length_symbol, hcode, c, lc, out)?;
        write_bits(8, run_length as i64, c, lc, &mut *out);
    }

    Ok(())
}

/// Maps `(code length, code value)` back to a table index, built once per
/// decompression from the unpacked canonical code table.
struct DecodeTable {
    by_length: Vec<HashMap<i64, usize>>, // indexed by code length, 1 ..= MAX_CODE_LENGTH
}

impl DecodeTable {
    fn build(hcode: &[i64], min_index: usize, max_index: usize) -> Result<Self> {
        let mut by_length: Vec<HashMap<i64, usize>> =
            (0 ..= MAX_CODE_LENGTH as usize).map(|_| HashMap::new()).collect();

        for symbol in min_index ..= max_index {
            let entry = hcode[symbol];
            let code_length = entry & 63;

            if code_length == 0 {
                continue;
            }

            if code_length > MAX_CODE_LENGTH {
                return Err(Error::invalid("huffman: corrupt code length in table"));
            }

            let code_value = entry >> 6;

            if by_length[code_length as usize].insert(code_value, symbol).is_some() {
                return Err(Error::invalid("huffman: duplicate code in table"));
            }
        }

        Ok(Self { by_length })
    }

    fn lookup(&self, code_length: i64, code_value: i64) -> Option<usize> {
        if code_length < 1 || code_length as usize >= self.by_length.len() {
            return None;
        }

        self.by_length[code_length as usize].get(&code_value).copied()
    }
}

/// Decodes `expected_value_count` values bit by bit, expanding run-length
/// pseudo-symbols into repeats of the previously decoded value.
fn decode_data(
    payload: &[u8], decode_table: &DecodeTable,
    run_length_symbol: usize, expected_value_count: usize,
) -> Result<Vec<u16>> {
    let mut out = Vec::with_capacity(expected_value_count);
    let mut reader = payload;
    let mut c = 0_i64;
    let mut lc = 0_i64;
    let mut code_accumulator = 0_i64;
    let mut code_length = 0_i64;
    let mut last_value: Option<u16> = None;

    while out.len() < expected_value_count {
        let bit = read_bits(1, &mut c, &mut lc, &mut reader)?;
        code_accumulator = (code_accumulator << 1) | bit;
        code_length += 1;

        if code_length > MAX_CODE_LENGTH {
            return Err(Error::invalid("huffman: no matching code in compressed stream"));
        }

        if let Some(symbol) = decode_table.lookup(code_length, code_accumulator) {
            if symbol == run_length_symbol {
                let repeat_count = read_bits(8, &mut c, &mut lc, &mut reader)? as usize;
                let value = last_value
                    .ok_or_else(|| Error::invalid("huffman: run-length code before any value"))?;

                if out.len() + repeat_count > expected_value_count {
                    return Err(Error::invalid("huffman: run length exceeds expected output size"));
                }

                out.extend(std::iter::repeat(value).take(repeat_count));
            }
            else {
                let value = u16::try_from(symbol)
                    .map_err(|_| Error::invalid("huffman: decoded symbol out of range"))?;

                out.push(value);
                last_value = Some(value);
            }

            code_accumulator = 0;
            code_length = 0;
        }
    }

    Ok(out)
}

// === bit-level primitives ===

/// Appends the low `count` bits of `bits` to the bit accumulator `c`/`lc`,
/// flushing completed bytes to `out`. `out` is always an in-memory `Vec<u8>`
/// in this module, so the write can never actually fail.
fn write_bits(count: i64, bits: i64, c: &mut i64, lc: &mut i64, mut out: impl std::io::Write) {
    *c = *c << count;
    *lc += count;

    *c = *c | bits;

    while *lc >= 8 {
        *lc -= 8;
        out.write_all(&[ (*c >> *lc) as u8 ]).expect("writing to an in-memory buffer cannot fail");
    }
}

/// Pads the bit accumulator out to a full byte (if any bits remain buffered)
/// and resets it, so a following section starts at a byte boundary.
fn flush_remaining_bits(c: &mut i64, lc: &mut i64, out: &mut Vec<u8>) {
    if *lc > 0 {
        out.push(((*c << (8 - *lc)) & 0xff) as u8);
    }

    *c = 0;
    *lc = 0;
}

/// Reads `count` bits from the front of `read`, returning a typed error
/// instead of panicking once the stream runs out - `read` walks untrusted,
/// potentially truncated chunk bytes.
fn read_bits(count: i64, c: &mut i64, lc: &mut i64, mut read: impl Read) -> Result<i64> {
    while *lc < count {
        let byte = u8::read(&mut read)
            .map_err(|_| Error::invalid("huffman: unexpected end of compressed data"))?;

        *c = (*c << 8) | (byte as i64);
        *lc += 8;
    }

    *lc -= count;
    Ok((*c >> *lc) & ((1 << count) - 1))
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(values: &[u16]) {
        let compressed = compress(values).unwrap();
        let decompressed = decompress(&compressed, values.len()).unwrap();
        assert_eq!(values, decompressed.as_slice());
    }

    #[test]
    fn roundtrip_empty() {
        roundtrip(&[]);
    }

    #[test]
    fn roundtrip_single_value() {
        roundtrip(&[42]);
    }

    #[test]
    fn roundtrip_constant_run() {
        roundtrip(&[7; 1000]);
    }

    #[test]
    fn roundtrip_two_symbols() {
        let values: Vec<u16> = (0 .. 500).map(|i| if i % 2 == 0 { 1 } else { 65000 }).collect();
        roundtrip(&values);
    }

    #[test]
    fn roundtrip_random_values() {
        use rand::{Rng, SeedableRng};
        use rand::rngs::StdRng;

        let mut rng = StdRng::seed_from_u64(9);
        let values: Vec<u16> = (0 .. 10_000).map(|_| rng.gen()).collect();
        roundtrip(&values);
    }

    #[test]
    fn roundtrip_with_long_runs_and_unique_values() {
        use rand::{Rng, SeedableRng};
        use rand::rngs::StdRng;

        let mut rng = StdRng::seed_from_u64(99);
        let mut values = Vec::new();

        for _ in 0 .. 50 {
            let run_length = rng.gen_range(1 ..= 300);
            let value: u16 = rng.gen();
            values.extend(std::iter::repeat(value).take(run_length));
        }

        roundtrip(&values);
    }

    #[test]
    fn decompress_rejects_truncated_header() {
        assert!(decompress(&[0, 1, 2], 10).is_err());
    }

    #[test]
    fn decompress_rejects_table_length_past_end() {
        let mut broken = vec![0_u8; 12];
        broken[8] = 0xff; broken[9] = 0xff; broken[10] = 0xff; broken[11] = 0xff; // huge table_len
        assert!(decompress(&broken, 4).is_err());
    }
}
