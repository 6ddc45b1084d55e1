use super::*;
use super::optimize_bytes::*;
use super::Error;
use super::Result;

// inspired by  https://github.com/openexr/openexr/blob/master/OpenEXR/IlmImf/ImfRle.cpp

const MIN_RUN_LENGTH : usize = 3;
const MAX_RUN_LENGTH : usize = 127;


pub fn decompress_bytes(compressed: Bytes<'_>, expected_byte_size: usize, pedantic: bool) -> Result<ByteVec> {
    let mut remaining = compressed;
    let mut decompressed = Vec::with_capacity(expected_byte_size.min(8*2048));

    while !remaining.is_empty() && decompressed.len() != expected_byte_size {
        let count = take_1(&mut remaining)? as i8 as i32;

        if count < 0 {
            // take the next '-count' bytes as-is
            let values = take_n(&mut remaining, (-count) as usize)?;
            decompressed.extend_from_slice(values);
        }
        else {
            // repeat the next value 'count + 1' times
            let value = take_1(&mut remaining)?;
            decompressed.resize(decompressed.len() + count as usize + 1, value);
        }
    }

    if pedantic && !remaining.is_empty() {
        return Err(Error::invalid("data amount"));
    }

    differences_to_samples(&mut decompressed);
    interleave_byte_blocks(&mut decompressed);
    Ok(decompressed)
}

pub fn compress_bytes(uncompressed: Bytes<'_>) -> Result<ByteVec> {
    // see https://github.com/AcademySoftwareFoundation/openexr/blob/3bd93f85bcb74c77255f28cdbb913fdbfbb39dfe/OpenEXR/IlmImf/ImfTiledOutputFile.cpp#L750-L842
    let mut data = Vec::from(uncompressed);

    separate_bytes_fragments(&mut data);
    samples_to_differences(&mut data);

    let mut compressed = Vec::with_capacity(data.len());
    let mut run_start = 0;
    let mut run_end = 1;

    while run_start < data.len() {
        while
            run_end < data.len()
                && data[run_start] == data[run_end]
                && (run_end - run_start) as i32 - 1 < MAX_RUN_LENGTH as i32
            {
                run_end += 1;
            }

        if run_end - run_start >= MIN_RUN_LENGTH {
            compressed.push(((run_end - run_start) as i32 - 1) as u8);
            compressed.push(data[run_start]);
            run_start = run_end;

        } else {
            while
                run_end < data.len() && (
                    (run_end + 1 >= data.len() || data[run_end] != data[run_end + 1])
                        || (run_end + 2 >= data.len() || data[run_end + 1] != data[run_end + 2])
                ) && run_end - run_start < MAX_RUN_LENGTH
                {
                    run_end += 1;
                }

            compressed.push((run_start as i32 - run_end as i32) as u8);
            compressed.extend_from_slice(&data[run_start .. run_end]);

            run_start = run_end;
            run_end += 1;
        }
    }

    Ok(compressed)
}

fn take_1(slice: &mut &[u8]) -> Result<u8> {
    if !slice.is_empty() {
        let result = slice[0];
        *slice = &slice[1..];
        Ok(result)

    } else {
        Err(Error::invalid("compressed data"))
    }
}

fn take_n<'s>(slice: &mut &'s [u8], n: usize) -> Result<&'s [u8]> {
    if n <= slice.len() {
        let (front, back) = slice.split_at(n);
        *slice = back;
        Ok(front)

    } else {
        Err(Error::invalid("compressed data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn roundtrip_random_bytes() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut original = vec![0_u8; 2000];
        for b in original.iter_mut() { *b = rng.gen(); }

        let compressed = compress_bytes(&original).unwrap();
        let decompressed = decompress_bytes(&compressed, original.len(), true).unwrap();
        assert_eq!(original, decompressed);
    }

    #[test]
    fn roundtrip_flat_runs() {
        let original = vec![42_u8; 513];
        let compressed = compress_bytes(&original).unwrap();
        let decompressed = decompress_bytes(&compressed, original.len(), true).unwrap();
        assert_eq!(original, decompressed);

        // large constant runs should compress significantly smaller than the input
        assert!(compressed.len() < original.len() / 2);
    }

    #[test]
    fn roundtrip_empty() {
        let compressed = compress_bytes(&[]).unwrap();
        let decompressed = decompress_bytes(&compressed, 0, true).unwrap();
        assert!(decompressed.is_empty());
    }

    #[test]
    fn non_pedantic_ignores_trailing_garbage() {
        let original = vec![1_u8, 2, 3, 4, 5, 6, 7, 8];
        let mut compressed = compress_bytes(&original).unwrap();
        compressed.extend_from_slice(&[0xFF, 0xFF]);

        // pedantic mode rejects leftover bytes once the expected size is reached
        assert!(decompress_bytes(&compressed, original.len(), true).is_err());
        // non-pedantic mode stops as soon as it has enough bytes
        let decompressed = decompress_bytes(&compressed, original.len(), false).unwrap();
        assert_eq!(original, decompressed);
    }
}
