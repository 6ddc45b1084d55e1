
// see https://github.com/openexr/openexr/blob/master/OpenEXR/IlmImf/ImfCompressor.cpp


//! compresses 16 scan lines at once or
//! compresses 1 single scan line at once

use super::*;
use super::optimize_bytes::*;

use crate::error::Result;

// scanline decompression routine, see https://github.com/openexr/openexr/blob/master/OpenEXR/IlmImf/ImfScanLineInputFile.cpp
// 1. Uncompress the data, if necessary (If the line is uncompressed, it's in XDR format, regardless of the compressor's output format.)
// 3. Convert one scan line's worth of pixel data back from the machine-independent representation
// 4. Fill the frame buffer with pixel data, respective to sampling and whatnot

const ZLIB_COMPRESSION_LEVEL: u8 = 4;

pub fn decompress_bytes(data: Bytes<'_>, expected_byte_size: usize) -> Result<ByteVec> {
    let options = zune_inflate::DeflateOptions::default().set_size_hint(expected_byte_size);
    let mut decoder = zune_inflate::DeflateDecoder::new_with_options(data, options);

    let mut decompressed = decoder.decode_zlib()
        .map_err(|_| Error::invalid("zip-compressed data malformed"))?;

    differences_to_samples(&mut decompressed);
    interleave_byte_blocks(&mut decompressed);
    Ok(decompressed)
}

pub fn compress_bytes(packed: Bytes<'_>) -> Result<ByteVec> {
    let mut packed = Vec::from(packed); // TODO no alloc
    separate_bytes_fragments(&mut packed);
    samples_to_differences(&mut packed);

    Ok(miniz_oxide::deflate::compress_to_vec_zlib(&packed, ZLIB_COMPRESSION_LEVEL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn roundtrip_random_bytes() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut original = vec![0_u8; 4096];
        for b in original.iter_mut() { *b = rng.gen(); }

        let compressed = compress_bytes(&original).unwrap();
        let decompressed = decompress_bytes(&compressed, original.len()).unwrap();
        assert_eq!(original, decompressed);
    }

    #[test]
    fn roundtrip_flat_data_compresses_well() {
        let original = vec![7_u8; 4096];
        let compressed = compress_bytes(&original).unwrap();
        let decompressed = decompress_bytes(&compressed, original.len()).unwrap();
        assert_eq!(original, decompressed);
        assert!(compressed.len() < original.len() / 4);
    }

    #[test]
    fn roundtrip_empty() {
        let compressed = compress_bytes(&[]).unwrap();
        let decompressed = decompress_bytes(&compressed, 0).unwrap();
        assert!(decompressed.is_empty());
    }
}
