//! DWAA/DWAB compression (Industrial Light & Magic / OpenEXR).

mod all;

pub(crate) use all::{compress, decompress};
