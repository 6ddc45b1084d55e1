//! Read and write OpenEXR images.
//!
//! This library uses no unsafe code. Decompression and compression of pixel blocks
//! happens on multiple threads in parallel, by default.
//!
//! To read or write an exr file, start with [`image::read`] or [`image::write`].
//! See also the `prelude` module for the most commonly used types.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,
)]

#![deny(
    unused_variables,
    unused_assignments,
    dead_code,
    unused_must_use,
    missing_copy_implementations,
    trivial_numeric_casts,
    redundant_semicolon
)]

#![forbid(unsafe_code)]

// TODO #![warn(missing_docs)]

pub mod io; // public to allow for custom attribute byte parsing

pub mod math;
pub mod block;
pub mod compression;
pub mod meta;
pub mod image;
pub mod error;

#[macro_use]
extern crate smallvec;

/// Re-exports of all modules and types commonly required for reading or writing an exr image.
pub mod prelude {

    // main export, the core data type
    pub use crate::image::*;

    // methods for actually reading images
    pub use crate::image::read::{
        read, ReadBuilder,
        read_all_data_from_file, read_all_flat_layers_from_file, read_first_flat_layer_from_file
    };
    pub use crate::image::read::image::{ReadImage, ReadLayers, LayersReader};
    pub use crate::image::read::layers::ReadChannels;
    pub use crate::image::read::any_channels::ReadSamples;
    pub use crate::image::read::levels::ReadSamplesLevel;
    pub use crate::image::read::samples::ReadFlatSamples;
    pub use crate::image::read::specific_channels::ReadSpecificChannel;

    // methods for actually writing images
    pub use crate::image::write::WritableImage;
    pub use crate::image::write::layers::WritableLayers;
    pub use crate::image::write::channels::WritableChannels;

    // exr meta data, attributes and compression
    pub use crate::meta::{MetaData, Headers};
    pub use crate::meta::header::{Header, ImageAttributes, LayerAttributes};
    pub use crate::meta::attribute::{
        AttributeValue, Text, TimeCode, BlockType, DataWindow, DisplayWindow,
        Rational, Matrix3x3, Matrix4x4, IntegerBounds, FloatRect, ChannelList,
        ChannelInfo, ChannelDescription, SampleType, Chromaticities, EnvironmentMap,
        KeyCode, LineOrder, Preview, TileDescription, LevelMode,
    };
    pub use crate::compression::Compression;

    // low level, block based access to the file
    pub use crate::block::{UncompressedBlock, BlockIndex};
    pub use crate::block::samples::Sample;

    // re-export external stuff that is exposed in our own api
    pub use half::f16;
    pub use smallvec::SmallVec;

    // error and math types required by almost any use of this library
    pub use crate::error::{Error, Result, UnitResult};
    pub use crate::math::Vec2;
}
