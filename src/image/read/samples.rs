//! How to read samples (a grid of `f32`, `f16` or `u32` values) into a flat, non-deep storage.

use crate::block::chunk::TileCoordinates;
use crate::block::lines::LineRef;
use crate::error::{Result, UnitResult};
use crate::image::read::any_channels::{ReadSamples, SamplesReader};
use crate::image::read::levels::{ReadAllLevels, ReadLargestLevel, ReadSamplesLevel};
use crate::image::FlatSamples;
use crate::math::Vec2;
use crate::meta::attribute::ChannelDescription;
use crate::meta::header::Header;
use half::f16;

/// Specify to read only flat, non-deep samples. Does not support deep pixel data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReadFlatSamples;

impl ReadFlatSamples {
    /// Read all contained resolution levels from the image, if any.
    pub fn all_resolution_levels(self) -> ReadAllLevels<Self> { ReadAllLevels { read_samples: self } }

    /// Read only the highest resolution level, skipping all smaller variations.
    pub fn largest_resolution_level(self) -> ReadLargestLevel<Self> { ReadLargestLevel { read_samples: self } }
}

/// A temporary reader that accumulates all samples of a single channel into a flat vector.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatSamplesReader {
    resolution: Vec2<usize>, // pixels, of the current resolution level
    samples: FlatSamples,
}

impl ReadSamples for ReadFlatSamples {
    type Reader = FlatSamplesReader;

    fn create_sample_reader(&self, header: &Header, channel: &ChannelDescription) -> Result<Self::Reader> {
        let resolution = header.layer_size / channel.sampling;
        Ok(FlatSamplesReader::new(resolution, channel.sample_type))
    }
}

impl ReadSamplesLevel for ReadFlatSamples {
    type Reader = FlatSamplesReader;

    fn create_samples_level_reader(&self, _header: &Header, channel: &ChannelDescription, _level: Vec2<usize>, resolution: Vec2<usize>) -> Result<Self::Reader> {
        Ok(FlatSamplesReader::new(resolution, channel.sample_type))
    }
}

impl FlatSamplesReader {
    fn new(resolution: Vec2<usize>, sample_type: crate::meta::attribute::SampleType) -> Self {
        let sample_count = resolution.area();

        let samples = match sample_type {
            crate::meta::attribute::SampleType::F16 => FlatSamples::F16(vec![f16::ZERO; sample_count]),
            crate::meta::attribute::SampleType::F32 => FlatSamples::F32(vec![0.0; sample_count]),
            crate::meta::attribute::SampleType::U32 => FlatSamples::U32(vec![0; sample_count]),
        };

        FlatSamplesReader { resolution, samples }
    }
}

impl SamplesReader for FlatSamplesReader {
    type Samples = FlatSamples;

    fn is_block_desired(&self, _tile: TileCoordinates) -> bool {
        true
    }

    fn read_line(&mut self, line: LineRef<'_>) -> UnitResult {
        let image_width = self.resolution.width();
        debug_assert_ne!(image_width, 0, "image width calculation bug");

        let start_index = line.location.position.y() * image_width + line.location.position.x();
        let end_index = start_index + line.location.sample_count;

        debug_assert!(
            start_index < end_index && end_index <= self.samples.len(),
            "for resolution {:?}, this is an invalid line: {:?}",
            self.resolution, line.location
        );

        match &mut self.samples {
            FlatSamples::F16(samples) => line.read_samples_into_slice(&mut samples[start_index..end_index]),
            FlatSamples::F32(samples) => line.read_samples_into_slice(&mut samples[start_index..end_index]),
            FlatSamples::U32(samples) => line.read_samples_into_slice(&mut samples[start_index..end_index]),
        }
    }

    fn into_samples(self) -> Self::Samples {
        debug_assert_eq!(self.samples.len(), self.resolution.area(), "sample count does not match resolution");
        self.samples
    }
}
