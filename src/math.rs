
// calculations inspired by
// https://github.com/AcademySoftwareFoundation/openexr/blob/master/OpenEXR/IlmImf/ImfTiledMisc.cpp


/// computes floor(log(x)/log(2))
pub fn floor_log_2(mut number: u32) -> u32 {
    debug_assert_ne!(number, 0);

    let mut log = 0;

//     TODO check if this unrolls properly?
    while number > 1 {
        log += 1;
        number >>= 1;
    }

    log
}


/// computes ceil(log(x)/log(2))
// taken from https://github.com/openexr/openexr/blob/master/OpenEXR/IlmImf/ImfTiledMisc.cpp
pub fn ceil_log_2(mut number: u32) -> u32 {
    debug_assert_ne!(number, 0);

    let mut log = 0;
    let mut round_up = 0;

    // TODO check if this unrolls properly
    while number > 1 {
        if number & 1 != 0 {
            round_up = 1;
        }

        log +=  1;
        number >>= 1;
    }

    log + round_up
}



#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoundingMode {
    Down, Up,
}

impl RoundingMode {
    pub fn log2(self, number: u32) -> u32 {
        match self {
            RoundingMode::Down => self::floor_log_2(number),
            RoundingMode::Up => self::ceil_log_2(number),
        }
    }

    pub fn divide(self, dividend: u32, divisor: u32) -> u32 {
        match self {
            RoundingMode::Up => (dividend + divisor - 1) / divisor, // only works for positive numbers
            RoundingMode::Down => dividend / divisor,
        }
    }
}

pub fn compute_tile_count(full_res: u32, tile_size: u32) -> u32 {
    // round up, because if the image is not evenly divisible by the tiles,
    // we add another tile at the end (which is only partially used)
    RoundingMode::Up.divide(full_res, tile_size)
}


// TODO this should be cached? log2 may be very expensive
pub fn compute_level_count(round: RoundingMode, full_res: u32) -> u32 {
    round.log2(full_res) + 1
}

pub fn compute_level_size(round: RoundingMode, full_res: u32, level_index: u32) -> u32 {
    round.divide(full_res,  1 << level_index).max(1)
}

// TODO cache these?
// TODO compute these directly instead of summing up an iterator?
pub fn rip_map_resolutions(round: RoundingMode, max_resolution: (u32, u32)) -> impl Iterator<Item=(u32, u32)> {
    let (w, h) = (compute_level_count(round, max_resolution.0), compute_level_count(round, max_resolution.1));

    (0..w) // TODO test this
        .flat_map(move |x_level|{ // FIXME may swap y and x order?
            (0..h).map(move |y_level| {
                // TODO progressively divide instead??
                let width = compute_level_size(round, max_resolution.0, x_level);
                let height = compute_level_size(round, max_resolution.1, y_level);
                (width, height)
            })
        })
}

// TODO cache all these level values when computing table offset size??
// TODO compute these directly instead of summing up an iterator?
pub fn mip_map_resolutions(round: RoundingMode, max_resolution: (u32, u32)) -> impl Iterator<Item=(u32, u32)> {
    (0..compute_level_count(round, max_resolution.0.max(max_resolution.1)))
        .map(move |level|{
            // TODO progressively divide instead??
            let width = compute_level_size(round, max_resolution.0, level);
            let height = compute_level_size(round, max_resolution.1, level);
            (width, height)
        })
}


use std::ops::{Add, Sub, Mul, Div};
use std::convert::TryFrom;
use crate::error::usize_to_i32;

/// A 2D vector, usually either a position or a size.
/// Does not support arithmetic operations that would mix different scalar types,
/// use `to_i32` or `to_usize` to convert between axes-typed vectors explicitly.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Vec2<T>(pub T, pub T);

impl<T: Copy> Vec2<T> {

    /// The horizontal component of this vector.
    pub fn x(self) -> T { self.0 }

    /// The vertical component of this vector.
    pub fn y(self) -> T { self.1 }

    /// Interpret this vector as a size: the horizontal extent.
    pub fn width(self) -> T { self.0 }

    /// Interpret this vector as a size: the vertical extent.
    pub fn height(self) -> T { self.1 }
}

impl Vec2<usize> {

    /// The number of pixels covered by a rectangle of this size.
    pub fn area(self) -> usize { self.0 * self.1 }

    /// Convert to a signed vector. Panics if any component exceeds `i32::MAX`.
    pub fn to_i32(self) -> Vec2<i32> {
        Vec2(usize_to_i32(self.0), usize_to_i32(self.1))
    }

    /// Flatten a 2D pixel position within a row of the given width into a linear index.
    pub fn flatten_for_width(self, width: usize) -> usize {
        self.1 * width + self.0
    }
}

impl Vec2<i32> {

    /// The signed area, may be negative if width or height is negative.
    pub fn area(self) -> i64 { self.0 as i64 * self.1 as i64 }

    /// Convert to an unsigned vector, rejecting negative components with `error_message`.
    pub fn to_usize(self, error_message: &'static str) -> crate::error::Result<Vec2<usize>> {
        Ok(Vec2(
            crate::error::i32_to_usize(self.0, error_message)?,
            crate::error::i32_to_usize(self.1, error_message)?,
        ))
    }
}

impl<T: Add<Output = T>> Add for Vec2<T> {
    type Output = Vec2<T>;
    fn add(self, other: Vec2<T>) -> Vec2<T> { Vec2(self.0 + other.0, self.1 + other.1) }
}

impl<T: Sub<Output = T>> Sub for Vec2<T> {
    type Output = Vec2<T>;
    fn sub(self, other: Vec2<T>) -> Vec2<T> { Vec2(self.0 - other.0, self.1 - other.1) }
}

impl<T: Mul<Output = T> + Copy> Mul<T> for Vec2<T> {
    type Output = Vec2<T>;
    fn mul(self, scalar: T) -> Vec2<T> { Vec2(self.0 * scalar, self.1 * scalar) }
}

impl<T: Div<Output = T> + Copy> Div<T> for Vec2<T> {
    type Output = Vec2<T>;
    fn div(self, scalar: T) -> Vec2<T> { Vec2(self.0 / scalar, self.1 / scalar) }
}

impl<T> From<(T, T)> for Vec2<T> {
    fn from((x, y): (T, T)) -> Self { Vec2(x, y) }
}

impl<T: Copy> From<Vec2<T>> for (T, T) {
    fn from(value: Vec2<T>) -> Self { (value.0, value.1) }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Vec2<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "({:?}, {:?})", self.0, self.1)
    }
}

impl<T: std::fmt::Display> std::fmt::Display for Vec2<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "({}, {})", self.0, self.1)
    }
}

/// Floor division that also works for negative `x`, as required when locating
/// the nearest sampled pixel for a subsampled channel left of the data window.
pub fn div_p(x: i32, y: usize) -> i32 {
    let y = y as i32;
    if x >= 0 {
        if y >= 0 { x / y } else { -(x / -y) }
    }
    else {
        if y >= 0 { -((y - 1 - x) / y) } else { (-y - 1 - x) / -y }
    }
}

/// The remainder counterpart of `div_p`.
pub fn mod_p(x: i32, y: usize) -> i32 {
    x - y as i32 * div_p(x, y)
}

/// Number of sampled pixels a subsampled channel has between `min` and `max`, inclusive.
/// A `sampling` of 1 means every pixel is sampled.
pub fn num_samples(sampling: usize, min: i32, max: i32) -> usize {
    if max < min { return 0; }

    let mut first = div_p(min, sampling) * sampling as i32;
    if mod_p(min, sampling) != 0 { first += sampling as i32; }

    if first > max { 0 }
    else { ((max - first) / sampling as i32) as usize + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_2_matches_reference_values() {
        assert_eq!(floor_log_2(1), 0);
        assert_eq!(floor_log_2(2), 1);
        assert_eq!(floor_log_2(255), 7);
        assert_eq!(floor_log_2(256), 8);

        assert_eq!(ceil_log_2(1), 0);
        assert_eq!(ceil_log_2(2), 1);
        assert_eq!(ceil_log_2(255), 8);
        assert_eq!(ceil_log_2(256), 8);
    }

    #[test]
    fn level_count_matches_reference() {
        assert_eq!(compute_level_count(RoundingMode::Down, 256), 9);
        assert_eq!(compute_level_count(RoundingMode::Down, 1), 1);
        assert_eq!(compute_level_count(RoundingMode::Up, 5), 4);
    }

    #[test]
    fn level_size_never_drops_below_one_pixel() {
        assert_eq!(compute_level_size(RoundingMode::Down, 1, 0), 1);
        assert_eq!(compute_level_size(RoundingMode::Down, 256, 8), 1);
        assert_eq!(compute_level_size(RoundingMode::Up, 5, 2), 2);
    }

    #[test]
    fn tile_count_rounds_up() {
        assert_eq!(compute_tile_count(65, 32), 3);
        assert_eq!(compute_tile_count(64, 32), 2);
        assert_eq!(compute_tile_count(1, 32), 1);
    }

    #[test]
    fn mip_map_resolutions_halve_until_one() {
        let levels: Vec<_> = mip_map_resolutions(RoundingMode::Down, (256, 128)).collect();
        assert_eq!(levels.first(), Some(&(256, 128)));
        assert_eq!(levels.last(), Some(&(1, 1)));
        assert_eq!(levels.len(), 9);
    }

    #[test]
    fn rip_map_resolutions_cover_full_grid() {
        let levels: Vec<_> = rip_map_resolutions(RoundingMode::Down, (64, 32)).collect();
        // 7 horizontal levels (64..1) times 6 vertical levels (32..1)
        assert_eq!(levels.len(), 7 * 6);
        assert!(levels.contains(&(64, 32)));
        assert!(levels.contains(&(1, 1)));
    }

    #[test]
    fn div_p_and_mod_p_agree_with_euclidean_identity() {
        for x in -20 ..= 20 {
            for y in 1_usize ..= 5 {
                let q = div_p(x, y);
                let r = mod_p(x, y);
                assert_eq!(q * y as i32 + r, x);
                assert!(r >= 0 && r < y as i32);
            }
        }
    }

    #[test]
    fn num_samples_counts_subsampled_pixels() {
        // every pixel sampled: count equals the inclusive range length
        assert_eq!(num_samples(1, 0, 9), 10);

        // subsampling by 2 over a 10-wide range starting at an even coordinate
        assert_eq!(num_samples(2, 0, 9), 5);

        // an empty range never samples anything
        assert_eq!(num_samples(1, 5, 4), 0);

        // a negative-origin data window still lands on the correct sampled pixels
        assert_eq!(num_samples(2, -4, 3), 4);
    }

    #[test]
    fn vec2_area_and_conversions() {
        assert_eq!(Vec2(4_usize, 5_usize).area(), 20);
        assert_eq!(Vec2(3_i32, -2_i32).area(), -6);
        assert_eq!(Vec2(3_usize, 4_usize).to_i32(), Vec2(3, 4));
        assert_eq!(Vec2(3_i32, 4_i32).to_usize("negative").unwrap(), Vec2(3, 4));
        assert!(Vec2(-1_i32, 4_i32).to_usize("negative").is_err());
    }
}
