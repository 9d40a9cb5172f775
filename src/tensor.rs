//! Dense 3-D volumes
//!
//! A [`Volume`] is the numeric substrate of the engine: a `width × height × depth` block of
//! `f64` values stored depth-fastest, then column, then row:
//!
//! ```text
//! index(i, j, d) = i * width * depth + j * depth + d
//! ```
//!
//! where `i` is the row (`0..height`), `j` the column (`0..width`) and `d` the channel.
//! The element count of a volume never changes after construction; [`Volume::reshape`] only
//! reinterprets the dimensions.

use crate::error::{Error, Result};
use crate::serialization::{write_values, TokenReader};
use crate::utils::rng::EngineRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::ops::{Index, IndexMut};

/// Spatial dimensions of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Shape {
    /// Largest element count a single volume may hold.
    pub const MAX_LEN: usize = 1 << 28;

    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Shape of a flat feature vector (`1 × 1 × len`).
    pub const fn flat(len: usize) -> Self {
        Self::new(1, 1, len)
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.width * self.height * self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element count, or `None` if it does not fit in a `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        self.width
            .checked_mul(self.height)
            .and_then(|n| n.checked_mul(self.depth))
    }

    /// Fails unless every dimension is at least one and the element count is at most
    /// [`Shape::MAX_LEN`].
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(Error::DimensionMismatch(format!(
                "volume dimensions must be >= 1, got {}",
                self
            )));
        }
        match self.checked_len() {
            Some(len) if len <= Self::MAX_LEN => Ok(()),
            _ => Err(Error::DimensionMismatch(format!(
                "volume {} exceeds {} elements",
                self,
                Self::MAX_LEN
            ))),
        }
    }

    pub(crate) fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write!(out, "{} {} {}", self.width, self.height, self.depth)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

/// Dense 3-D array with depth-fastest layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: Shape,
    data: Vec<f64>,
}

impl Volume {
    /// Zero-filled volume.
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self::zeros(Shape::new(width, height, depth))
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Shape, value: f64) -> Self {
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    /// Wraps existing data; the length must match the shape.
    pub fn from_vec(shape: Shape, data: Vec<f64>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(Error::DimensionMismatch(format!(
                "shape {} needs {} values, got {}",
                shape,
                shape.len(),
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Flat `1 × 1 × n` volume holding `values`.
    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            shape: Shape::flat(values.len()),
            data: values.to_vec(),
        }
    }

    /// Builds a volume from row-major planes, one plane per channel.
    ///
    /// `planes[d][i * width + j]` becomes element `(i, j, d)`.
    pub fn from_planes(width: usize, height: usize, planes: &[Vec<f64>]) -> Result<Self> {
        let mut volume = Volume::new(width, height, planes.len());
        for (d, plane) in planes.iter().enumerate() {
            if plane.len() != width * height {
                return Err(Error::DimensionMismatch(format!(
                    "plane {} has {} values, expected {}",
                    d,
                    plane.len(),
                    width * height
                )));
            }
            for i in 0..height {
                for j in 0..width {
                    volume.set(i, j, d, plane[i * width + j]);
                }
            }
        }
        Ok(volume)
    }

    /// Row-major copy of channel `d`.
    pub fn plane(&self, d: usize) -> Vec<f64> {
        let mut plane = Vec::with_capacity(self.shape.width * self.shape.height);
        for i in 0..self.shape.height {
            for j in 0..self.shape.width {
                plane.push(self.get(i, j, d));
            }
        }
        plane
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn width(&self) -> usize {
        self.shape.width
    }

    pub fn height(&self) -> usize {
        self.shape.height
    }

    pub fn depth(&self) -> usize {
        self.shape.depth
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Flat offset of element `(i, j, d)`.
    #[inline]
    pub fn offset(&self, i: usize, j: usize, d: usize) -> usize {
        debug_assert!(i < self.shape.height && j < self.shape.width && d < self.shape.depth);
        (i * self.shape.width + j) * self.shape.depth + d
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, d: usize) -> f64 {
        self.data[self.offset(i, j, d)]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, d: usize, value: f64) {
        let idx = self.offset(i, j, d);
        self.data[idx] = value;
    }

    #[inline]
    pub fn add(&mut self, i: usize, j: usize, d: usize, value: f64) {
        let idx = self.offset(i, j, d);
        self.data[idx] += value;
    }

    /// Reinterprets the dimensions without moving any data.
    pub fn reshape(&mut self, width: usize, height: usize, depth: usize) -> Result<()> {
        let shape = Shape::new(width, height, depth);
        if shape.checked_len() != Some(self.data.len()) {
            return Err(Error::DimensionMismatch(format!(
                "cannot reshape {} ({} elements) into {}",
                self.shape,
                self.data.len(),
                shape
            )));
        }
        self.shape = shape;
        Ok(())
    }

    /// Consuming variant of [`Volume::reshape`].
    pub fn reshaped(mut self, shape: Shape) -> Result<Self> {
        self.reshape(shape.width, shape.height, shape.depth)?;
        Ok(self)
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    pub fn zero(&mut self) {
        self.fill(0.0);
    }

    /// Fills with draws from `N(mean, std_dev²)` taken from the caller's generator.
    pub fn randomize(&mut self, rng: &mut EngineRng, mean: f64, std_dev: f64) {
        for value in self.data.iter_mut() {
            *value = rng.gaussian(mean, std_dev);
        }
    }

    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f64
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .data
            .iter()
            .map(|&v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.data.len() as f64;
        var.sqrt()
    }

    /// Index of the largest element (first one on ties).
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (idx, &v) in self.data.iter().enumerate() {
            if v > self.data[best] {
                best = idx;
            }
        }
        best
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &Volume) {
        assert_eq!(
            self.data.len(),
            other.data.len(),
            "add_assign length mismatch: {} vs {}",
            self.shape,
            other.shape
        );
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    /// Element-wise `self *= other`.
    pub fn mul_assign(&mut self, other: &Volume) {
        assert_eq!(
            self.data.len(),
            other.data.len(),
            "mul_assign length mismatch: {} vs {}",
            self.shape,
            other.shape
        );
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a *= b;
        }
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Copy of channels `start..start + count`.
    pub fn slice_depth(&self, start: usize, count: usize) -> Volume {
        assert!(
            start + count <= self.shape.depth,
            "depth slice {}..{} out of range for {}",
            start,
            start + count,
            self.shape
        );
        let mut out = Volume::new(self.shape.width, self.shape.height, count);
        for i in 0..self.shape.height {
            for j in 0..self.shape.width {
                let src = self.offset(i, j, start);
                let dst = out.offset(i, j, 0);
                out.data[dst..dst + count].copy_from_slice(&self.data[src..src + count]);
            }
        }
        out
    }

    /// Concatenates volumes of equal spatial size along depth.
    pub fn concat_depth(parts: &[&Volume]) -> Volume {
        assert!(!parts.is_empty(), "concat_depth needs at least one volume");
        let (width, height) = (parts[0].width(), parts[0].height());
        let depth: usize = parts.iter().map(|p| p.depth()).sum();
        let mut out = Volume::new(width, height, depth);
        let mut start = 0;
        for part in parts {
            assert!(
                part.width() == width && part.height() == height,
                "concat_depth spatial mismatch: {} vs {}x{}",
                part.shape,
                width,
                height
            );
            for i in 0..height {
                for j in 0..width {
                    let src = part.offset(i, j, 0);
                    let dst = out.offset(i, j, start);
                    out.data[dst..dst + part.depth()]
                        .copy_from_slice(&part.data[src..src + part.depth()]);
                }
            }
            start += part.depth();
        }
        out
    }

    /// Writes the elements as whitespace-separated decimals at 15 significant digits.
    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write_values(out, &self.data)
    }

    /// Reads `shape.len()` values in storage order.
    pub fn read_from(reader: &mut TokenReader, shape: Shape) -> Result<Self> {
        let data = reader.values(shape.len(), "volume data")?;
        Ok(Self { shape, data })
    }
}

impl Index<usize> for Volume {
    type Output = f64;

    fn index(&self, idx: usize) -> &f64 {
        &self.data[idx]
    }
}

impl IndexMut<usize> for Volume {
    fn index_mut(&mut self, idx: usize) -> &mut f64 {
        &mut self.data[idx]
    }
}
