//! Residual layers
//!
//! A residual layer sums a main branch with a shortcut. The shortcut is the identity when
//! the main branch preserves the input shape, and otherwise a learned 1×1 `conv_batch`
//! projection whose stride maps the input grid onto the main branch's output grid.

use crate::error::{shape_mismatch, Error, Result};
use crate::layers::chain::Chain;
use crate::layers::composite::{CompositeKind, CompositeLayer, Merge};
use crate::layers::conv2d::ConvBatchLayer;
use crate::layers::r#trait::Layer;
use crate::serialization::TokenReader;
use crate::tensor::Shape;
use crate::utils::EngineRng;
use log::debug;
use std::io::Write;

/// Stride of a 1×1, unpadded convolution that takes `input` cells to `output` cells.
fn projection_stride(input: usize, output: usize) -> usize {
    if output > 1 {
        ((input - 1) / (output - 1)).max(1)
    } else {
        input.max(1)
    }
}

/// Builds the projection shortcut from `input` to `output`.
fn projection(input: Shape, output: Shape, rng: &mut EngineRng) -> Result<Chain> {
    let stride = projection_stride(input.width, output.width);
    let conv = ConvBatchLayer::new(input, output.depth, 1, stride, 0, rng).map_err(|e| {
        shape_mismatch(format!(
            "no 1x1 projection maps {} onto {}: {}",
            input, output, e
        ))
    })?;
    if conv.output_shape() != output {
        return Err(shape_mismatch(format!(
            "1x1 projection of {} gives {}, main branch gives {}",
            input,
            conv.output_shape(),
            output
        )));
    }
    let mut chain = Chain::new(input);
    chain.push(Box::new(conv))?;
    Ok(chain)
}

impl CompositeLayer {
    /// Residual layer over `main`, adding a projection shortcut when `main` changes the shape.
    pub fn residual(input: Shape, main: Chain, rng: &mut EngineRng) -> Result<Self> {
        let output = main.output_shape();
        let shortcut = if output == input {
            Chain::new(input)
        } else {
            debug!("residual shortcut projects {} onto {}", input, output);
            projection(input, output, rng)?
        };
        Self::with_shortcut(input, main, shortcut)
    }

    fn with_shortcut(input: Shape, main: Chain, shortcut: Chain) -> Result<Self> {
        if main.output_shape() != shortcut.output_shape() {
            return Err(shape_mismatch(format!(
                "residual main branch gives {}, shortcut gives {}",
                main.output_shape(),
                shortcut.output_shape()
            )));
        }
        Self::from_branches(CompositeKind::Residual, input, vec![main, shortcut], Merge::Sum)
    }

    /// The main branch of a residual layer.
    pub fn main_branch(&self) -> &Chain {
        &self.branches()[0]
    }

    /// The shortcut of a residual layer; empty for the identity.
    pub fn shortcut(&self) -> &Chain {
        &self.branches()[1]
    }

    /// Reads the body of a `residual` record.
    pub fn load_residual(
        input: Shape,
        reader: &mut TokenReader,
        rng: &mut EngineRng,
    ) -> Result<Self> {
        let main_len: usize = reader.parse("residual main length")?;
        let projected: u8 = reader.parse("residual projection flag")?;
        let main = Chain::load(input, main_len, reader, rng)?;
        let shortcut = match projected {
            0 => Chain::new(input),
            1 => Chain::load(input, 1, reader, rng)?,
            other => {
                return Err(Error::Malformed(format!(
                    "residual projection flag must be 0 or 1, got {}",
                    other
                )))
            }
        };
        Self::with_shortcut(input, main, shortcut)
    }

    pub(crate) fn write_residual(&self, out: &mut dyn Write) -> Result<()> {
        let shortcut = self.shortcut();
        writeln!(
            out,
            " {} {}",
            self.main_branch().len(),
            u8::from(!shortcut.is_empty())
        )?;
        self.main_branch().save(out)?;
        shortcut.save(out)
    }
}
