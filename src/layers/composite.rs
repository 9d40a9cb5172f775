//! Composite layers
//!
//! A [`CompositeLayer`] owns a set of branch [`Chain`]s that all read the same input.
//! Branch outputs are merged either by summation (branches agree on depth) or by stacking
//! along depth. Backward splits the upstream gradient the same way (duplicated for a sum,
//! sliced by depth range for a stack), backpropagates every branch, and sums the branch
//! input gradients.
//!
//! Three kinds share this machinery:
//!
//! - `block`: arbitrary branches with a selectable merge
//! - `inception`: stacked branches
//! - `residual`: a main branch summed with an identity or 1×1 projection shortcut (see
//!   [`CompositeLayer::residual`])

use crate::error::{shape_mismatch, Error, Result};
use crate::layers::chain::Chain;
use crate::layers::params::locate;
use crate::layers::r#trait::{check_batch, write_header, Layer};
use crate::optimizers::Optimizer;
use crate::serialization::TokenReader;
use crate::tensor::{Shape, Volume};
use crate::utils::EngineRng;
use rayon::prelude::*;
use std::fmt;
use std::io::Write;

/// How branch outputs are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Element-wise sum; every branch has the same output shape.
    Sum,
    /// Concatenation along depth, in branch order.
    Stack,
}

impl Merge {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sum" | "add" => Ok(Merge::Sum),
            "stack" | "concat" => Ok(Merge::Stack),
            other => Err(Error::InvalidParameter {
                key: "merge".to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Merge::Sum => "sum",
            Merge::Stack => "stack",
        }
    }

    /// Output shape of merging `branches`, or a shape error.
    fn output_shape(&self, branches: &[Chain]) -> Result<Shape> {
        let first = branches
            .first()
            .ok_or_else(|| shape_mismatch("composite layer needs at least one branch"))?
            .output_shape();
        let mut depth = 0;
        for (k, branch) in branches.iter().enumerate() {
            let shape = branch.output_shape();
            if shape.width != first.width || shape.height != first.height {
                return Err(shape_mismatch(format!(
                    "branch {} output {} does not match branch 0 spatially ({})",
                    k, shape, first
                )));
            }
            if *self == Merge::Sum && shape.depth != first.depth {
                return Err(shape_mismatch(format!(
                    "sum merge needs equal depths: branch {} is {}, branch 0 is {}",
                    k, shape, first
                )));
            }
            depth += shape.depth;
        }
        Ok(match self {
            Merge::Sum => first,
            Merge::Stack => Shape::new(first.width, first.height, depth),
        })
    }

    /// Merges one output batch per branch into one batch.
    fn combine(&self, parts: &[&[Volume]]) -> Vec<Volume> {
        let batch = parts.first().map_or(0, |p| p.len());
        (0..batch)
            .into_par_iter()
            .map(|b| match self {
                Merge::Sum => {
                    let mut y = parts[0][b].clone();
                    for part in &parts[1..] {
                        y.add_assign(&part[b]);
                    }
                    y
                }
                Merge::Stack => {
                    let volumes: Vec<&Volume> = parts.iter().map(|p| &p[b]).collect();
                    Volume::concat_depth(&volumes)
                }
            })
            .collect()
    }
}

impl fmt::Display for Merge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeKind {
    Block,
    Inception,
    Residual,
}

impl CompositeKind {
    pub fn token(&self) -> &'static str {
        match self {
            CompositeKind::Block => "block",
            CompositeKind::Inception => "inception",
            CompositeKind::Residual => "residual",
        }
    }
}

/// Fan-out / fan-in layer over owned branch chains.
pub struct CompositeLayer {
    kind: CompositeKind,
    merge: Merge,
    input: Shape,
    output: Shape,
    branches: Vec<Chain>,
    outputs: Vec<Volume>,
    input_grads: Vec<Volume>,
}

impl CompositeLayer {
    pub(crate) fn from_branches(
        kind: CompositeKind,
        input: Shape,
        branches: Vec<Chain>,
        merge: Merge,
    ) -> Result<Self> {
        input.validate()?;
        for (k, branch) in branches.iter().enumerate() {
            if branch.input_shape() != input {
                return Err(shape_mismatch(format!(
                    "{} branch {} expects input {}, layer input is {}",
                    kind.token(),
                    k,
                    branch.input_shape(),
                    input
                )));
            }
        }
        let output = merge.output_shape(&branches)?;
        Ok(Self {
            kind,
            merge,
            input,
            output,
            branches,
            outputs: Vec::new(),
            input_grads: Vec::new(),
        })
    }

    /// Branches merged by `merge`. An empty branch passes its input through.
    pub fn block(input: Shape, branches: Vec<Chain>, merge: Merge) -> Result<Self> {
        Self::from_branches(CompositeKind::Block, input, branches, merge)
    }

    /// Branches stacked along depth.
    pub fn inception(input: Shape, branches: Vec<Chain>) -> Result<Self> {
        Self::from_branches(CompositeKind::Inception, input, branches, Merge::Stack)
    }

    pub fn composite_kind(&self) -> CompositeKind {
        self.kind
    }

    pub fn merge(&self) -> Merge {
        self.merge
    }

    pub fn branches(&self) -> &[Chain] {
        &self.branches
    }

    pub fn branches_mut(&mut self) -> &mut [Chain] {
        &mut self.branches
    }

    /// Reads the body of a `block` record.
    pub fn load_block(input: Shape, reader: &mut TokenReader, rng: &mut EngineRng) -> Result<Self> {
        let merge = Merge::from_name(reader.next_token("block merge")?)?;
        let branches = read_branches(input, reader, rng)?;
        Self::block(input, branches, merge)
    }

    /// Reads the body of an `inception` record.
    pub fn load_inception(
        input: Shape,
        reader: &mut TokenReader,
        rng: &mut EngineRng,
    ) -> Result<Self> {
        let branches = read_branches(input, reader, rng)?;
        Self::inception(input, branches)
    }

    fn write_branches(&self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, " {}", self.branches.len())?;
        for branch in &self.branches {
            writeln!(out, "branch {}", branch.len())?;
            branch.save(out)?;
        }
        Ok(())
    }
}

fn read_branches(input: Shape, reader: &mut TokenReader, rng: &mut EngineRng) -> Result<Vec<Chain>> {
    let count: usize = reader.parse("branch count")?;
    (0..count)
        .map(|_| {
            reader.expect("branch")?;
            let len: usize = reader.parse("branch length")?;
            Chain::load(input, len, reader, rng)
        })
        .collect()
}

impl Layer for CompositeLayer {
    fn kind(&self) -> &'static str {
        self.kind.token()
    }

    fn input_shape(&self) -> Shape {
        self.input
    }

    fn output_shape(&self) -> Shape {
        self.output
    }

    fn forward(&mut self, input: &[Volume]) {
        check_batch(self.kind.token(), "input", input, self.input);
        for branch in &mut self.branches {
            branch.forward(input);
        }
        let parts: Vec<&[Volume]> = self.branches.iter().map(|b| b.output(input)).collect();
        let merged = self.merge.combine(&parts);
        self.outputs = merged;
    }

    fn output(&self) -> &[Volume] {
        &self.outputs
    }

    fn forward_output(&self, input: &[Volume]) -> Vec<Volume> {
        check_batch(self.kind.token(), "input", input, self.input);
        let results: Vec<Vec<Volume>> = self
            .branches
            .iter()
            .map(|b| b.forward_output(input))
            .collect();
        let parts: Vec<&[Volume]> = results.iter().map(Vec::as_slice).collect();
        self.merge.combine(&parts)
    }

    fn backward(&mut self, dout: &[Volume], input: &[Volume], calc_dx: bool) {
        check_batch(self.kind.token(), "gradient", dout, self.output);
        let merge = self.merge;
        let mut grads: Vec<Volume> = if calc_dx {
            vec![Volume::zeros(self.input); dout.len()]
        } else {
            Vec::new()
        };

        let mut start = 0;
        for branch in &mut self.branches {
            let depth = branch.output_shape().depth;
            let sliced: Vec<Volume>;
            let branch_dout: &[Volume] = match merge {
                Merge::Sum => dout,
                Merge::Stack => {
                    sliced = dout.iter().map(|g| g.slice_depth(start, depth)).collect();
                    &sliced
                }
            };
            start += depth;

            branch.backward(branch_dout, input, calc_dx);
            if calc_dx {
                let dx = branch.input_gradient(branch_dout);
                grads
                    .par_iter_mut()
                    .zip(dx.par_iter())
                    .for_each(|(acc, g)| acc.add_assign(g));
            }
        }
        self.input_grads = grads;
    }

    fn input_gradient(&self) -> &[Volume] {
        &self.input_grads
    }

    fn update_weights(&mut self, optimizer: &Optimizer) {
        for branch in &mut self.branches {
            branch.update_weights(optimizer);
        }
    }

    fn reset_optimizer_state(&mut self) {
        for branch in &mut self.branches {
            branch.reset_optimizer_state();
        }
    }

    fn is_stochastic(&self) -> bool {
        self.branches
            .iter()
            .any(|b| b.layers().iter().any(|l| l.is_stochastic()))
    }

    fn trainable_params(&self) -> usize {
        self.branches.iter().map(Chain::trainable_params).sum()
    }

    fn param(&self, index: usize) -> f64 {
        let (b, p) = locate(self.branches.iter().map(Chain::trainable_params), index);
        self.branches[b].param(p)
    }

    fn set_param(&mut self, index: usize, value: f64) {
        let (b, p) = locate(self.branches.iter().map(Chain::trainable_params), index);
        self.branches[b].set_param(p, value)
    }

    fn gradient(&self, index: usize) -> f64 {
        let (b, p) = locate(self.branches.iter().map(Chain::trainable_params), index);
        self.branches[b].gradient(p)
    }

    fn zero_gradients(&mut self) {
        for branch in &mut self.branches {
            branch.zero_gradients();
        }
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        write_header(out, self.kind.token(), self.input)?;
        match self.kind {
            CompositeKind::Block => {
                write!(out, " {}", self.merge)?;
                self.write_branches(out)
            }
            CompositeKind::Inception => self.write_branches(out),
            CompositeKind::Residual => self.write_residual(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{ActivationLayer, FullyConnectedLayer};
    use crate::utils::Activation;

    fn relu_branch(shape: Shape) -> Chain {
        let mut chain = Chain::new(shape);
        chain
            .push(Box::new(ActivationLayer::new(shape, Activation::ReLU).unwrap()))
            .unwrap();
        chain
    }

    #[test]
    fn test_sum_merge_adds_branches() {
        let shape = Shape::flat(3);
        let mut layer =
            CompositeLayer::block(shape, vec![Chain::new(shape), relu_branch(shape)], Merge::Sum)
                .unwrap();
        let x = vec![Volume::from_slice(&[1.0, -2.0, 3.0])];
        layer.forward(&x);
        assert_eq!(layer.output()[0].data(), &[2.0, -2.0, 6.0]);

        layer.backward(&[Volume::from_slice(&[1.0, 1.0, 1.0])], &x, true);
        assert_eq!(layer.input_gradient()[0].data(), &[2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_stack_merge_slices_gradient() {
        let shape = Shape::new(1, 1, 2);
        let mut layer = CompositeLayer::inception(shape, vec![Chain::new(shape), relu_branch(shape)])
            .unwrap();
        assert_eq!(layer.output_shape(), Shape::new(1, 1, 4));
        let x = vec![Volume::from_vec(shape, vec![-1.0, 2.0]).unwrap()];
        layer.forward(&x);
        assert_eq!(layer.output()[0].data(), &[-1.0, 2.0, 0.0, 2.0]);

        let g = Volume::from_vec(Shape::new(1, 1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        layer.backward(&[g], &x, true);
        assert_eq!(layer.input_gradient()[0].data(), &[1.0, 6.0]);
    }

    #[test]
    fn test_sum_merge_rejects_depth_mismatch() {
        let mut rng = EngineRng::new(2);
        let shape = Shape::flat(3);
        let mut narrow = Chain::new(shape);
        narrow
            .push(Box::new(
                FullyConnectedLayer::new(shape, 2, Activation::Identity, &mut rng).unwrap(),
            ))
            .unwrap();
        let err = CompositeLayer::block(shape, vec![Chain::new(shape), narrow], Merge::Sum)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_parameters_span_branches() {
        let mut rng = EngineRng::new(2);
        let shape = Shape::flat(2);
        let mut a = Chain::new(shape);
        a.push(Box::new(
            FullyConnectedLayer::new(shape, 2, Activation::Tanh, &mut rng).unwrap(),
        ))
        .unwrap();
        let mut b = Chain::new(shape);
        b.push(Box::new(
            FullyConnectedLayer::new(shape, 1, Activation::Tanh, &mut rng).unwrap(),
        ))
        .unwrap();
        let mut layer = CompositeLayer::block(shape, vec![a, b], Merge::Stack).unwrap();
        assert_eq!(layer.trainable_params(), 6 + 3);
        layer.set_param(7, 0.25);
        assert_eq!(layer.param(7), 0.25);
        assert_eq!(layer.branches()[1].param(1), 0.25);
    }

    #[test]
    fn test_merge_names() {
        assert_eq!(Merge::from_name("concat").unwrap(), Merge::Stack);
        assert_eq!(Merge::from_name("sum").unwrap(), Merge::Sum);
        assert!(Merge::from_name("max").is_err());
    }
}
