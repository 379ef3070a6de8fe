pub use checkpoint::Checkpoints;
pub use scalar::{NodeValue, Scalar};
pub use solver::{AdamOptimizer, Optimizer};
pub use tensor::Tensor;

pub mod scalar {
    use std::{cell::Cell, fmt, ops, rc::Rc};

    #[cfg(not(feature = "short_floats"))]
    pub type NodeValue = f64;

    #[cfg(feature = "short_floats")]
    pub type NodeValue = f32;

    /// Scalar value with reverse mode gradient accumulation.
    ///
    /// Every arithmetic operation returns a fresh node whose backward rule
    /// routes the exact partial derivative into each operand, forming an
    /// implicit reverse graph (a DAG of `Rc`-shared nodes). Cloning shares
    /// the underlying node.
    #[derive(Clone)]
    pub struct Scalar(Rc<ScalarNode>);

    struct ScalarNode {
        value: NodeValue,
        gradient: Cell<NodeValue>,
        backward: BackwardRule,
    }

    enum BackwardRule {
        Accumulate,
        Chain(Box<dyn Fn(NodeValue)>),
    }

    impl Scalar {
        /// Creates a leaf node: incoming gradient contributions accumulate here.
        pub fn new(value: NodeValue) -> Self {
            Self(Rc::new(ScalarNode {
                value,
                gradient: Cell::new(0.0),
                backward: BackwardRule::Accumulate,
            }))
        }

        fn chain(value: NodeValue, rule: impl Fn(NodeValue) + 'static) -> Self {
            Self(Rc::new(ScalarNode {
                value,
                gradient: Cell::new(0.0),
                backward: BackwardRule::Chain(Box::new(rule)),
            }))
        }

        pub fn value(&self) -> NodeValue {
            self.0.value
        }

        pub fn gradient(&self) -> NodeValue {
            self.0.gradient.get()
        }

        /// Routes an incoming gradient contribution backwards through the
        /// graph. A zero contribution is dropped without visiting operands:
        /// this prunes masked-out paths whose local derivatives may be
        /// non-finite (e.g. `log` at zero).
        pub fn propagate(&self, gradient: NodeValue) {
            if gradient == 0.0 {
                return;
            }
            match &self.0.backward {
                BackwardRule::Accumulate => {
                    self.0.gradient.set(self.0.gradient.get() + gradient)
                }
                BackwardRule::Chain(rule) => rule(gradient),
            }
        }

        /// Seeds backward propagation from this node, typically with 1.0 on
        /// the loss value.
        pub fn backward(&self, seed: NodeValue) {
            self.propagate(seed);
        }

        /// Raises to a constant power. A non-positive base follows IEEE
        /// floating point semantics (`NaN`/`Infinity`), never an error.
        pub fn pow(&self, exponent: NodeValue) -> Scalar {
            let operand = self.clone();
            Scalar::chain(self.value().powf(exponent), move |dx| {
                let slope = exponent * operand.value().powf(exponent - 1.0);
                operand.propagate(slope * dx)
            })
        }

        pub fn exp(&self) -> Scalar {
            let operand = self.clone();
            Scalar::chain(self.value().exp(), move |dx| {
                operand.propagate(operand.value().exp() * dx)
            })
        }

        /// Natural logarithm. `log(0)` is `-Infinity` by IEEE semantics; the
        /// zero short-circuit in [`Scalar::propagate`] keeps such nodes from
        /// poisoning gradients of paths that never read them.
        pub fn log(&self) -> Scalar {
            let operand = self.clone();
            Scalar::chain(self.value().ln(), move |dx| {
                operand.propagate(dx / operand.value())
            })
        }
    }

    impl fmt::Debug for Scalar {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Scalar")
                .field("value", &self.value())
                .field("gradient", &self.gradient())
                .finish()
        }
    }

    impl ops::Add for &Scalar {
        type Output = Scalar;

        fn add(self, rhs: Self) -> Scalar {
            let value = self.value() + rhs.value();
            let (lhs, rhs) = (self.clone(), rhs.clone());
            Scalar::chain(value, move |dx| {
                lhs.propagate(dx);
                rhs.propagate(dx);
            })
        }
    }

    impl ops::Add<NodeValue> for &Scalar {
        type Output = Scalar;

        fn add(self, rhs: NodeValue) -> Scalar {
            let value = self.value() + rhs;
            let lhs = self.clone();
            Scalar::chain(value, move |dx| lhs.propagate(dx))
        }
    }

    impl<'a> ops::Add<&'a Scalar> for NodeValue {
        type Output = Scalar;

        fn add(self, rhs: &'a Scalar) -> Scalar {
            let value = self + rhs.value();
            let rhs = rhs.clone();
            Scalar::chain(value, move |dx| rhs.propagate(dx))
        }
    }

    impl ops::Sub for &Scalar {
        type Output = Scalar;

        fn sub(self, rhs: Self) -> Scalar {
            let value = self.value() - rhs.value();
            let (lhs, rhs) = (self.clone(), rhs.clone());
            Scalar::chain(value, move |dx| {
                lhs.propagate(dx);
                rhs.propagate(-dx);
            })
        }
    }

    impl ops::Sub<NodeValue> for &Scalar {
        type Output = Scalar;

        fn sub(self, rhs: NodeValue) -> Scalar {
            let value = self.value() - rhs;
            let lhs = self.clone();
            Scalar::chain(value, move |dx| lhs.propagate(dx))
        }
    }

    impl<'a> ops::Sub<&'a Scalar> for NodeValue {
        type Output = Scalar;

        fn sub(self, rhs: &'a Scalar) -> Scalar {
            let value = self - rhs.value();
            let rhs = rhs.clone();
            Scalar::chain(value, move |dx| rhs.propagate(-dx))
        }
    }

    impl ops::Neg for &Scalar {
        type Output = Scalar;

        fn neg(self) -> Scalar {
            let value = -self.value();
            let operand = self.clone();
            Scalar::chain(value, move |dx| operand.propagate(-dx))
        }
    }

    impl ops::Mul for &Scalar {
        type Output = Scalar;

        fn mul(self, rhs: Self) -> Scalar {
            let value = self.value() * rhs.value();
            let (lhs, rhs) = (self.clone(), rhs.clone());
            Scalar::chain(value, move |dx| {
                lhs.propagate(dx * rhs.value());
                rhs.propagate(dx * lhs.value());
            })
        }
    }

    impl ops::Mul<NodeValue> for &Scalar {
        type Output = Scalar;

        fn mul(self, rhs: NodeValue) -> Scalar {
            let value = self.value() * rhs;
            let lhs = self.clone();
            Scalar::chain(value, move |dx| lhs.propagate(dx * rhs))
        }
    }

    impl<'a> ops::Mul<&'a Scalar> for NodeValue {
        type Output = Scalar;

        fn mul(self, rhs: &'a Scalar) -> Scalar {
            let value = self * rhs.value();
            let rhs = rhs.clone();
            Scalar::chain(value, move |dx| rhs.propagate(dx * self))
        }
    }

    impl ops::Div for &Scalar {
        type Output = Scalar;

        fn div(self, rhs: Self) -> Scalar {
            let value = self.value() / rhs.value();
            let (lhs, rhs) = (self.clone(), rhs.clone());
            Scalar::chain(value, move |dx| {
                lhs.propagate(dx / rhs.value());
                rhs.propagate(-dx * lhs.value() / (rhs.value() * rhs.value()));
            })
        }
    }

    impl ops::Div<NodeValue> for &Scalar {
        type Output = Scalar;

        fn div(self, rhs: NodeValue) -> Scalar {
            let value = self.value() / rhs;
            let lhs = self.clone();
            Scalar::chain(value, move |dx| lhs.propagate(dx / rhs))
        }
    }

    impl<'a> ops::Div<&'a Scalar> for NodeValue {
        type Output = Scalar;

        fn div(self, rhs: &'a Scalar) -> Scalar {
            let value = self / rhs.value();
            let rhs = rhs.clone();
            Scalar::chain(value, move |dx| {
                rhs.propagate(-dx * self / (rhs.value() * rhs.value()))
            })
        }
    }

}

pub mod tensor {
    use std::fmt;

    use anyhow::{anyhow, Result};
    use serde::{Deserialize, Serialize};

    use crate::ml::{Rng, RngStrategy};

    use super::{
        checkpoint::Checkpoints,
        scalar::{NodeValue, Scalar},
    };

    const NORM_EPSILON: NodeValue = 0.001;

    /// N-dimensional array of differentiable scalars, stored row-major with
    /// the last dimension fastest-varying.
    ///
    /// `Clone` is a view copy sharing the underlying scalar nodes; use
    /// [`Tensor::detached`] for a value-only copy cut loose from the graph.
    #[derive(Clone)]
    pub struct Tensor {
        shape: Vec<usize>,
        values: Vec<Scalar>,
    }

    impl Tensor {
        /// Creates a zero-filled tensor of leaf scalars.
        pub fn new(shape: &[usize]) -> Result<Self> {
            if shape.is_empty() {
                Err(anyhow!("tensor must have at least one dimension"))?;
            }
            let mut len = 1_usize;
            for &size in shape {
                if size == 0 {
                    Err(anyhow!("size of every dimension must be > 0"))?;
                }
                len *= size;
            }

            Ok(Self {
                shape: shape.to_vec(),
                values: (0..len).map(|_| Scalar::new(0.0)).collect(),
            })
        }

        pub fn from_values(shape: &[usize], values: &[NodeValue]) -> Result<Self> {
            let mut tensor = Self::new(shape)?;
            if values.len() != tensor.values.len() {
                Err(anyhow!(
                    "mismatched values length: expected={}, actual={}",
                    tensor.values.len(),
                    values.len()
                ))?;
            }

            tensor.values = values.iter().map(|&value| Scalar::new(value)).collect();
            Ok(tensor)
        }

        /// Value-only copy: same shape and values, fresh zero-gradient leaves
        /// with no edges into this tensor's graph.
        pub fn detached(&self) -> Self {
            Self {
                shape: self.shape.clone(),
                values: self.values.iter().map(|x| Scalar::new(x.value())).collect(),
            }
        }

        pub fn shape(&self) -> &[usize] {
            &self.shape
        }

        pub fn rank(&self) -> usize {
            self.shape.len()
        }

        pub fn len(&self) -> usize {
            self.values.len()
        }

        pub fn is_empty(&self) -> bool {
            self.values.is_empty()
        }

        pub fn values_iter(&self) -> impl Iterator<Item = &Scalar> + '_ {
            self.values.iter()
        }

        pub fn to_values(&self) -> Vec<NodeValue> {
            self.values.iter().map(|x| x.value()).collect()
        }

        fn flat_index(&self, index: &[usize]) -> Result<usize> {
            if index.len() != self.rank() {
                Err(anyhow!(
                    "wrong number of dimensions: expected={}, actual={}",
                    self.rank(),
                    index.len()
                ))?;
            }

            let mut flat = 0;
            let mut block_size = 1;
            for dim in (0..self.rank()).rev() {
                if index[dim] >= self.shape[dim] {
                    Err(anyhow!(
                        "index {} is outside dimension {} of size {}",
                        index[dim],
                        dim,
                        self.shape[dim]
                    ))?;
                }
                flat += index[dim] * block_size;
                block_size *= self.shape[dim];
            }

            Ok(flat)
        }

        pub fn get(&self, index: &[usize]) -> Result<&Scalar> {
            let flat = self.flat_index(index)?;
            Ok(&self.values[flat])
        }

        pub fn set(&mut self, index: &[usize], value: Scalar) -> Result<()> {
            let flat = self.flat_index(index)?;
            self.values[flat] = value;
            Ok(())
        }

        /// Swaps the last two dimensions, batching over any leading ones.
        pub fn transpose(&self) -> Result<Tensor> {
            if self.rank() < 2 {
                Err(anyhow!("tensor must have rank >= 2"))?;
            }

            let rank = self.rank();
            let mut shape = self.shape.clone();
            shape.swap(rank - 2, rank - 1);
            let rows = shape[rank - 2];
            let cols = shape[rank - 1];

            let mut values = self.values.clone();
            let blocks = self.len() / (rows * cols);
            for block in 0..blocks {
                let offset = block * rows * cols;
                for i in 0..rows {
                    for j in 0..cols {
                        values[offset + i * cols + j] =
                            self.values[offset + j * rows + i].clone();
                    }
                }
            }

            Ok(Self { shape, values })
        }

        /// Multiplies every element by a constant.
        pub fn scale(&self, factor: NodeValue) -> Tensor {
            Self {
                shape: self.shape.clone(),
                values: self.values.iter().map(|x| x * factor).collect(),
            }
        }

        /// Adds a constant to every element.
        pub fn add_value(&self, value: NodeValue) -> Tensor {
            Self {
                shape: self.shape.clone(),
                values: self.values.iter().map(|x| x + value).collect(),
            }
        }

        /// Element-wise power with a constant exponent.
        pub fn pow(&self, exponent: NodeValue) -> Tensor {
            Self {
                shape: self.shape.clone(),
                values: self.values.iter().map(|x| x.pow(exponent)).collect(),
            }
        }

        /// Element-wise addition of two tensors of identical shape.
        pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
            self.assert_same_shape(rhs)?;
            Ok(Self {
                shape: self.shape.clone(),
                values: self
                    .values
                    .iter()
                    .zip(rhs.values.iter())
                    .map(|(a, b)| a + b)
                    .collect(),
            })
        }

        /// Element-wise multiplication of two tensors of identical shape.
        pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
            self.assert_same_shape(rhs)?;
            Ok(Self {
                shape: self.shape.clone(),
                values: self
                    .values
                    .iter()
                    .zip(rhs.values.iter())
                    .map(|(a, b)| a * b)
                    .collect(),
            })
        }

        /// Element-wise division of two tensors of identical shape.
        pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
            self.assert_same_shape(rhs)?;
            Ok(Self {
                shape: self.shape.clone(),
                values: self
                    .values
                    .iter()
                    .zip(rhs.values.iter())
                    .map(|(a, b)| a / b)
                    .collect(),
            })
        }

        /// Broadcast-adds a rank-1 tensor over the last dimension.
        pub fn vec_add(&self, vector: &Tensor) -> Result<Tensor> {
            if vector.rank() != 1 {
                Err(anyhow!("vector operand must have rank 1"))?;
            }
            let width = *self.shape.last().expect("tensor has at least one dimension");
            if vector.shape[0] != width {
                Err(anyhow!(
                    "mismatched vector length: expected={}, actual={}",
                    width,
                    vector.shape[0]
                ))?;
            }

            let mut values = Vec::with_capacity(self.len());
            let blocks = self.len() / width;
            for block in 0..blocks {
                let offset = block * width;
                for i in 0..width {
                    values.push(&self.values[offset + i] + &vector.values[i]);
                }
            }

            Ok(Self {
                shape: self.shape.clone(),
                values,
            })
        }

        /// Graph-building in-place element addition; the optimizer's update
        /// call site.
        pub fn add_in_place(&mut self, rhs: &Tensor) -> Result<()> {
            self.assert_same_shape(rhs)?;
            for (value, delta) in self.values.iter_mut().zip(rhs.values.iter()) {
                *value = &*value + delta;
            }
            Ok(())
        }

        /// Softmax over the last dimension in the plain `exp(x) / Σexp(x)`
        /// form, without max-subtraction: training dynamics downstream are
        /// calibrated against this exact formulation.
        pub fn softmax(&self) -> Tensor {
            let width = *self.shape.last().expect("tensor has at least one dimension");
            let blocks = self.len() / width;

            let mut values = Vec::with_capacity(self.len());
            for block in 0..blocks {
                let offset = block * width;
                let exponentials: Vec<Scalar> = (0..width)
                    .map(|i| self.values[offset + i].exp())
                    .collect();

                let mut normalization = exponentials[0].clone();
                for exponential in &exponentials[1..] {
                    normalization = &normalization + exponential;
                }
                for exponential in &exponentials {
                    values.push(exponential / &normalization);
                }
            }

            Self {
                shape: self.shape.clone(),
                values,
            }
        }

        /// Causal mask: sets the strictly upper triangular part of the last
        /// two dimensions to `-Infinity`, batched over leading dimensions.
        /// Applied before [`Tensor::softmax`], masked positions collapse to
        /// exactly zero.
        pub fn mask_in_place(&mut self) -> Result<()> {
            if self.rank() < 2 {
                Err(anyhow!("tensor must have rank >= 2"))?;
            }

            let rank = self.rank();
            let rows = self.shape[rank - 2];
            let cols = self.shape[rank - 1];
            let blocks = self.len() / (rows * cols);
            for block in 0..blocks {
                let offset = block * rows * cols;
                for i in 0..rows {
                    for j in (i + 1)..cols {
                        self.values[offset + i * cols + j] =
                            Scalar::new(NodeValue::NEG_INFINITY);
                    }
                }
            }

            Ok(())
        }

        /// Zeroes the elements flagged in `pattern` (shared across all rows of
        /// the last dimension) and rescales kept elements by `1/(1-rate)`.
        pub fn dropout(&self, pattern: &[bool], rate: NodeValue) -> Result<Tensor> {
            let width = *self.shape.last().expect("tensor has at least one dimension");
            if pattern.len() != width {
                Err(anyhow!(
                    "mismatched dropout pattern length: expected={}, actual={}",
                    width,
                    pattern.len()
                ))?;
            }

            let keep_scale = 1.0 / (1.0 - rate);
            let values = self
                .values
                .iter()
                .enumerate()
                .map(|(c, value)| {
                    if pattern[c % width] {
                        Scalar::new(0.0)
                    } else {
                        value * keep_scale
                    }
                })
                .collect();

            Ok(Self {
                shape: self.shape.clone(),
                values,
            })
        }

        /// Replaces every negative element with a fresh zero leaf, detaching
        /// it from the graph (the derivative of ReLU below zero is zero).
        pub fn relu_in_place(&mut self) {
            for value in self.values.iter_mut() {
                if value.value() < 0.0 {
                    *value = Scalar::new(0.0);
                }
            }
        }

        /// Collapses the last two dimensions into one of size `rows * cols`,
        /// keeping a leading row dimension of 1.
        pub fn flatten(&self) -> Result<Tensor> {
            if self.rank() < 2 {
                Err(anyhow!("tensor must have rank >= 2"))?;
            }

            let rank = self.rank();
            let mut shape = self.shape.clone();
            shape[rank - 2] = 1;
            shape[rank - 1] = self.shape[rank - 2] * self.shape[rank - 1];

            // row-major order makes this a pure reshape
            Ok(Self {
                shape,
                values: self.values.clone(),
            })
        }

        /// Per batch row, the index of the maximum element of the last
        /// dimension, for rank-3 tensors with a middle dimension of size 1.
        ///
        /// The running maximum starts at zero, not negative infinity: a row
        /// whose elements are all non-positive reports index 0. Call sites
        /// only pass softmax outputs, which are non-negative.
        pub fn max_indices(&self) -> Result<Vec<usize>> {
            if self.rank() != 3 {
                Err(anyhow!("tensor must have rank 3"))?;
            }
            if self.shape[1] != 1 {
                Err(anyhow!("middle dimension must have size 1"))?;
            }

            let batch = self.shape[0];
            let width = self.shape[2];
            let mut indices = vec![0; batch];
            for i in 0..batch {
                let mut max_value = 0.0;
                for j in 0..width {
                    let value = self.values[i * width + j].value();
                    if value > max_value {
                        indices[i] = j;
                        max_value = value;
                    }
                }
            }

            Ok(indices)
        }

        /// Joins equally shaped tensors along the last dimension, preserving
        /// input order.
        pub fn concat(tensors: &[Tensor]) -> Result<Tensor> {
            let first = tensors
                .first()
                .ok_or_else(|| anyhow!("no tensors provided"))?;
            for tensor in &tensors[1..] {
                first.assert_same_shape(tensor)?;
            }

            let width = *first.shape.last().expect("tensor has at least one dimension");
            let mut shape = first.shape.clone();
            *shape.last_mut().expect("tensor has at least one dimension") =
                width * tensors.len();

            let mut values = Vec::with_capacity(first.len() * tensors.len());
            let blocks = first.len() / width;
            for block in 0..blocks {
                let offset = block * width;
                for tensor in tensors {
                    for i in 0..width {
                        values.push(tensor.values[offset + i].clone());
                    }
                }
            }

            Ok(Self { shape, values })
        }

        /// Contracts the last dimension of `a` against the second-to-last of
        /// `b`, batching over leading dimensions; a rank-2 `b` is broadcast
        /// across every batch (shared weights). The result is registered as a
        /// checkpoint and the returned tensor is its detached stand-in.
        ///
        /// Runs the naive triple loop per batch: O(batch * i * j * k).
        pub fn matmul(a: &Tensor, b: &Tensor, checkpoints: &Checkpoints) -> Result<Tensor> {
            if a.rank() < 2 || b.rank() < 2 {
                Err(anyhow!("tensors must have rank >= 2"))?;
            }
            let rows = a.shape[a.rank() - 2];
            let cols = b.shape[b.rank() - 1];
            let inner = a.shape[a.rank() - 1];
            if inner != b.shape[b.rank() - 2] {
                Err(anyhow!(
                    "mismatched contraction dimensions: lhs={}, rhs={}",
                    inner,
                    b.shape[b.rank() - 2]
                ))?;
            }

            let block_size_a = rows * inner;
            let block_size_b = if b.rank() == 2 { 0 } else { inner * cols };
            if b.rank() > 2 && a.len() / block_size_a != b.len() / (inner * cols) {
                Err(anyhow!("mismatched batch dimensions"))?;
            }

            let mut shape = a.shape.clone();
            let rank = shape.len();
            shape[rank - 1] = cols;

            let blocks = a.len() / block_size_a;
            let mut values = Vec::with_capacity(blocks * rows * cols);
            for block in 0..blocks {
                let offset_a = block * block_size_a;
                let offset_b = block * block_size_b;
                for i in 0..rows {
                    for j in 0..cols {
                        let mut sum =
                            &a.values[offset_a + i * inner] * &b.values[offset_b + j];
                        for k in 1..inner {
                            let product = &a.values[offset_a + i * inner + k]
                                * &b.values[offset_b + k * cols + j];
                            sum = &sum + &product;
                        }
                        values.push(sum);
                    }
                }
            }

            Ok(checkpoints.register(Self { shape, values }))
        }

        /// Fused residual add + layer normalization: per row over the last
        /// dimension, `(A + B - mean) / sqrt(var + 0.001)`. The result is
        /// registered as a checkpoint, like [`Tensor::matmul`].
        pub fn add_norm(a: &Tensor, b: &Tensor, checkpoints: &Checkpoints) -> Result<Tensor> {
            a.assert_same_shape(b)?;

            let width = *a.shape.last().expect("tensor has at least one dimension");
            let blocks = a.len() / width;
            let mut values = Vec::with_capacity(a.len());
            for block in 0..blocks {
                let offset = block * width;
                let sums: Vec<Scalar> = (0..width)
                    .map(|i| &a.values[offset + i] + &b.values[offset + i])
                    .collect();

                let mut mean = &sums[0] / width as NodeValue;
                for sum in &sums[1..] {
                    mean = &mean + &(sum / width as NodeValue);
                }

                let centered: Vec<Scalar> = sums.iter().map(|sum| sum - &mean).collect();
                let mut variance = &centered[0].pow(2.0) / width as NodeValue;
                for value in &centered[1..] {
                    variance = &variance + &(&value.pow(2.0) / width as NodeValue);
                }

                let denominator = (&variance + NORM_EPSILON).pow(0.5);
                for value in &centered {
                    values.push(value / &denominator);
                }
            }

            let result = Self {
                shape: a.shape.clone(),
                values,
            };
            Ok(checkpoints.register(result))
        }

        /// Extracts accumulated gradients as a detached tensor of the same
        /// shape.
        pub fn derivatives(&self) -> Tensor {
            Self {
                shape: self.shape.clone(),
                values: self
                    .values
                    .iter()
                    .map(|x| Scalar::new(x.gradient()))
                    .collect(),
            }
        }

        /// Resets every element to a fresh leaf at its current value,
        /// dropping accumulated gradients and graph edges.
        pub fn clear_derivatives(&mut self) {
            for value in self.values.iter_mut() {
                *value = Scalar::new(value.value());
            }
        }

        /// Pushes every nonzero gradient accumulated on `other` into the
        /// matching element's backward rule here, position for position.
        pub fn transfer_derivatives(&self, other: &Tensor) -> Result<()> {
            self.assert_same_shape(other)?;
            for (value, source) in self.values.iter().zip(other.values.iter()) {
                let gradient = source.gradient();
                if gradient != 0.0 {
                    value.propagate(gradient);
                }
            }
            Ok(())
        }

        /// Fills with normally distributed values at He scale,
        /// `sqrt(2 / rows)` over the second-to-last dimension.
        pub fn init_normal(&mut self, rng: &RngStrategy) -> Result<()> {
            if self.rank() < 2 {
                Err(anyhow!("tensor must have rank >= 2"))?;
            }

            let rows = self.shape[self.rank() - 2];
            let scale = (2.0 / rows as NodeValue).sqrt();
            for value in self.values.iter_mut() {
                *value = Scalar::new(rng.rand_normal() * scale);
            }

            Ok(())
        }

        fn assert_same_shape(&self, other: &Tensor) -> Result<()> {
            if self.shape != other.shape {
                Err(anyhow!(
                    "mismatched tensor dimensions: lhs={:?}, rhs={:?}",
                    self.shape,
                    other.shape
                ))?;
            }
            Ok(())
        }
    }

    impl fmt::Debug for Tensor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Tensor")
                .field("shape", &self.shape)
                .field("values", &self.to_values())
                .finish()
        }
    }

    impl PartialEq for Tensor {
        fn eq(&self, other: &Self) -> bool {
            self.shape == other.shape && self.to_values() == other.to_values()
        }
    }

    #[derive(Serialize, Deserialize)]
    #[serde(rename = "Tensor")]
    struct TensorData {
        shape: Vec<usize>,
        values: Vec<NodeValue>,
    }

    impl Serialize for Tensor {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            TensorData {
                shape: self.shape.clone(),
                values: self.to_values(),
            }
            .serialize(serializer)
        }
    }

    // restored tensors are detached leaves: the graph is never persisted
    impl<'de> Deserialize<'de> for Tensor {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let data = TensorData::deserialize(deserializer)?;
            Tensor::from_values(&data.shape, &data.values).map_err(serde::de::Error::custom)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tensor_rejects_invalid_shapes() {
            assert!(Tensor::new(&[]).is_err());
            assert!(Tensor::new(&[2, 0, 3]).is_err());
            assert!(Tensor::new(&[2, 3]).is_ok());
        }

        #[test]
        fn tensor_indexing_validates_arity_and_bounds() {
            let tensor = Tensor::from_values(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();

            assert_eq!(tensor.get(&[1, 2]).unwrap().value(), 5.0);
            assert_eq!(tensor.get(&[0, 1]).unwrap().value(), 1.0);
            assert!(tensor.get(&[1]).is_err());
            assert!(tensor.get(&[1, 2, 0]).is_err());
            assert!(tensor.get(&[2, 0]).is_err());
        }

        #[test]
        fn tensor_matmul_computes_shape_and_values() {
            let checkpoints = Checkpoints::new();
            let a = Tensor::from_values(&[2, 2, 3], &(0..12).map(|x| x as NodeValue).collect::<Vec<_>>())
                .unwrap();
            let b = Tensor::from_values(&[3, 2], &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();

            let c = Tensor::matmul(&a, &b, &checkpoints).unwrap();

            assert_eq!(c.shape(), &[2, 2, 2]);
            // first batch row: [0,1,2] -> [0*1+2, 1+2]
            assert_eq!(c.get(&[0, 0, 0]).unwrap().value(), 2.0);
            assert_eq!(c.get(&[0, 0, 1]).unwrap().value(), 3.0);
            assert_eq!(c.get(&[1, 1, 0]).unwrap().value(), 20.0);
            assert_eq!(checkpoints.len(), 1);
        }

        #[test]
        fn tensor_matmul_rejects_mismatched_dimensions() {
            let checkpoints = Checkpoints::new();
            let a = Tensor::new(&[2, 3]).unwrap();
            let b = Tensor::new(&[4, 2]).unwrap();

            assert!(Tensor::matmul(&a, &b, &checkpoints).is_err());

            let a = Tensor::new(&[2, 2, 3]).unwrap();
            let b = Tensor::new(&[3, 3, 2]).unwrap();
            assert!(Tensor::matmul(&a, &b, &checkpoints).is_err());
        }

        #[test]
        fn tensor_double_transpose_is_identity() {
            let values: Vec<NodeValue> = (0..24).map(|x| x as NodeValue).collect();
            let tensor = Tensor::from_values(&[2, 3, 4], &values).unwrap();

            let transposed = tensor.transpose().unwrap();
            assert_eq!(transposed.shape(), &[2, 4, 3]);
            assert_eq!(
                transposed.get(&[0, 1, 2]).unwrap().value(),
                tensor.get(&[0, 2, 1]).unwrap().value()
            );

            let roundtrip = transposed.transpose().unwrap();
            assert_eq!(roundtrip, tensor);
        }

        #[test]
        fn tensor_softmax_rows_sum_to_one() {
            let values: Vec<NodeValue> = (0..24).map(|x| (x as NodeValue) * 0.25 - 3.0).collect();
            let tensor = Tensor::from_values(&[2, 3, 4], &values).unwrap();

            let softmax = tensor.softmax();
            assert_eq!(softmax.shape(), &[2, 3, 4]);
            for block in 0..6 {
                let row_sum: NodeValue = (0..4)
                    .map(|i| softmax.values[block * 4 + i].value())
                    .sum();
                assert!((row_sum - 1.0).abs() < 1e-9, "row {block} sums to {row_sum}");
            }
        }

        #[test]
        fn tensor_mask_then_softmax_renormalizes_causally() {
            let mut tensor = Tensor::from_values(&[1, 3, 3], &[1.0; 9]).unwrap();
            tensor.mask_in_place().unwrap();

            for i in 0..3 {
                for j in (i + 1)..3 {
                    assert_eq!(
                        tensor.get(&[0, i, j]).unwrap().value(),
                        NodeValue::NEG_INFINITY
                    );
                }
            }

            let softmax = tensor.softmax();
            let expected_live = [1, 2, 3];
            for (i, &live) in expected_live.iter().enumerate() {
                for j in 0..3 {
                    let value = softmax.get(&[0, i, j]).unwrap().value();
                    if j < live {
                        assert!((value - 1.0 / live as NodeValue).abs() < 1e-9);
                    } else {
                        assert_eq!(value, 0.0);
                    }
                }
            }
        }

        #[test]
        fn tensor_dropout_scales_kept_positions() {
            let tensor = Tensor::from_values(&[2, 4], &[1.0; 8]).unwrap();
            let pattern = [true, false, false, true];
            let rate = 0.5;

            let dropped = tensor.dropout(&pattern, rate).unwrap();
            let total: NodeValue = dropped.to_values().iter().sum();
            let kept_per_row = 2.0;
            assert_eq!(total, 2.0 * kept_per_row * (1.0 / (1.0 - rate)));

            let kept = tensor.dropout(&[false; 4], 0.0).unwrap();
            assert_eq!(kept, tensor);

            assert!(tensor.dropout(&[false; 3], 0.0).is_err());
        }

        #[test]
        fn tensor_concat_preserves_input_order() {
            let a = Tensor::from_values(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
            let b = Tensor::from_values(&[2, 2], &[5.0, 6.0, 7.0, 8.0]).unwrap();
            let c = Tensor::from_values(&[2, 2], &[9.0, 10.0, 11.0, 12.0]).unwrap();

            let joined = Tensor::concat(&[a.clone(), b.clone(), c.clone()]).unwrap();
            assert_eq!(joined.shape(), &[2, 6]);

            // each source block is recoverable by slicing its column range
            for (t, source) in [&a, &b, &c].into_iter().enumerate() {
                for row in 0..2 {
                    for col in 0..2 {
                        assert_eq!(
                            joined.get(&[row, t * 2 + col]).unwrap().value(),
                            source.get(&[row, col]).unwrap().value()
                        );
                    }
                }
            }

            let mismatched = Tensor::new(&[2, 3]).unwrap();
            assert!(Tensor::concat(&[a, mismatched]).is_err());
        }

        #[test]
        fn tensor_add_norm_normalizes_rows() {
            let checkpoints = Checkpoints::new();
            let a = Tensor::from_values(&[2, 4], &[1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 1.0, 2.0])
                .unwrap();
            let b = Tensor::from_values(&[2, 4], &[0.5; 8]).unwrap();

            let normalized = Tensor::add_norm(&a, &b, &checkpoints).unwrap();
            assert_eq!(normalized.shape(), &[2, 4]);
            assert_eq!(checkpoints.len(), 1);

            for row in 0..2 {
                let values: Vec<NodeValue> = (0..4)
                    .map(|i| normalized.get(&[row, i]).unwrap().value())
                    .collect();
                let mean: NodeValue = values.iter().sum::<NodeValue>() / 4.0;
                assert!(mean.abs() < 1e-9, "row {row} mean is {mean}");

                // variance shrinks toward 1 by the epsilon in the denominator
                let variance: NodeValue =
                    values.iter().map(|v| v * v).sum::<NodeValue>() / 4.0;
                assert!(variance < 1.0 && variance > 0.5, "row {row} variance is {variance}");
            }
        }

        #[test]
        fn tensor_flatten_collapses_last_two_dimensions() {
            let values: Vec<NodeValue> = (0..12).map(|x| x as NodeValue).collect();
            let tensor = Tensor::from_values(&[2, 2, 3], &values).unwrap();

            let flat = tensor.flatten().unwrap();
            assert_eq!(flat.shape(), &[2, 1, 6]);
            assert_eq!(flat.to_values(), values);
        }

        #[test]
        fn tensor_max_indices_seeds_running_maximum_at_zero() {
            let tensor =
                Tensor::from_values(&[2, 1, 3], &[0.1, 0.7, 0.2, -3.0, -1.0, -2.0]).unwrap();

            let indices = tensor.max_indices().unwrap();
            assert_eq!(indices[0], 1);
            // all-negative row never exceeds the zero sentinel
            assert_eq!(indices[1], 0);

            assert!(Tensor::new(&[2, 3]).unwrap().max_indices().is_err());
            assert!(Tensor::new(&[2, 2, 3]).unwrap().max_indices().is_err());
        }

        #[test]
        fn tensor_vec_add_broadcasts_over_last_dimension() {
            let tensor = Tensor::from_values(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
            let vector = Tensor::from_values(&[3], &[10.0, 20.0, 30.0]).unwrap();

            let sum = tensor.vec_add(&vector).unwrap();
            assert_eq!(sum.to_values(), vec![10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);

            let wrong_len = Tensor::new(&[4]).unwrap();
            assert!(tensor.vec_add(&wrong_len).is_err());
            let wrong_rank = Tensor::new(&[3, 1]).unwrap();
            assert!(tensor.vec_add(&wrong_rank).is_err());
        }

        #[test]
        fn tensor_elementwise_ops_combine_values() {
            let a = Tensor::from_values(&[2], &[2.0, 8.0]).unwrap();
            let b = Tensor::from_values(&[2], &[4.0, 2.0]).unwrap();

            let sum = a.add(&b).unwrap();
            assert_eq!(sum.to_values(), vec![6.0, 10.0]);

            let quotient = a.div(&b).unwrap();
            assert_eq!(quotient.to_values(), vec![0.5, 4.0]);

            let shifted = a.add_value(1.0).pow(2.0);
            assert_eq!(shifted.to_values(), vec![9.0, 81.0]);

            let mismatched = Tensor::new(&[3]).unwrap();
            assert!(a.add(&mismatched).is_err());
            assert!(a.div(&mismatched).is_err());
        }

        #[test]
        fn tensor_relu_zeroes_negatives_and_detaches_them() {
            let a = Tensor::from_values(&[4], &[-1.0, 2.0, -0.5, 3.0]).unwrap();
            let mut activated = a.scale(1.0);
            activated.relu_in_place();
            assert_eq!(activated.to_values(), vec![0.0, 2.0, 0.0, 3.0]);

            for value in activated.values_iter() {
                value.backward(1.0);
            }
            assert_eq!(a.derivatives().to_values(), vec![0.0, 1.0, 0.0, 1.0]);
        }

        #[test]
        fn tensor_gradients_flow_through_elementwise_ops() {
            let a = Tensor::from_values(&[2], &[2.0, 3.0]).unwrap();
            let b = Tensor::from_values(&[2], &[4.0, 5.0]).unwrap();

            let product = a.mul(&b).unwrap();
            for value in product.values_iter() {
                value.backward(1.0);
            }

            assert_eq!(a.derivatives().to_values(), vec![4.0, 5.0]);
            assert_eq!(b.get(&[0]).unwrap().gradient(), 2.0);
            assert_eq!(b.get(&[1]).unwrap().gradient(), 3.0);
        }

        #[test]
        fn tensor_clear_derivatives_detaches_graph() {
            let a = Tensor::from_values(&[2], &[2.0, 3.0]).unwrap();
            let mut doubled = a.scale(2.0);

            doubled.clear_derivatives();
            for value in doubled.values_iter() {
                value.backward(1.0);
            }

            assert_eq!(doubled.to_values(), vec![4.0, 6.0]);
            assert_eq!(a.get(&[0]).unwrap().gradient(), 0.0);
            assert_eq!(a.get(&[1]).unwrap().gradient(), 0.0);
        }

        #[test]
        fn tensor_serde_persists_values_only() {
            let rng = RngStrategy::testable(1234);
            let mut tensor = Tensor::new(&[3, 4]).unwrap();
            tensor.init_normal(&rng).unwrap();

            let json = serde_json::to_string(&tensor).unwrap();
            let restored: Tensor = serde_json::from_str(&json).unwrap();

            assert_eq!(restored, tensor);
        }
    }
}

pub mod checkpoint {
    use std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
        fmt,
    };

    use anyhow::Result;
    use tracing::debug;

    use super::tensor::Tensor;

    /// Ordered registry of tensors produced by the expensive graph-building
    /// operations (matrix multiply, add-normalize), used to replay gradient
    /// propagation through them in strict reverse production order.
    ///
    /// Each entry pairs the graph-connected pre-image with a detached
    /// post-image that downstream computation continues with; gradients
    /// gathered on the post-image are pushed back into the pre-image during
    /// [`Checkpoints::replay`]. One instance serves exactly one
    /// forward/backward cycle at a time; concurrent passes need their own.
    pub struct Checkpoints {
        entries: RefCell<BTreeMap<u64, CheckpointPair>>,
        next_key: Cell<u64>,
    }

    struct CheckpointPair {
        source: Tensor,
        replica: Tensor,
    }

    impl Default for Checkpoints {
        fn default() -> Self {
            Self {
                entries: RefCell::new(BTreeMap::new()),
                next_key: Cell::new(1),
            }
        }
    }

    impl Checkpoints {
        pub fn new() -> Self {
            Self::default()
        }

        /// Records `tensor` under the next sequence number and returns its
        /// detached stand-in for downstream computation to continue with.
        pub fn register(&self, tensor: Tensor) -> Tensor {
            let replica = tensor.detached();
            let output = replica.clone();

            let key = self.next_key.get();
            self.next_key.set(key + 1);
            self.entries.borrow_mut().insert(
                key,
                CheckpointPair {
                    source: tensor,
                    replica,
                },
            );

            output
        }

        /// Empties the registry and resets the sequence counter; called once
        /// before every forward pass.
        pub fn clear(&self) {
            let mut entries = self.entries.borrow_mut();
            if !entries.is_empty() {
                debug!("discarding {} checkpoints from previous pass", entries.len());
            }
            entries.clear();
            self.next_key.set(1);
        }

        /// Walks entries in descending registration order, pushing each
        /// post-image's accumulated gradients into its pre-image. Later
        /// tensors depend on earlier ones, so the reverse walk delivers every
        /// gradient before the tensor that needs it is processed.
        ///
        /// Must run after the loss has been seeded backward and before any
        /// optimizer step reads gradients.
        pub fn replay(&self) -> Result<()> {
            let entries = self.entries.borrow();
            debug!("replaying {} checkpoints", entries.len());
            for pair in entries.values().rev() {
                pair.source.transfer_derivatives(&pair.replica)?;
            }
            Ok(())
        }

        pub fn len(&self) -> usize {
            self.entries.borrow().len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.borrow().is_empty()
        }
    }

    impl fmt::Debug for Checkpoints {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Checkpoints")
                .field("len", &self.len())
                .field("next_key", &self.next_key.get())
                .finish()
        }
    }

}

pub mod solver {
    use anyhow::{anyhow, Result};
    use itertools::izip;
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    use super::{
        scalar::NodeValue,
        tensor::Tensor,
    };

    pub trait Optimizer {
        fn update(&mut self, target: &mut Tensor, learn_rate: NodeValue, step: u64)
            -> Result<()>;
    }

    /// Adam optimizer state for a single learnable tensor: first and second
    /// moment running averages, held as detached value tensors (re-deriving
    /// them through the graph each step would chain closures without bound).
    #[derive(Debug, Serialize, Deserialize)]
    pub struct AdamOptimizer {
        momentum: Tensor,
        rms: Tensor,
        beta: (NodeValue, NodeValue),
        epsilon: NodeValue,
    }

    impl AdamOptimizer {
        pub fn new(shape: &[usize]) -> Result<Self> {
            Self::new_builder(shape).build()
        }

        pub fn new_builder(shape: &[usize]) -> builder::AdamOptimizerBuilder {
            builder::AdamOptimizerBuilder::new(shape)
        }

        pub fn momentum(&self) -> &Tensor {
            &self.momentum
        }

        pub fn rms(&self) -> &Tensor {
            &self.rms
        }
    }

    impl Optimizer for AdamOptimizer {
        fn update(
            &mut self,
            target: &mut Tensor,
            learn_rate: NodeValue,
            step: u64,
        ) -> Result<()> {
            if step == 0 {
                Err(anyhow!("bias correction requires a step index >= 1"))?;
            }
            if target.shape() != self.momentum.shape() {
                Err(anyhow!(
                    "mismatched optimizer state dimensions: target={:?}, state={:?}",
                    target.shape(),
                    self.momentum.shape()
                ))?;
            }

            let (beta1, beta2) = self.beta;
            let momentum_correction = 1.0 - beta1.powi(step as i32);
            let rms_correction = 1.0 - beta2.powi(step as i32);

            let mut momentum_next = Vec::with_capacity(target.len());
            let mut rms_next = Vec::with_capacity(target.len());
            let mut corrections = Vec::with_capacity(target.len());
            for (value, momentum, rms) in izip!(
                target.values_iter(),
                self.momentum.values_iter(),
                self.rms.values_iter()
            ) {
                let gradient = value.gradient();
                let momentum = beta1 * momentum.value() + (1.0 - beta1) * gradient;
                let rms = beta2 * rms.value() + (1.0 - beta2) * gradient * gradient;

                let momentum_hat = momentum / momentum_correction;
                let rms_hat = rms / rms_correction;
                corrections
                    .push(-learn_rate * momentum_hat / (rms_hat.sqrt() + self.epsilon));

                momentum_next.push(momentum);
                rms_next.push(rms);
            }

            if corrections.iter().any(|x| !x.is_finite()) {
                Err(anyhow!("failed to update target: invalid gradients"))?;
            }

            debug!("applying optimizer step {step} to {:?} parameter", target.shape());
            let correction = Tensor::from_values(target.shape(), &corrections)?;
            target.add_in_place(&correction)?;
            target.clear_derivatives();

            self.momentum = Tensor::from_values(self.momentum.shape(), &momentum_next)?;
            self.rms = Tensor::from_values(self.rms.shape(), &rms_next)?;
            Ok(())
        }
    }

    pub mod builder {
        use super::*;

        pub struct AdamOptimizerBuilder {
            shape: Vec<usize>,
            beta: (NodeValue, NodeValue),
            epsilon: NodeValue,
        }

        impl AdamOptimizerBuilder {
            pub fn new(shape: &[usize]) -> Self {
                Self {
                    shape: shape.to_vec(),
                    beta: (0.9, 0.999),
                    epsilon: 1e-8,
                }
            }

            pub fn with_beta(mut self, beta1: NodeValue, beta2: NodeValue) -> Self {
                self.beta = (beta1, beta2);
                self
            }

            pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
                self.epsilon = epsilon;
                self
            }

            pub fn build(self) -> Result<AdamOptimizer> {
                Ok(AdamOptimizer {
                    momentum: Tensor::new(&self.shape)?,
                    rms: Tensor::new(&self.shape)?,
                    beta: self.beta,
                    epsilon: self.epsilon,
                })
            }
        }
    }

}
