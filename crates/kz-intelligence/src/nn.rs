//! A small feed-forward network runtime on `ndarray`.
//!
//! Enough to train the two local models: dense layers with Glorot uniform
//! initialisation, relu/linear/softmax activations, inverted dropout, full
//! backpropagation, and the Adam optimizer. Networks serialize with serde so
//! they can be stored as artifacts.

use ndarray::{s, Array, Array1, Array2, ArrayView2, Axis, Dimension, Zip};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probabilities are clipped to `[EPSILON, 1 - EPSILON]` before taking logs.
const EPSILON: f32 = 1e-7;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("incompatible artifact: {0}")]
    IncompatibleArtifact(String),

    #[error("invalid architecture: {0}")]
    Architecture(String),

    #[error("model produced a non-finite output")]
    NonFinite,

    #[error("empty dataset")]
    EmptyDataset,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Linear,
    Softmax,
}

impl Activation {
    fn apply(self, z: &mut Array2<f32>) {
        match self {
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Linear => {}
            Activation::Softmax => {
                for mut row in z.rows_mut() {
                    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row.mapv_inplace(|v| v / sum);
                }
            }
        }
    }

    /// Gradient w.r.t. the pre-activation, given the activation output and
    /// the gradient w.r.t. that output.
    fn backward(self, output: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => {
                let mut dz = grad.clone();
                Zip::from(&mut dz).and(output).for_each(|d, &o| {
                    if o <= 0.0 {
                        *d = 0.0;
                    }
                });
                dz
            }
            Activation::Linear => grad.clone(),
            Activation::Softmax => {
                // Row-wise Jacobian-vector product: s * (g - <g, s>).
                let dot = (grad * output).sum_axis(Axis(1)).insert_axis(Axis(1));
                output * &(grad - &dot)
            }
        }
    }
}

/// Architecture description of one layer, independent of weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Dense { units: usize, activation: Activation },
    Dropout { rate: f32 },
}

impl LayerSpec {
    pub fn dense(units: usize, activation: Activation) -> Self {
        LayerSpec::Dense { units, activation }
    }

    pub fn dropout(rate: f32) -> Self {
        LayerSpec::Dropout { rate }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    /// `(inputs, units)`.
    weights: Array2<f32>,
    bias: Array1<f32>,
    activation: Activation,
}

impl Dense {
    /// Glorot uniform weights, zero bias.
    fn glorot<R: Rng + ?Sized>(inputs: usize, units: usize, activation: Activation, rng: &mut R) -> Self {
        let limit = (6.0 / (inputs + units) as f32).sqrt();
        let weights = Array2::from_shape_fn((inputs, units), |_| rng.gen_range(-limit..limit));
        Self {
            weights,
            bias: Array1::zeros(units),
            activation,
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut z = x.dot(&self.weights) + &self.bias;
        self.activation.apply(&mut z);
        z
    }

    fn units(&self) -> usize {
        self.weights.ncols()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Layer {
    Dense(Dense),
    Dropout { rate: f32 },
}

impl Layer {
    fn spec(&self) -> LayerSpec {
        match self {
            Layer::Dense(d) => LayerSpec::dense(d.units(), d.activation),
            Layer::Dropout { rate } => LayerSpec::dropout(*rate),
        }
    }
}

/// Per-layer values kept from the training forward pass.
enum Cache {
    Dense { input: Array2<f32>, output: Array2<f32> },
    Dropout { mask: Array2<f32> },
}

type Gradients = Vec<Option<(Array2<f32>, Array1<f32>)>>;

// ---------------------------------------------------------------------------
// Loss and metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    MeanSquaredError,
    CategoricalCrossEntropy,
}

impl Loss {
    pub fn compute(self, pred: &Array2<f32>, target: &Array2<f32>) -> f32 {
        let n = pred.nrows().max(1) as f32;
        match self {
            Loss::MeanSquaredError => {
                let diff = pred - target;
                diff.mapv(|d| d * d).sum() / (n * pred.ncols().max(1) as f32)
            }
            Loss::CategoricalCrossEntropy => {
                let mut total = 0.0;
                Zip::from(pred).and(target).for_each(|&p, &y| {
                    total -= y * p.clamp(EPSILON, 1.0 - EPSILON).ln();
                });
                total / n
            }
        }
    }

    /// Gradient w.r.t. the network output. With `fused_softmax` the result is
    /// already w.r.t. the final pre-activation.
    fn gradient(self, pred: &Array2<f32>, target: &Array2<f32>, fused_softmax: bool) -> Array2<f32> {
        let n = pred.nrows().max(1) as f32;
        match self {
            Loss::MeanSquaredError => (pred - target) * (2.0 / (n * pred.ncols().max(1) as f32)),
            Loss::CategoricalCrossEntropy if fused_softmax => (pred - target) / n,
            Loss::CategoricalCrossEntropy => {
                let mut grad = target.clone();
                Zip::from(&mut grad).and(pred).for_each(|g, &p| {
                    *g = -*g / (p.clamp(EPSILON, 1.0 - EPSILON) * n);
                });
                grad
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    MeanAbsoluteError,
    Accuracy,
}

impl Metric {
    pub fn compute(self, pred: &Array2<f32>, target: &Array2<f32>) -> f32 {
        let n = pred.nrows();
        if n == 0 {
            return 0.0;
        }
        match self {
            Metric::MeanAbsoluteError => (pred - target).mapv(f32::abs).mean().unwrap_or(0.0),
            Metric::Accuracy => {
                let hits = pred
                    .rows()
                    .into_iter()
                    .zip(target.rows())
                    .filter(|(p, t)| argmax(p.iter().copied()) == argmax(t.iter().copied()))
                    .count();
                hits as f32 / n as f32
            }
        }
    }
}

/// Index of the largest value; the first one on ties.
pub fn argmax(values: impl Iterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.enumerate() {
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// Adam
// ---------------------------------------------------------------------------

struct Moments {
    m_w: Array2<f32>,
    v_w: Array2<f32>,
    m_b: Array1<f32>,
    v_b: Array1<f32>,
}

impl Moments {
    fn zeros(layer: &Dense) -> Self {
        Self {
            m_w: Array2::zeros(layer.weights.raw_dim()),
            v_w: Array2::zeros(layer.weights.raw_dim()),
            m_b: Array1::zeros(layer.bias.raw_dim()),
            v_b: Array1::zeros(layer.bias.raw_dim()),
        }
    }
}

pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    step: i32,
    moments: Vec<Option<Moments>>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            moments: Vec::new(),
        }
    }

    fn apply(&mut self, layers: &mut [Layer], grads: &Gradients) {
        if self.moments.len() != layers.len() {
            self.moments = layers.iter().map(|_| None).collect();
        }
        self.step += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step);
        let bc2 = 1.0 - self.beta2.powi(self.step);
        let hp = (self.learning_rate, self.beta1, self.beta2, self.epsilon, bc1, bc2);

        for ((layer, grad), slot) in layers.iter_mut().zip(grads).zip(self.moments.iter_mut()) {
            let (Layer::Dense(dense), Some((g_w, g_b))) = (layer, grad) else {
                continue;
            };
            let m = slot.get_or_insert_with(|| Moments::zeros(dense));
            adam_update(&mut dense.weights, &mut m.m_w, &mut m.v_w, g_w, hp);
            adam_update(&mut dense.bias, &mut m.m_b, &mut m.v_b, g_b, hp);
        }
    }
}

fn adam_update<D: Dimension>(
    param: &mut Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    (lr, beta1, beta2, eps, bc1, bc2): (f32, f32, f32, f32, f32, f32),
) {
    Zip::from(param)
        .and(m)
        .and(v)
        .and(grad)
        .for_each(|p, m, v, &g| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        });
}

// ---------------------------------------------------------------------------
// Fitting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// Fraction of trailing samples held out for validation.
    pub validation_split: f32,
    pub shuffle: bool,
    pub metric: Metric,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f32>,
    pub metric: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub val_metric: Vec<f32>,
    pub train_samples: usize,
    pub validation_samples: usize,
}

impl TrainingHistory {
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.loss.last().copied()
    }

    pub fn final_val_loss(&self) -> Option<f32> {
        self.val_loss.last().copied()
    }

    pub fn final_val_metric(&self) -> Option<f32> {
        self.val_metric.last().copied()
    }
}

// ---------------------------------------------------------------------------
// Sequential
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequential {
    input_dim: usize,
    layers: Vec<Layer>,
}

impl Sequential {
    /// Build a freshly initialised network.
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        specs: &[LayerSpec],
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if input_dim == 0 {
            return Err(ModelError::Architecture("input dimension must be positive".into()));
        }
        let mut layers = Vec::with_capacity(specs.len());
        let mut width = input_dim;
        for spec in specs {
            match *spec {
                LayerSpec::Dense { units, activation } => {
                    if units == 0 {
                        return Err(ModelError::Architecture("dense layer with zero units".into()));
                    }
                    layers.push(Layer::Dense(Dense::glorot(width, units, activation, rng)));
                    width = units;
                }
                LayerSpec::Dropout { rate } => {
                    if !(0.0..1.0).contains(&rate) {
                        return Err(ModelError::Architecture(format!(
                            "dropout rate must be within [0, 1), got {rate}"
                        )));
                    }
                    layers.push(Layer::Dropout { rate });
                }
            }
        }
        if !layers.iter().any(|l| matches!(l, Layer::Dense(_))) {
            return Err(ModelError::Architecture("network has no dense layer".into()));
        }
        Ok(Self { input_dim, layers })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.layers
            .iter()
            .rev()
            .find_map(|l| match l {
                Layer::Dense(d) => Some(d.units()),
                Layer::Dropout { .. } => None,
            })
            .unwrap_or(self.input_dim)
    }

    pub fn specs(&self) -> Vec<LayerSpec> {
        self.layers.iter().map(Layer::spec).collect()
    }

    /// Check that deserialized weights chain together and are finite.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut width = self.input_dim;
        for (i, layer) in self.layers.iter().enumerate() {
            match layer {
                Layer::Dense(d) => {
                    if d.weights.nrows() != width || d.bias.len() != d.weights.ncols() {
                        return Err(ModelError::ShapeMismatch {
                            expected: format!("layer {i}: {width} inputs, bias of {}", d.weights.ncols()),
                            actual: format!("{:?} weights, bias of {}", d.weights.dim(), d.bias.len()),
                        });
                    }
                    if d.weights.iter().chain(d.bias.iter()).any(|v| !v.is_finite()) {
                        return Err(ModelError::IncompatibleArtifact(format!(
                            "layer {i} holds non-finite weights"
                        )));
                    }
                    width = d.weights.ncols();
                }
                Layer::Dropout { rate } => {
                    if !(0.0..1.0).contains(rate) {
                        return Err(ModelError::Architecture(format!(
                            "layer {i}: dropout rate {rate} out of range"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_input(&self, cols: usize) -> Result<(), ModelError> {
        if cols != self.input_dim {
            return Err(ModelError::ShapeMismatch {
                expected: format!("{} features", self.input_dim),
                actual: format!("{cols} features"),
            });
        }
        Ok(())
    }

    /// Inference forward pass. Dropout is the identity here.
    pub fn predict(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>, ModelError> {
        self.check_input(x.ncols())?;
        let mut a = x.to_owned();
        for layer in &self.layers {
            if let Layer::Dense(d) = layer {
                a = d.forward(&a);
            }
        }
        Ok(a)
    }

    /// Forward pass for a single feature row.
    pub fn predict_one(&self, features: &[f32]) -> Result<Vec<f32>, ModelError> {
        let x = ArrayView2::from_shape((1, features.len()), features).map_err(|e| {
            ModelError::ShapeMismatch {
                expected: format!("1x{}", self.input_dim),
                actual: e.to_string(),
            }
        })?;
        Ok(self.predict(x)?.iter().copied().collect())
    }

    fn forward_train<R: Rng + ?Sized>(&self, x: &Array2<f32>, rng: &mut R) -> (Vec<Cache>, Array2<f32>) {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut a = x.clone();
        for layer in &self.layers {
            match layer {
                Layer::Dense(d) => {
                    let out = d.forward(&a);
                    caches.push(Cache::Dense {
                        input: a,
                        output: out.clone(),
                    });
                    a = out;
                }
                Layer::Dropout { rate } => {
                    let keep = 1.0 - rate;
                    let mask = Array2::from_shape_fn(a.raw_dim(), |_| {
                        if rng.gen::<f32>() < *rate {
                            0.0
                        } else {
                            1.0 / keep
                        }
                    });
                    a = &a * &mask;
                    caches.push(Cache::Dropout { mask });
                }
            }
        }
        (caches, a)
    }

    fn backward(&self, caches: &[Cache], output_grad: Array2<f32>, fused_softmax: bool) -> Gradients {
        let last_dense = self.layers.iter().rposition(|l| matches!(l, Layer::Dense(_)));
        let mut grads: Gradients = vec![None; self.layers.len()];
        let mut grad = output_grad;

        for (i, (layer, cache)) in self.layers.iter().zip(caches).enumerate().rev() {
            match (layer, cache) {
                (Layer::Dense(d), Cache::Dense { input, output }) => {
                    let dz = if fused_softmax && Some(i) == last_dense {
                        grad
                    } else {
                        d.activation.backward(output, &grad)
                    };
                    let d_w = input.t().dot(&dz);
                    let d_b = dz.sum_axis(Axis(0));
                    grad = dz.dot(&d.weights.t());
                    grads[i] = Some((d_w, d_b));
                }
                (Layer::Dropout { .. }, Cache::Dropout { mask }) => {
                    grad = grad * mask;
                }
                // Caches are produced layer by layer, so kinds always line up.
                _ => {}
            }
        }
        grads
    }

    fn ends_in_softmax(&self) -> bool {
        self.layers
            .iter()
            .rev()
            .find_map(|l| match l {
                Layer::Dense(d) => Some(d.activation == Activation::Softmax),
                Layer::Dropout { .. } => None,
            })
            .unwrap_or(false)
    }

    /// Mini-batch training. The trailing `validation_split` fraction of the
    /// rows is held out and evaluated after every epoch.
    pub fn fit<R: Rng + ?Sized>(
        &mut self,
        x: &Array2<f32>,
        y: &Array2<f32>,
        loss: Loss,
        optimizer: &mut Adam,
        options: &FitOptions,
        rng: &mut R,
    ) -> Result<TrainingHistory, ModelError> {
        let n = x.nrows();
        if n == 0 {
            return Err(ModelError::EmptyDataset);
        }
        self.check_input(x.ncols())?;
        if y.nrows() != n || y.ncols() != self.output_dim() {
            return Err(ModelError::ShapeMismatch {
                expected: format!("{n}x{} targets", self.output_dim()),
                actual: format!("{}x{} targets", y.nrows(), y.ncols()),
            });
        }

        let mut n_val = (n as f32 * options.validation_split.clamp(0.0, 1.0)).floor() as usize;
        if n_val >= n {
            n_val = 0;
        }
        let n_train = n - n_val;
        let x_train = x.slice(s![..n_train, ..]);
        let y_train = y.slice(s![..n_train, ..]);
        let x_val = x.slice(s![n_train.., ..]);
        let y_val = y.slice(s![n_train.., ..]).to_owned();

        let fused = loss == Loss::CategoricalCrossEntropy && self.ends_in_softmax();
        let batch_size = options.batch_size.max(1);
        let mut indices: Vec<usize> = (0..n_train).collect();
        let mut history = TrainingHistory {
            train_samples: n_train,
            validation_samples: n_val,
            ..TrainingHistory::default()
        };

        for epoch in 0..options.epochs {
            if options.shuffle {
                indices.shuffle(rng);
            }
            let mut loss_sum = 0.0;
            let mut metric_sum = 0.0;
            for batch in indices.chunks(batch_size) {
                let xb = x_train.select(Axis(0), batch);
                let yb = y_train.select(Axis(0), batch);
                let (caches, pred) = self.forward_train(&xb, rng);
                let weight = batch.len() as f32;
                loss_sum += loss.compute(&pred, &yb) * weight;
                metric_sum += options.metric.compute(&pred, &yb) * weight;

                let grad = loss.gradient(&pred, &yb, fused);
                let grads = self.backward(&caches, grad, fused);
                optimizer.apply(&mut self.layers, &grads);
            }
            let epoch_loss = loss_sum / n_train as f32;
            history.loss.push(epoch_loss);
            history.metric.push(metric_sum / n_train as f32);

            if n_val > 0 {
                let pred = self.predict(x_val)?;
                history.val_loss.push(loss.compute(&pred, &y_val));
                history.val_metric.push(options.metric.compute(&pred, &y_val));
            }

            if !epoch_loss.is_finite() {
                return Err(ModelError::NonFinite);
            }
            if (epoch + 1) % 10 == 0 {
                tracing::debug!(
                    epoch = epoch + 1,
                    loss = epoch_loss,
                    val_loss = history.final_val_loss(),
                    "training progress"
                );
            }
        }

        Ok(history)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let net: Sequential = serde_json::from_slice(bytes)?;
        net.validate()?;
        Ok(net)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
