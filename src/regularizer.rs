use crate::error::Result;
use crate::linop::{Identity, LinearOperator};
use crate::params::{BpSenseParams, RegularizerKind};
use crate::prox::{ProximalOperator, SoftThresh};
use crate::tv::TvOp;
use crate::wavelet::{WaveletOp, WaveletThresh};
use cfl::ndarray::ArrayD;
use cfl::num_complex::Complex32;
use dwt::wavelet::WaveletType;
use std::sync::Arc;

/// A sparsity promoting l1 term. The ADMM solver sees it through `split_operator` (the G in
/// z = Gx) and `prox`, which thresholds in the codomain of `split_operator`.
pub trait SparsifyingTransform: Send + Sync {
    fn name(&self) -> &'static str;
    /// the transform whose coefficients are sparse
    fn transform(&self) -> &dyn LinearOperator;
    fn split_operator(&self) -> Arc<dyn LinearOperator>;
    fn prox(&self) -> Arc<dyn ProximalOperator>;
    /// weighted l1 norm of the transform coefficients of an image
    fn l1_norm(&self, image: &ArrayD<Complex32>) -> f64;
}

/// Wavelet sparsity. Because the transform is orthogonal the split variable lives in image space
/// and the whole decomposition happens inside the proximal step.
pub struct WaveletRegularizer {
    identity: Arc<Identity>,
    thresh: Arc<WaveletThresh>,
    weight: f32,
}

impl WaveletRegularizer {
    pub fn new(image_dims: &[usize], weight: f32, min_block: [usize; 3], rand_shift: bool, seed: Option<u64>) -> Result<Self> {
        let op = WaveletOp::new(image_dims, min_block, WaveletType::Daubechies2)?;
        Ok(Self {
            identity: Arc::new(Identity::new(image_dims)),
            thresh: Arc::new(WaveletThresh::new(op, weight, rand_shift, seed)),
            weight,
        })
    }
}

impl SparsifyingTransform for WaveletRegularizer {
    fn name(&self) -> &'static str {
        "wavelet"
    }
    fn transform(&self) -> &dyn LinearOperator {
        self.thresh.transform()
    }
    fn split_operator(&self) -> Arc<dyn LinearOperator> {
        self.identity.clone()
    }
    fn prox(&self) -> Arc<dyn ProximalOperator> {
        self.thresh.clone()
    }
    fn l1_norm(&self, image: &ArrayD<Complex32>) -> f64 {
        let w = self.thresh.transform();
        self.weight as f64 * w.detail_l1_norm(&w.forward(image))
    }
}

/// Isotropic total variation. The split variable holds the image gradient.
pub struct TvRegularizer {
    op: Arc<TvOp>,
    thresh: Arc<SoftThresh>,
    weight: f32,
}

impl TvRegularizer {
    pub fn new(image_dims: &[usize], weight: f32) -> Self {
        let op = TvOp::new(image_dims);
        let thresh = SoftThresh::new(weight, Some(op.gradient_axis()));
        Self { op: Arc::new(op), thresh: Arc::new(thresh), weight }
    }
}

impl SparsifyingTransform for TvRegularizer {
    fn name(&self) -> &'static str {
        "total variation"
    }
    fn transform(&self) -> &dyn LinearOperator {
        self.op.as_ref()
    }
    fn split_operator(&self) -> Arc<dyn LinearOperator> {
        self.op.clone()
    }
    fn prox(&self) -> Arc<dyn ProximalOperator> {
        self.thresh.clone()
    }
    fn l1_norm(&self, image: &ArrayD<Complex32>) -> f64 {
        self.weight as f64 * self.op.isotropic_norm(&self.op.forward(image))
    }
}

/// Builds the configured regularizer for images of shape (x, y, z, map). Block sizes larger than
/// the image are clamped to the image size.
pub fn build_regularizer(params: &BpSenseParams, image_dims: &[usize]) -> Result<Box<dyn SparsifyingTransform>> {
    Ok(match params.regularizer {
        RegularizerKind::Wavelet => Box::new(WaveletRegularizer::new(
            image_dims,
            params.l1_weight,
            params.min_wavelet_block,
            params.wavelet_rand_shift,
            params.rand_seed,
        )?),
        RegularizerKind::TotalVariation => Box::new(TvRegularizer::new(image_dims, params.l1_weight)),
    })
}
