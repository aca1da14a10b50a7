// Forward and adjoint MRI signal model
// the purpose of this module is to map images to multi-coil k-space and back, accounting for coil
// sensitivities (one or more ESPIRiT maps) and the sampling pattern

use crate::array_utils::{spatial_dims, zeros, COIL_DIM, MAPS_DIM, N_SPATIAL};
use crate::error::{ReconError, Result};
use crate::fftshift::{fftmod, PhaseShiftDir};
use crate::linop::{chain, Chain, FftOp, LinearOperator, RealDiag};
use cfl::ndarray::{ArrayD, Axis, Zip};
use cfl::num_complex::Complex32;
use std::sync::Arc;

/// Multiplication by coil sensitivities. Images are (x, y, z, map), coil images are
/// (x, y, z, coil). The forward operator sums over maps, the adjoint sums over coils.
pub struct SensitivityOp {
    maps: Arc<ArrayD<Complex32>>,
    image_dims: Vec<usize>,
    coil_dims: Vec<usize>,
}

impl SensitivityOp {
    pub fn new(maps: Arc<ArrayD<Complex32>>) -> Result<Self> {
        if maps.ndim() != 5 {
            return Err(ReconError::DimensionMismatch {
                what: "sensitivity map rank",
                expected: vec![5],
                found: vec![maps.ndim()],
            });
        }
        let [nx, ny, nz] = spatial_dims(maps.shape());
        let n_coils = maps.len_of(Axis(COIL_DIM));
        let n_maps = maps.len_of(Axis(MAPS_DIM));
        Ok(Self {
            maps,
            image_dims: vec![nx, ny, nz, n_maps],
            coil_dims: vec![nx, ny, nz, n_coils],
        })
    }
}

impl LinearOperator for SensitivityOp {
    fn domain(&self) -> &[usize] {
        &self.image_dims
    }

    fn codomain(&self) -> &[usize] {
        &self.coil_dims
    }

    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        assert_eq!(x.shape(), self.image_dims.as_slice(), "unexpected image shape");
        let mut out = zeros(&self.coil_dims);
        for m in 0..self.image_dims[N_SPATIAL] {
            let map = self.maps.index_axis(Axis(MAPS_DIM), m);
            let img = x.index_axis(Axis(N_SPATIAL), m).insert_axis(Axis(COIL_DIM));
            let img = img.broadcast(map.raw_dim()).expect("image and map spatial dims agree");
            Zip::from(&mut out).and(&map).and(&img).par_for_each(|o, &s, &v| *o += s * v);
        }
        out
    }

    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        assert_eq!(y.shape(), self.coil_dims.as_slice(), "unexpected coil image shape");
        let mut out = zeros(&self.image_dims);
        for m in 0..self.image_dims[N_SPATIAL] {
            let map = self.maps.index_axis(Axis(MAPS_DIM), m);
            let mut img = out.index_axis_mut(Axis(N_SPATIAL), m);
            for c in 0..self.coil_dims[N_SPATIAL] {
                Zip::from(&mut img)
                    .and(map.index_axis(Axis(COIL_DIM), c))
                    .and(y.index_axis(Axis(COIL_DIM), c))
                    .par_for_each(|o, s, &k| *o += s.conj() * k);
            }
        }
        out
    }
}

/// The SENSE encoding operator: sampling ∘ fft ∘ sensitivities. The fft is uncentered, so
/// k-space and maps are expected to be modulated with [fftmod] beforehand.
pub struct EncodingOperator {
    op: Chain,
}

impl EncodingOperator {
    /// Builds the operator from sensitivity maps (x, y, z, coil, map) and a real sampling pattern
    /// (x, y, z). Spatial dims must agree and the pattern must be non-negative.
    pub fn new(maps: Arc<ArrayD<Complex32>>, pattern: &ArrayD<f32>) -> Result<Self> {
        let sens = SensitivityOp::new(maps)?;
        let coil_dims = sens.codomain().to_vec();

        if pattern.ndim() != N_SPATIAL || pattern.shape() != &coil_dims[0..N_SPATIAL] {
            return Err(ReconError::DimensionMismatch {
                what: "sampling pattern",
                expected: coil_dims[0..N_SPATIAL].to_vec(),
                found: pattern.shape().to_vec(),
            });
        }
        if let Some(bad) = pattern.iter().find(|&&p| !(p >= 0.) || !p.is_finite()) {
            return Err(ReconError::InvalidPattern(format!("pattern values must be finite and non-negative, found {}", bad)));
        }

        let fft = FftOp::new(&coil_dims, &[0, 1, 2], false)?;
        let mask = RealDiag::new(&coil_dims, pattern.clone().insert_axis(Axis(COIL_DIM)))?;
        let op = chain(chain(sens, fft)?, mask)?;
        Ok(Self { op })
    }

    /// (x, y, z, map)
    pub fn image_dims(&self) -> &[usize] {
        self.op.domain()
    }

    /// (x, y, z, coil)
    pub fn kspace_dims(&self) -> &[usize] {
        self.op.codomain()
    }
}

impl LinearOperator for EncodingOperator {
    fn domain(&self) -> &[usize] {
        self.op.domain()
    }
    fn codomain(&self) -> &[usize] {
        self.op.codomain()
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.op.forward(x)
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.op.adjoint(y)
    }
}

/// Simulates centered multi-coil k-space of an image. The result is what a scanner would hand
/// to the reconstruction, so running it through the preprocessing and encoding model gives the
/// image back exactly.
pub fn simulate_kspace(image: &ArrayD<Complex32>, maps: &ArrayD<Complex32>, pattern: &ArrayD<f32>) -> Result<ArrayD<Complex32>> {
    let mut maps = maps.clone();
    fftmod(&mut maps, &[0, 1, 2], PhaseShiftDir::Forward);
    let enc = EncodingOperator::new(Arc::new(maps), pattern)?;
    if image.shape() != enc.image_dims() {
        return Err(ReconError::DimensionMismatch {
            what: "simulated image",
            expected: enc.image_dims().to_vec(),
            found: image.shape().to_vec(),
        });
    }
    let mut ksp = enc.forward(image);
    fftmod(&mut ksp, &[0, 1, 2], PhaseShiftDir::Inverse);
    Ok(ksp)
}
