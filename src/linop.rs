//! Composable forward/adjoint operator pairs over complex N-d arrays
//!
//! Operators are immutable once constructed and only read their captured data, so a single
//! instance can be applied repeatedly and from several threads.

use crate::array_utils::zeros;
use crate::error::{ReconError, Result};
use crate::fft::{fftc, fftu, ifftc, ifftu};
use cfl::ndarray::{ArrayD, Axis, Slice, Zip};
use cfl::num_complex::Complex32;

pub trait LinearOperator: Send + Sync {
    /// shape of the arrays accepted by forward
    fn domain(&self) -> &[usize];
    /// shape of the arrays returned by forward
    fn codomain(&self) -> &[usize];
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32>;
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32>;
    /// A^H A x
    fn normal(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.adjoint(&self.forward(x))
    }
}

impl<T: LinearOperator + ?Sized> LinearOperator for Box<T> {
    fn domain(&self) -> &[usize] {
        (**self).domain()
    }
    fn codomain(&self) -> &[usize] {
        (**self).codomain()
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        (**self).forward(x)
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        (**self).adjoint(y)
    }
    fn normal(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        (**self).normal(x)
    }
}

fn check_shape(what: &'static str, expected: &[usize], x: &ArrayD<Complex32>) {
    assert_eq!(x.shape(), expected, "{} received an array of unexpected shape", what);
}

/// checks that `diag` can be broadcast against `dims` by stretching singleton axes
fn check_broadcast(what: &'static str, dims: &[usize], diag: &[usize]) -> Result<()> {
    let ok = dims.len() == diag.len() && dims.iter().zip(diag).all(|(&d, &w)| w == d || w == 1);
    if ok {
        Ok(())
    } else {
        Err(ReconError::DimensionMismatch {
            what,
            expected: dims.to_vec(),
            found: diag.to_vec(),
        })
    }
}

pub struct Identity {
    dims: Vec<usize>,
}

impl Identity {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }
}

impl LinearOperator for Identity {
    fn domain(&self) -> &[usize] {
        &self.dims
    }
    fn codomain(&self) -> &[usize] {
        &self.dims
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        check_shape("identity", &self.dims, x);
        x.clone()
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.forward(y)
    }
}

/// Elementwise multiplication by a real array. The weights have the same rank as the domain and
/// singleton axes are broadcast, so a 3-D sampling mask can act on multi-coil k-space.
pub struct RealDiag {
    dims: Vec<usize>,
    diag: ArrayD<f32>,
}

impl RealDiag {
    pub fn new(dims: &[usize], diag: ArrayD<f32>) -> Result<Self> {
        check_broadcast("real diagonal weights", dims, diag.shape())?;
        Ok(Self { dims: dims.to_vec(), diag })
    }
}

impl LinearOperator for RealDiag {
    fn domain(&self) -> &[usize] {
        &self.dims
    }
    fn codomain(&self) -> &[usize] {
        &self.dims
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        check_shape("real diagonal", &self.dims, x);
        let w = self.diag.broadcast(x.raw_dim()).expect("weights were checked to be broadcastable");
        let mut out = x.clone();
        Zip::from(&mut out).and(&w).par_for_each(|o, &w| *o *= w);
        out
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.forward(y)
    }
}

/// Elementwise multiplication by a complex array with singleton axes broadcast. The adjoint
/// multiplies by the conjugate.
pub struct ComplexDiag {
    dims: Vec<usize>,
    diag: ArrayD<Complex32>,
}

impl ComplexDiag {
    pub fn new(dims: &[usize], diag: ArrayD<Complex32>) -> Result<Self> {
        check_broadcast("complex diagonal weights", dims, diag.shape())?;
        Ok(Self { dims: dims.to_vec(), diag })
    }

    fn apply(&self, x: &ArrayD<Complex32>, conjugate: bool) -> ArrayD<Complex32> {
        check_shape("complex diagonal", &self.dims, x);
        let w = self.diag.broadcast(x.raw_dim()).expect("weights were checked to be broadcastable");
        let mut out = x.clone();
        if conjugate {
            Zip::from(&mut out).and(&w).par_for_each(|o, w| *o *= w.conj());
        } else {
            Zip::from(&mut out).and(&w).par_for_each(|o, &w| *o *= w);
        }
        out
    }
}

impl LinearOperator for ComplexDiag {
    fn domain(&self) -> &[usize] {
        &self.dims
    }
    fn codomain(&self) -> &[usize] {
        &self.dims
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.apply(x, false)
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.apply(y, true)
    }
}

/// Unitary fft over a subset of axes. A centered transform keeps the zero frequency at n/2 in
/// both domains.
pub struct FftOp {
    dims: Vec<usize>,
    axes: Vec<usize>,
    centered: bool,
}

impl FftOp {
    pub fn new(dims: &[usize], axes: &[usize], centered: bool) -> Result<Self> {
        if let Some(&ax) = axes.iter().find(|&&ax| ax >= dims.len()) {
            return Err(ReconError::invalid("fft axes", format!("axis {} out of range for rank {}", ax, dims.len())));
        }
        Ok(Self { dims: dims.to_vec(), axes: axes.to_vec(), centered })
    }
}

impl LinearOperator for FftOp {
    fn domain(&self) -> &[usize] {
        &self.dims
    }
    fn codomain(&self) -> &[usize] {
        &self.dims
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        check_shape("fft", &self.dims, x);
        let mut out = x.clone();
        if self.centered {
            fftc(&mut out, &self.axes);
        } else {
            fftu(&mut out, &self.axes);
        }
        out
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        check_shape("ifft", &self.dims, y);
        let mut out = y.clone();
        if self.centered {
            ifftc(&mut out, &self.axes);
        } else {
            ifftu(&mut out, &self.axes);
        }
        out
    }
    fn normal(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        x.clone()
    }
}

/// copies the centered overlap of src into a zeroed array of shape dst_dims
fn resize_center(src: &ArrayD<Complex32>, dst_dims: &[usize]) -> ArrayD<Complex32> {
    let mut out = zeros(dst_dims);
    let mut src_view = src.view();
    let mut dst_view = out.view_mut();
    for (ax, (&i, &o)) in src.shape().iter().zip(dst_dims).enumerate() {
        let len = i.min(o);
        let src_start = i / 2 - len / 2;
        let dst_start = o / 2 - len / 2;
        src_view.slice_axis_inplace(Axis(ax), Slice::from(src_start..src_start + len));
        dst_view.slice_axis_inplace(Axis(ax), Slice::from(dst_start..dst_start + len));
    }
    dst_view.assign(&src_view);
    out
}

/// Centered zero-padding or cropping. The sample at index n/2 of every axis stays aligned.
pub struct ResizeOp {
    idims: Vec<usize>,
    odims: Vec<usize>,
}

impl ResizeOp {
    pub fn new(idims: &[usize], odims: &[usize]) -> Result<Self> {
        if idims.len() != odims.len() {
            return Err(ReconError::DimensionMismatch {
                what: "resize rank",
                expected: idims.to_vec(),
                found: odims.to_vec(),
            });
        }
        Ok(Self { idims: idims.to_vec(), odims: odims.to_vec() })
    }
}

impl LinearOperator for ResizeOp {
    fn domain(&self) -> &[usize] {
        &self.idims
    }
    fn codomain(&self) -> &[usize] {
        &self.odims
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        check_shape("resize", &self.idims, x);
        resize_center(x, &self.odims)
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        check_shape("resize adjoint", &self.odims, y);
        resize_center(y, &self.idims)
    }
}

/// Composition `second ∘ first`
pub struct Chain {
    first: Box<dyn LinearOperator>,
    second: Box<dyn LinearOperator>,
}

impl LinearOperator for Chain {
    fn domain(&self) -> &[usize] {
        self.first.domain()
    }
    fn codomain(&self) -> &[usize] {
        self.second.codomain()
    }
    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.second.forward(&self.first.forward(x))
    }
    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        self.first.adjoint(&self.second.adjoint(y))
    }
}

/// Chains two operators so that `first` is applied before `second`. Fails if the codomain of
/// `first` is not the domain of `second`.
pub fn chain<A, B>(first: A, second: B) -> Result<Chain>
where
    A: LinearOperator + 'static,
    B: LinearOperator + 'static,
{
    if first.codomain() != second.domain() {
        return Err(ReconError::OperatorMismatch {
            codomain: first.codomain().to_vec(),
            domain: second.domain().to_vec(),
        });
    }
    Ok(Chain { first: Box::new(first), second: Box::new(second) })
}

/// Relative violation of <Ax, y> = <x, A^H y> for random x and y. Used by the operator tests.
#[cfg(test)]
pub(crate) fn adjoint_error(op: &dyn LinearOperator, seed: u64) -> f64 {
    use crate::array_utils::{random_array, zdot};
    let x = random_array(op.domain(), seed);
    let y = random_array(op.codomain(), seed + 1);
    let lhs = zdot(&op.forward(&x), &y);
    let rhs = zdot(&x, &op.adjoint(&y));
    (lhs - rhs).norm() / lhs.norm().max(rhs.norm()).max(f64::MIN_POSITIVE)
}
