use crate::array_utils::{zeros, N_SPATIAL};
use crate::fftshift::circshift;
use crate::linop::LinearOperator;
use cfl::ndarray::{ArrayD, Axis, Zip};
use cfl::num_complex::Complex32;

/// Periodic forward differences along the non-singleton spatial axes. The gradient components
/// are stacked along a new trailing axis, so an image (x, y, z, map) maps to
/// (x, y, z, map, n_axes).
pub struct TvOp {
    dims: Vec<usize>,
    grad_dims: Vec<usize>,
    axes: Vec<usize>,
}

impl TvOp {
    pub fn new(dims: &[usize]) -> Self {
        let axes: Vec<usize> = (0..N_SPATIAL.min(dims.len())).filter(|&a| dims[a] > 1).collect();
        let mut grad_dims = dims.to_vec();
        grad_dims.push(axes.len());
        Self { dims: dims.to_vec(), grad_dims, axes }
    }

    /// axis holding the gradient components
    pub fn gradient_axis(&self) -> usize {
        self.dims.len()
    }

    /// sum over voxels of the gradient magnitude
    pub fn isotropic_norm(&self, grad: &ArrayD<Complex32>) -> f64 {
        grad.lanes(Axis(self.gradient_axis()))
            .into_iter()
            .map(|lane| lane.iter().map(|v| v.norm_sqr() as f64).sum::<f64>().sqrt())
            .sum()
    }

    fn shift_for(&self, axis: usize, s: i32) -> Vec<i32> {
        let mut shift = vec![0; N_SPATIAL];
        shift[axis] = s;
        shift
    }
}

impl LinearOperator for TvOp {
    fn domain(&self) -> &[usize] {
        &self.dims
    }

    fn codomain(&self) -> &[usize] {
        &self.grad_dims
    }

    fn forward(&self, x: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        assert_eq!(x.shape(), self.dims.as_slice(), "unexpected tv input shape");
        let mut out = zeros(&self.grad_dims);
        for (j, &a) in self.axes.iter().enumerate() {
            // next[i] = x[i + 1]
            let mut next = x.clone();
            circshift(&mut next, &self.shift_for(a, -1));
            Zip::from(out.index_axis_mut(Axis(self.gradient_axis()), j))
                .and(&next)
                .and(x)
                .par_for_each(|d, &n, &v| *d = n - v);
        }
        out
    }

    fn adjoint(&self, y: &ArrayD<Complex32>) -> ArrayD<Complex32> {
        assert_eq!(y.shape(), self.grad_dims.as_slice(), "unexpected tv gradient shape");
        let mut out = zeros(&self.dims);
        for (j, &a) in self.axes.iter().enumerate() {
            let g = y.index_axis(Axis(self.gradient_axis()), j).to_owned();
            // prev[i] = g[i - 1]
            let mut prev = g.clone();
            circshift(&mut prev, &self.shift_for(a, 1));
            Zip::from(&mut out).and(&prev).and(&g).par_for_each(|o, &p, &v| *o += p - v);
        }
        out
    }
}
