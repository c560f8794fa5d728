use faer::diag::DiagRef;
use faer::linalg::solvers;
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

/// Relative cutoff below which eigenvalues are treated as zero by [`pseudo_inverse_symmetric`].
const PINV_RELATIVE_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix contains non-finite entries")]
    NonFinite,
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

fn array_to_mat<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    let (rows, cols) = array.dim();
    Mat::from_fn(rows, cols, |i, j| array[(i, j)])
}

pub trait FaerEigh {
    /// Eigenvalues in ascending order with the matching eigenvectors as columns.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), LinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(LinalgError::NotSquare { rows, cols });
        }
        if self.iter().any(|v| !v.is_finite()) {
            return Err(LinalgError::NonFinite);
        }
        let mat = array_to_mat(self);
        let eigen = mat
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(LinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix through its eigendecomposition.
///
/// Eigenvalues whose magnitude falls below `1e-12 * max|lambda|` are dropped, so a
/// rank-deficient covariance yields the inverse on its support instead of an error.
pub fn pseudo_inverse_symmetric<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
) -> Result<Array2<f64>, LinalgError> {
    let n = matrix.nrows();
    if n == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    let (values, vectors) = matrix.eigh(Side::Lower)?;
    let largest = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let cutoff = largest * PINV_RELATIVE_TOLERANCE;

    let mut inverse = Array2::<f64>::zeros((n, n));
    for (k, &lambda) in values.iter().enumerate() {
        if lambda.abs() <= cutoff {
            continue;
        }
        let v = vectors.column(k);
        let scale = 1.0 / lambda;
        for i in 0..n {
            let vi = v[i] * scale;
            if vi == 0.0 {
                continue;
            }
            for j in 0..n {
                inverse[(i, j)] += vi * v[j];
            }
        }
    }
    Ok(inverse)
}
