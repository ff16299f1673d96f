//! Dense symmetric positive-definite solves.
//!
//! Both the 3x3 centroid refinement system and the large block system of the
//! super-resolution pass go through this single entry point.

use nalgebra::{Cholesky, DMatrix, DVector};

use crate::error::PsfError;

/// Solve `a * x = b` for a symmetric positive-definite `a`.
///
/// Consumes `a` (the factorization is done in place). Fails with
/// [`PsfError::SingularSystem`] when the matrix is not positive definite,
/// which is how ill-conditioned fits surface from the collaborating modules.
pub fn cholesky_solve(a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, PsfError> {
    let chol = Cholesky::new(a).ok_or(PsfError::SingularSystem)?;
    Ok(chol.solve(b))
}
