//! Linear modelling of transformed proportions.
//!
//! - [`design`]: one-hot condition design matrices with optional confounders
//! - [`linear`]: per-category weighted least squares
//! - [`contrast`]: linear contrasts of fitted coefficients

pub mod contrast;
pub mod design;
pub mod linear;

pub use contrast::{contrasts_fit, ContrastFit};
pub use design::{create_design, DesignMatrix};
pub use linear::{lm_fit, LinearFit};
