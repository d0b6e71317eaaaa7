//! Empirical Bayes moderation and the moderated tests built on it.

pub mod ebayes;
pub mod moderated;
pub mod special;

pub use ebayes::{fit_f_dist, fit_f_dist_robust, squeeze_var, FDistFit, SqueezedVariances};
pub use moderated::{ebayes_f, ebayes_t, ModeratedFit};
