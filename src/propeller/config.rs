use crate::error::PropellerError;
use crate::transform::Transform;

/// Options of a proportion test.
///
/// ```
/// use single_propeller::propeller::PropellerConfig;
/// use single_propeller::transform::Transform;
///
/// let config = PropellerConfig::default()
///     .with_transform(Transform::Arcsin)
///     .with_n_sims(20)
///     .with_seed(7);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PropellerConfig {
    /// Variance-stabilising transform of the proportions. The simulation path always
    /// uses [`Transform::Arcsin`].
    pub transform: Transform,
    /// Robust empirical Bayes estimation of the variance prior.
    pub robust: bool,
    /// Bootstrap runs for unreplicated data.
    pub n_sims: usize,
    /// Pseudo-replicates drawn per sample for unreplicated data.
    pub n_reps: usize,
    /// Seed for the bootstrap, drawn from entropy when absent.
    pub seed: Option<u64>,
    /// Use the transform's weights in the linear fit.
    pub weighted: bool,
    /// Attempts per bootstrap run on average. All runs share a budget of
    /// `max_attempts_per_run × n_sims` attempts before the simulation gives up.
    pub max_attempts_per_run: usize,
}

impl Default for PropellerConfig {
    fn default() -> Self {
        PropellerConfig {
            transform: Transform::Logit,
            robust: true,
            n_sims: 100,
            n_reps: 8,
            seed: None,
            weighted: false,
            max_attempts_per_run: 10,
        }
    }
}

impl PropellerConfig {
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    pub fn with_n_sims(mut self, n_sims: usize) -> Self {
        self.n_sims = n_sims;
        self
    }

    pub fn with_n_reps(mut self, n_reps: usize) -> Self {
        self.n_reps = n_reps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_weighted(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }

    pub fn with_max_attempts_per_run(mut self, max_attempts: usize) -> Self {
        self.max_attempts_per_run = max_attempts;
        self
    }

    /// Reject settings no test can run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_sims == 0 {
            return Err(PropellerError::Input("n_sims must be at least 1".into()).into());
        }
        if self.n_reps < 2 {
            return Err(PropellerError::Input(format!(
                "n_reps must be at least 2, got {}",
                self.n_reps
            ))
            .into());
        }
        if self.max_attempts_per_run == 0 {
            return Err(
                PropellerError::Input("max_attempts_per_run must be at least 1".into()).into(),
            );
        }
        Ok(())
    }
}
