//! # single-propeller
//!
//! A specialized Rust library for testing differences in cell-type proportions between
//! experimental conditions, part of the single-rust ecosystem.
//!
//! Cluster counts per sample are turned into proportions, variance-stabilised (logit or
//! arcsine square root), and fitted category by category with a linear model against a
//! one-hot condition design. Per-category variances are moderated with empirical Bayes
//! before a moderated t-test (two conditions) or moderated F-test (three or more) is
//! performed, and p-values are corrected for multiple testing.
//!
//! When every condition is represented by a single sample, pseudo-replicates are
//! bootstrapped from the counts, the test is repeated many times and the estimates are
//! pooled.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use single_propeller::data::CellAnnotations;
//! use single_propeller::propeller::{propeller, PropellerConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cells = CellAnnotations::new(
//!     vec!["s1", "s1", "s2", "s2", "s3", "s3", "s4", "s4"],
//!     vec!["ctrl", "ctrl", "ctrl", "ctrl", "stim", "stim", "stim", "stim"],
//!     vec!["T", "B", "T", "T", "B", "B", "T", "B"],
//! )?;
//! let out = propeller(&cells, &PropellerConfig::default())?;
//! println!("{:?}", out.results.adjusted_p_values());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - **[`data`]**: Count matrices, per-cell annotations and sample/condition sheets
//! - **[`transform`]**: Proportions, logit/arcsin transforms and fit weights
//! - **[`model`]**: Design matrices, weighted linear models and contrasts
//! - **[`testing`]**: Empirical Bayes moderation, moderated t/F tests and FDR correction
//! - **[`propeller`]**: The end-to-end test and its result table
//! - **[`simulation`]**: Bootstrap pseudo-replicates and pooling for unreplicated data

pub mod data;
pub mod error;
pub mod model;
pub mod propeller;
pub mod simulation;
pub mod testing;
pub mod transform;

pub use error::PropellerError;
