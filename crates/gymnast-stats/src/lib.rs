//! Statistical summaries for fitness values produced during training.
//!
//! # Modules
//!
//! - [`descriptive`]: min/max/mean/median/standard deviation of a set of scores
//!
//! # Examples
//!
//! ```
//! use gymnast_stats::descriptive::DescriptiveStats;
//!
//! let scores = [10.0, 20.0, 30.0];
//! let stats = DescriptiveStats::new(scores).unwrap();
//! assert_eq!(stats.mean, 20.0);
//! ```

pub mod descriptive;
