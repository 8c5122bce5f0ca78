//! Tangled program graph populations.
//!
//! This crate provides a [`PopulationManager`](gymnast_training::population::PopulationManager)
//! that can be plugged into the generation loop of `gymnast-training`.
//!
//! # Building Blocks
//!
//! - [`program::Program`] - register-machine program computing a bid from an observation
//! - [`graph::Learner`] - a program plus the action taken when its bid wins
//! - [`graph::Team`] - a set of learners; a team no learner points to is a root
//! - [`policy::TeamPolicy`] - snapshot of the graph below one root, acting as an agent
//! - [`trainer::Trainer`] - the population and its evolution
//!
//! # Example
//!
//! ```
//! use gymnast_tpg::trainer::{Trainer, TrainerParams};
//! use gymnast_training::population::PopulationManager as _;
//!
//! let trainer = Trainer::new(TrainerParams::new(20, 2), 42).unwrap();
//! assert_eq!(trainer.agents().len(), 20);
//! ```

pub mod graph;
pub mod policy;
pub mod program;
pub mod trainer;
