//! Task environments that agents are evaluated against.
//!
//! An environment is an interactive simulation: it is reset to an initial
//! observation, then stepped one action at a time, returning the next observation,
//! a reward and whether a terminal state was reached.
//!
//! - [`Environment`] - one live simulation instance
//! - [`EnvironmentFactory`] - builds environment instances by task name
//! - [`BuiltinEnvironments`] - factory for the tasks shipped with this crate
//!
//! # Example
//!
//! ```
//! use gymnast_env::{BuiltinEnvironments, EnvironmentFactory as _};
//!
//! let factory = BuiltinEnvironments::new();
//! let mut env = factory.make("corridor", 7).unwrap();
//! let _observation = env.reset();
//! let step = env.step(1).unwrap();
//! assert!(step.reward < 0.0);
//! ```

use std::fmt;

use rand::Rng;

pub use self::{builtin::*, cart_pole::*, corridor::*};

mod builtin;
mod cart_pole;
mod corridor;

/// Index of a discrete action.
pub type Action = usize;

/// Encoded environment state handed to agents.
pub type Observation = Vec<f64>;

/// The set of valid actions of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpace {
    count: usize,
}

impl ActionSpace {
    #[must_use]
    pub const fn discrete(count: usize) -> Self {
        Self { count }
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn contains(&self, action: Action) -> bool {
        action < self.count
    }

    /// Draws a uniformly random valid action.
    ///
    /// # Panics
    ///
    /// Panics if the action space is empty.
    pub fn sample<R>(&self, rng: &mut R) -> Action
    where
        R: Rng + ?Sized,
    {
        assert!(self.count > 0, "cannot sample from an empty action space");
        rng.random_range(0..self.count)
    }
}

/// Result of stepping an environment by one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub observation: Observation,
    pub reward: f64,
    pub terminal: bool,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum EnvError {
    #[display("unknown task '{task}'")]
    UnknownTask { task: String },
    #[display("action {action} is outside the action space of {count} actions")]
    InvalidAction { action: Action, count: usize },
    #[display("environment stepped before reset")]
    NotReset,
    #[display("environment failure: {message}")]
    Simulation { message: String },
}

/// One live simulation instance of a task.
pub trait Environment: fmt::Debug + Send {
    /// Valid actions for [`Environment::step`].
    fn action_space(&self) -> ActionSpace;

    /// Starts a fresh episode and returns its initial observation.
    fn reset(&mut self) -> Observation;

    /// Advances the simulation by one frame.
    fn step(&mut self, action: Action) -> Result<Step, EnvError>;
}

/// Builds environment instances by task name.
pub trait EnvironmentFactory: fmt::Debug + Send + Sync {
    /// Names of all tasks this factory can build.
    fn task_names(&self) -> Vec<&str>;

    fn has_task(&self, task: &str) -> bool {
        self.task_names().contains(&task)
    }

    /// Creates a new environment for `task`, seeded with `seed`.
    fn make(&self, task: &str, seed: u64) -> Result<Box<dyn Environment>, EnvError>;
}

fn check_action(space: ActionSpace, action: Action) -> Result<(), EnvError> {
    if space.contains(action) {
        Ok(())
    } else {
        Err(EnvError::InvalidAction {
            action,
            count: space.count(),
        })
    }
}
