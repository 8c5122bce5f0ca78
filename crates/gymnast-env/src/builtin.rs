use crate::{CartPole, Corridor, EnvError, Environment, EnvironmentFactory};

/// Factory for the tasks implemented in this crate.
#[derive(Default, Debug, Clone, Copy)]
pub struct BuiltinEnvironments {}

impl BuiltinEnvironments {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

impl EnvironmentFactory for BuiltinEnvironments {
    fn task_names(&self) -> Vec<&str> {
        vec![CartPole::TASK_NAME, Corridor::TASK_NAME]
    }

    fn make(&self, task: &str, seed: u64) -> Result<Box<dyn Environment>, EnvError> {
        match task {
            CartPole::TASK_NAME => Ok(Box::new(CartPole::new(seed))),
            Corridor::TASK_NAME => Ok(Box::new(Corridor::new(seed))),
            _ => Err(EnvError::UnknownTask {
                task: task.to_owned(),
            }),
        }
    }
}
