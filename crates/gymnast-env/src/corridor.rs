use rand::{Rng as _, SeedableRng as _};
use rand_pcg::Pcg64;

use crate::{Action, ActionSpace, EnvError, Environment, Observation, Step, check_action};

const LENGTH: u32 = 10;
const STEP_COST: f64 = -0.01;

/// One-dimensional walk between a pit and a goal.
///
/// Cells are numbered `0..=10`; cell `0` is a pit (reward `-1.0`, terminal) and
/// cell `10` is the goal (reward `1.0`, terminal). Every other move costs `0.01`.
/// Actions: `0` = left, `1` = right, `2` = stay. Each episode starts on a seeded
/// random cell in `3..=7`.
///
/// Observation: `[position / 10, 1 - position / 10]`.
#[derive(Debug, Clone)]
pub struct Corridor {
    rng: Pcg64,
    position: Option<u32>,
}

impl Corridor {
    pub const TASK_NAME: &'static str = "corridor";

    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg64::seed_from_u64(seed),
            position: None,
        }
    }

    fn observe(position: u32) -> Observation {
        let x = f64::from(position) / f64::from(LENGTH);
        vec![x, 1.0 - x]
    }
}

impl Environment for Corridor {
    fn action_space(&self) -> ActionSpace {
        ActionSpace::discrete(3)
    }

    fn reset(&mut self) -> Observation {
        let position = self.rng.random_range(3..=7);
        self.position = Some(position);
        Self::observe(position)
    }

    fn step(&mut self, action: Action) -> Result<Step, EnvError> {
        check_action(self.action_space(), action)?;
        let position = self.position.ok_or(EnvError::NotReset)?;
        if position == 0 || position == LENGTH {
            return Ok(Step {
                observation: Self::observe(position),
                reward: 0.0,
                terminal: true,
            });
        }

        let next = match action {
            0 => position - 1,
            1 => position + 1,
            _ => position,
        };
        self.position = Some(next);
        let (reward, terminal) = match next {
            0 => (-1.0, true),
            LENGTH => (1.0, true),
            _ => (STEP_COST, false),
        };
        Ok(Step {
            observation: Self::observe(next),
            reward,
            terminal,
        })
    }
}
