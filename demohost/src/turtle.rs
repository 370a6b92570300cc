//! A turtle that walks on a bounded grid
//!
//! Every capability builds an [`AsyncMethod`] that the turtle's own
//! [`MethodQueue`] advances once per host tick. Movement and turning share the
//! "movement" category, so queued moves run one after another.

use blockly_bridge::{new_guid, AsyncFunction, AsyncMethod, MethodQueue, Programmable};
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

pub const GRID_SIZE: i32 = 10;
pub const MOVEMENT_CATEGORY: &str = "movement";

/// Ticks needed to walk one cell or make one quarter turn
pub const FRAMES_PER_STEP: u32 = 10;
const SPEECH_FRAMES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heading {
    North,
    East,
    South,
    West,
}

impl Heading {
    fn right(self) -> Self {
        match self {
            Heading::North => Heading::East,
            Heading::East => Heading::South,
            Heading::South => Heading::West,
            Heading::West => Heading::North,
        }
    }

    fn delta(self) -> (i32, i32) {
        match self {
            Heading::North => (0, 1),
            Heading::East => (1, 0),
            Heading::South => (0, -1),
            Heading::West => (-1, 0),
        }
    }
}

/// Turn options in the order the client lists them
pub const TURN_OPTIONS: [&str; 3] = ["Left", "Right", "Around"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pose {
    pub x: i32,
    pub y: i32,
    pub heading: Heading,
    /// Set when a move hit the edge; cleared by [`Turtle::take_bump`]
    pub bumped: bool,
}

impl Pose {
    fn home() -> Self {
        Self {
            x: GRID_SIZE / 2,
            y: GRID_SIZE / 2,
            heading: Heading::North,
            bumped: false,
        }
    }

    fn ahead(&self) -> (i32, i32) {
        let (dx, dy) = self.heading.delta();
        (self.x + dx, self.y + dy)
    }

    fn blocked(&self) -> bool {
        let (x, y) = self.ahead();
        !(0..GRID_SIZE).contains(&x) || !(0..GRID_SIZE).contains(&y)
    }
}

type SharedPose = Arc<Mutex<Pose>>;

fn lock(pose: &SharedPose) -> std::sync::MutexGuard<'_, Pose> {
    pose.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Walk one cell. Returns false (and records a bump) at the edge.
fn step_forward(pose: &SharedPose) -> bool {
    let mut pose = lock(pose);
    if pose.blocked() {
        pose.bumped = true;
        return false;
    }
    (pose.x, pose.y) = pose.ahead();
    true
}

pub struct Turtle {
    guid: String,
    name: String,
    pose: SharedPose,
    queue: Mutex<MethodQueue>,
}

impl Turtle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            guid: new_guid(),
            name: name.into(),
            pose: Arc::new(Mutex::new(Pose::home())),
            queue: Mutex::new(MethodQueue::new()),
        }
    }

    pub fn pose(&self) -> Pose {
        lock(&self.pose).clone()
    }

    /// Advance queued capabilities by one frame
    pub fn tick(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tick();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether a bump happened since the last call
    pub fn take_bump(&self) -> bool {
        std::mem::take(&mut lock(&self.pose).bumped)
    }

    /// Walk `steps` cells, stopping early at the edge of the grid
    pub fn move_forward(&self, steps: u32) -> AsyncMethod {
        let pose = Arc::clone(&self.pose);
        let mut remaining = steps;
        let mut frames = 0;
        AsyncMethod::new()
            .blocking_category(MOVEMENT_CATEGORY)
            .update_until(move || {
                if remaining == 0 {
                    return true;
                }
                frames += 1;
                if frames < FRAMES_PER_STEP {
                    return false;
                }
                frames = 0;
                if !step_forward(&pose) {
                    return true;
                }
                remaining -= 1;
                remaining == 0
            })
    }

    /// Turn by the option at `direction` in [`TURN_OPTIONS`]
    pub fn turn(&self, direction: usize) -> AsyncMethod {
        let quarter_turns = match direction {
            0 => 3,
            1 => 1,
            _ => 2,
        };
        let pose = Arc::clone(&self.pose);
        AsyncMethod::new()
            .blocking_category(MOVEMENT_CATEGORY)
            .wait(FRAMES_PER_STEP * quarter_turns)
            .then(move || {
                let mut pose = lock(&pose);
                for _ in 0..quarter_turns {
                    pose.heading = pose.heading.right();
                }
            })
    }

    /// Show a speech bubble for a while
    pub fn say(&self, text: String) -> AsyncMethod {
        let name = self.name.clone();
        AsyncMethod::new()
            .then(move || info!(turtle = %name, "says: {}", text))
            .wait(SPEECH_FRAMES)
    }

    /// Whether the next move would hit the edge
    pub fn is_blocked(&self) -> AsyncFunction<bool> {
        let pose = Arc::clone(&self.pose);
        AsyncFunction::new().returns(move || lock(&pose).blocked())
    }
}

impl Programmable for Turtle {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue_method(&self, method: AsyncMethod) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enqueue(method);
    }

    /// Return to the middle of the grid facing north
    fn run_test(&self) {
        *lock(&self.pose) = Pose::home();
        info!(turtle = %self.name, "self-test: back home");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
