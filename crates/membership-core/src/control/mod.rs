//! Autonomous control loops, as sans-IO state machines.
//!
//! - [`AutoSeeder`]: join via seed addresses, retrying until one answers
//! - [`AutoHealer`]: periodic anti-entropy with one random peer
//! - [`AutoDropper`]: probe cadence and eviction of dead members

pub mod dropper;
pub mod healer;
pub mod seeder;

pub use dropper::{AutoDropper, DropperAction};
pub use healer::AutoHealer;
pub use seeder::{AutoSeeder, JoinStart, SeederEvent};
