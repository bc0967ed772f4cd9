pub mod delete_policy;
pub mod expectations;
pub mod machineset;
pub mod mapper;
pub mod ownership;
pub mod planner;
pub mod selector;
pub mod status;
pub mod util;

pub use machineset::{MachineSetReconciler, Outcome};
