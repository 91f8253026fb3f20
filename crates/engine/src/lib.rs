pub mod deadline;
pub mod decision;
pub mod lifecycle;
pub mod state;

pub use decision::{DecisionConfig, DecisionEngine};
pub use lifecycle::{Engine, EngineHandle};
pub use state::{StateMachine, TradeState};
