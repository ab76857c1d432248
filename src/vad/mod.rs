pub mod machine;
pub mod thresholds;

pub use machine::{PostSessionBoost, SilenceTimer, VadEvent, VadMachine, VadPhase, VadState};
pub use thresholds::{
    dynamic_exit, effective_noise, passes_finalize_gate, post_session_boost, thresholds,
    FinalizeInputs, Thresholds,
};
