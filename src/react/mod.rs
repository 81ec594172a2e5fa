//! 步骤级推理：ReAct 周期、自我纠错、元认知监控

pub mod correction;
pub mod cycle;
pub mod metacognition;

pub use correction::{Correction, CorrectionContext, SelfCorrector};
pub use cycle::{
    AttemptRecord, AttemptSource, Observation, ReactCycle, ReactRunner, Reflection, Thought,
    Verdict,
};
pub use metacognition::{
    normalize_error, request_guidance, Escalation, MetacognitionConfig, MetacognitiveMonitor,
    Recommendation, StuckKind, StuckSignal,
};
