//! 执行前规划：信心评估、备选计划、任务级汇总

pub mod confidence;

pub use confidence::{
    ConfidenceAssessment, ConfidenceFactor, ConfidencePlanner, FallbackPlan, RiskLevel,
    TaskInsights,
};
