//! 调度层
//!
//! 任务分配调度器、提交评估器和插件存活检测器。

pub mod evaluator;
pub mod liveness;
pub mod scheduler;

pub use evaluator::{Submission, SubmissionEvaluator, SubmissionOutcome};
pub use liveness::PluginLivenessDetector;
pub use scheduler::AssignmentScheduler;
