mod flow;

// Public API of the offline exam subsystem.
pub use crate::error::ExamFlowError;
pub use flow::{ExamFlowService, ResumedExam, StartedExam, SubmittedExam};
