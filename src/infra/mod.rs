//! 基础设施模块
//!
//! 封装外部依赖（命令执行、文本补全 HTTP client）

pub mod analysis;
pub mod command;

pub use analysis::{AnalysisClient, AnalysisError, FailureAnalyzer};
pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec};
