//! 任务编排与执行核心
//!
//! 二进制入口与集成测试共用的应用组装代码。

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::{wait_for_signal, ShutdownManager};
