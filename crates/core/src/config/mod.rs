//! 配置管理
//!
//! 加载顺序：内置默认值 -> TOML 配置文件 -> `ORCHESTRATOR_` 前缀的环境变量。
//! 各段配置在加载后统一调用 `validate()` 校验。

pub mod models;

pub use models::*;
