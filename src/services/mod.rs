//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod deploy;
pub mod events;
pub mod inference;
