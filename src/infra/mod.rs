//! 基础设施模块
//!
//! 封装外部依赖（端口探测、子进程、命令执行、模型仓库）

pub mod command;
pub mod hub;
pub mod port_allocator;
pub mod process;

pub use command::{CommandError, CommandRunner};
pub use hub::{ArtifactSource, HubArtifactSource, ModelArtifact};
pub use port_allocator::{find_free_port, PortAllocator, PortProbe};
pub use process::{LaunchSpec, ProcessSupervisor, ServerProcess};
