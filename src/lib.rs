//! simt_sim: SIMT 工作组功能仿真库
//!
//! 本库以纯顺序方式模拟 OpenCL 风格的工作组执行：
//! 每个工作项（虚拟线程）逐步解释 kernel，调度器负责在 barrier
//! 与异步拷贝事件上强制全组汇合，并检测违反集体语义的分歧。
//!
//! # 模块结构
//!
//! - `memory`: 地址空间抽象层
//! - `work_item`: 工作项状态机与接口
//! - `kernel`: kernel 接口与最小脚本 IR
//! - `work_group`: 工作组调度器与异步拷贝事件表
//! - `dispatch`: ND-range 配置与逐组分发

pub mod dispatch;
pub mod kernel;
pub mod memory;
pub mod work_group;
pub mod work_item;
