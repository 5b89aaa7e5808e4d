//! Kernel 分发
//!
//! 本模块负责：
//! - 描述并校验 ND-range（维数、全局大小、工作组大小）
//! - 分配全局内存
//! - 按组坐标逐个构造工作组并运行，汇总每组结果
//!
//! 工作组之间严格顺序执行；某组出现分歧只终止该组，
//! 除非配置了 `stop_on_fault`。
//!
//! # 示例
//!
//! ```
//! use simt_sim::dispatch::{DispatchConfig, Dispatcher};
//! use simt_sim::kernel::{KernelOp, ScriptKernel};
//!
//! let config = DispatchConfig::new()
//!     .with_work_dim(1)
//!     .with_global_size([8, 1, 1])
//!     .with_local_size([4, 1, 1]);
//!
//! let kernel = ScriptKernel::new("sync", vec![KernelOp::Barrier, KernelOp::Return]);
//! let mut dispatcher = Dispatcher::from_config(config).expect("valid ND-range");
//! let report = dispatcher.run(&kernel);
//! assert!(report.is_success());
//! assert_eq!(report.groups_run(), 2);
//! ```

use thiserror::Error;

use crate::kernel::Kernel;
use crate::memory::{FlatMemory, MemError, Memory};
use crate::work_group::{GroupError, WorkGroup};

/// 分发配置错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid ND-range: {0}")]
    InvalidRange(String),
    #[error(transparent)]
    Memory(#[from] MemError),
}

/// ND-range 描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    /// 有效维数（1..=3）
    pub work_dim: u32,
    pub global_size: [usize; 3],
    /// 工作组大小
    pub local_size: [usize; 3],
}

impl Default for NdRange {
    fn default() -> Self {
        Self {
            work_dim: 1,
            global_size: [1, 1, 1],
            local_size: [1, 1, 1],
        }
    }
}

impl NdRange {
    pub fn new(work_dim: u32, global_size: [usize; 3], local_size: [usize; 3]) -> Self {
        Self {
            work_dim,
            global_size,
            local_size,
        }
    }

    /// 校验 ND-range
    ///
    /// - 维数在 1..=3 之间
    /// - 各维大小非零，且全局大小能被工作组大小整除
    /// - 超出 `work_dim` 的维度大小必须为 1
    /// - 工作组内工作项总数不溢出 `usize`
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(1..=3).contains(&self.work_dim) {
            return Err(DispatchError::InvalidRange(format!(
                "work_dim must be 1, 2 or 3 (got {})",
                self.work_dim
            )));
        }

        for dim in 0..3 {
            let global = self.global_size[dim];
            let local = self.local_size[dim];
            if global == 0 || local == 0 {
                return Err(DispatchError::InvalidRange(format!(
                    "dimension {} has zero size (global={}, local={})",
                    dim, global, local
                )));
            }
            if dim >= self.work_dim as usize && (global != 1 || local != 1) {
                return Err(DispatchError::InvalidRange(format!(
                    "dimension {} is unused for work_dim={} but has size {}x{}",
                    dim, self.work_dim, global, local
                )));
            }
            if !global.is_multiple_of(local) {
                return Err(DispatchError::InvalidRange(format!(
                    "global size {} is not a multiple of local size {} in dimension {}",
                    global, local, dim
                )));
            }
        }

        if self
            .local_size
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .is_none()
        {
            return Err(DispatchError::InvalidRange(format!(
                "work-group size {:?} overflows the work-item count",
                self.local_size
            )));
        }

        Ok(())
    }

    /// 每个维度上的工作组数
    pub fn num_groups(&self) -> [usize; 3] {
        [
            self.global_size[0] / self.local_size[0],
            self.global_size[1] / self.local_size[1],
            self.global_size[2] / self.local_size[2],
        ]
    }

    /// 按 x 最快变化的顺序枚举组坐标
    pub fn group_ids(&self) -> impl Iterator<Item = [usize; 3]> {
        let [nx, ny, nz] = self.num_groups();
        (0..nz).flat_map(move |k| (0..ny).flat_map(move |j| (0..nx).map(move |i| [i, j, k])))
    }
}

/// 全局内存区域配置
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// 区域名称（用于调试）
    pub name: String,
    /// 起始地址
    pub base: u64,
    /// 大小（字节）
    pub size: usize,
}

impl Default for MemoryRegion {
    fn default() -> Self {
        Self {
            name: "global".to_string(),
            base: 0,
            size: 64 * 1024, // 默认 64KB
        }
    }
}

/// 分发配置
#[derive(Debug, Clone, Default)]
pub struct DispatchConfig {
    pub range: NdRange,
    /// 全局内存配置
    pub memory: MemoryRegion,
    /// 是否输出逐步执行轨迹
    pub trace: bool,
    /// 每组结束后打印局部与私有内存
    pub dump_memory: bool,
    /// 某组出错后是否停止后续工作组
    pub stop_on_fault: bool,
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_work_dim(mut self, work_dim: u32) -> Self {
        self.range.work_dim = work_dim;
        self
    }

    pub fn with_global_size(mut self, size: [usize; 3]) -> Self {
        self.range.global_size = size;
        self
    }

    pub fn with_local_size(mut self, size: [usize; 3]) -> Self {
        self.range.local_size = size;
        self
    }

    /// 设置全局内存区域
    pub fn with_global_memory(mut self, base: u64, size: usize) -> Self {
        self.memory.base = base;
        self.memory.size = size;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_dump_memory(mut self, dump: bool) -> Self {
        self.dump_memory = dump;
        self
    }

    pub fn with_stop_on_fault(mut self, stop: bool) -> Self {
        self.stop_on_fault = stop;
        self
    }
}

/// 单个工作组的运行结果
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub group_id: [usize; 3],
    pub outcome: Result<(), GroupError>,
    /// 结束时已完成的工作项数
    pub finished: usize,
}

/// 一次分发的汇总结果
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub kernel: String,
    pub groups: Vec<GroupReport>,
}

impl DispatchReport {
    /// 所有工作组均正常完成
    pub fn is_success(&self) -> bool {
        self.groups.iter().all(|g| g.outcome.is_ok())
    }

    /// 出错的工作组
    pub fn faults(&self) -> impl Iterator<Item = &GroupReport> {
        self.groups.iter().filter(|g| g.outcome.is_err())
    }

    pub fn groups_run(&self) -> usize {
        self.groups.len()
    }
}

/// Kernel 分发器
///
/// 持有全局内存，其生命周期覆盖所有工作组。
pub struct Dispatcher {
    config: DispatchConfig,
    global: FlatMemory,
}

impl Dispatcher {
    /// 从配置创建分发器
    pub fn from_config(config: DispatchConfig) -> Result<Self, DispatchError> {
        config.range.validate()?;
        let global = FlatMemory::new(config.memory.size, config.memory.base);
        tracing::debug!(
            region = %config.memory.name,
            base = config.memory.base,
            size = config.memory.size,
            groups = ?config.range.num_groups(),
            "dispatcher initialized"
        );
        Ok(Self { config, global })
    }

    pub fn global_memory(&self) -> &FlatMemory {
        &self.global
    }

    pub fn global_memory_mut(&mut self) -> &mut FlatMemory {
        &mut self.global
    }

    /// 依次运行全部工作组
    pub fn run<K: Kernel>(&mut self, kernel: &K) -> DispatchReport {
        let range = self.config.range;
        let mut groups = Vec::new();

        for group_id in range.group_ids() {
            let (outcome, finished) = match WorkGroup::new(
                kernel,
                &mut self.global,
                range.work_dim,
                group_id,
                range.global_size,
                range.local_size,
            ) {
                Ok(mut group) => {
                    let outcome = group.run(kernel, self.config.trace);
                    if self.config.dump_memory {
                        group.dump_local_memory();
                        group.dump_private_memory();
                    }
                    (outcome, group.finished_count())
                }
                Err(err) => (Err(err), 0),
            };

            if let Err(err) = &outcome {
                tracing::error!(kernel = kernel.name(), group = ?group_id, error = %err, "work-group failed");
            }

            let failed = outcome.is_err();
            groups.push(GroupReport {
                group_id,
                outcome,
                finished,
            });

            if failed && self.config.stop_on_fault {
                break;
            }
        }

        DispatchReport {
            kernel: kernel.name().to_string(),
            groups,
        }
    }

    /// 打印全局内存
    pub fn dump(&self) {
        println!("=== Global Memory ({}) ===", self.config.memory.name);
        if self.global.total_allocated() > 0 {
            self.global.dump();
        }
    }
}
