//! 工作组调度器
//!
//! 在单个执行上下文中按轮次推进组内全部工作项，模拟 SIMT 的集体语义：
//!
//! 1. 每一轮按线性索引升序遍历工作项，对处于 Ready 的工作项反复 `step`，
//!    直到它停在 barrier / wait 上或执行完毕（中途不抢占）
//! 2. 统计本轮停在 barrier 与 wait 上的工作项数
//! 3. 全部到达 barrier 时统一释放；只有部分到达则判定为 barrier 分歧
//! 4. 全部到达 wait 时执行被等待事件的拷贝后统一释放；部分到达判定为分歧
//!
//! 分歧检测以轮为粒度，无法区分工作项停在哪一个 barrier / wait 上。

mod events;

pub use events::{AsyncCopy, CopyDirection, EventId, EventRegistry};

use thiserror::Error;

use crate::kernel::Kernel;
use crate::memory::{MemError, Memory};
use crate::work_item::{WorkItem, WorkItemIds, WorkItemState};

const SMALL_SEPARATOR: &str = "────────────────────────────────";

/// 工作组执行错误，均对本组致命
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    /// 本轮只有部分工作项到达 barrier
    #[error("barrier divergence in group {group:?}: {arrived} of {total} work-items reached a barrier")]
    BarrierDivergence {
        group: [usize; 3],
        arrived: usize,
        total: usize,
    },
    /// 本轮只有部分工作项到达 wait
    #[error("wait-for-events divergence in group {group:?}: {arrived} of {total} work-items reached a wait")]
    WaitEventDivergence {
        group: [usize; 3],
        arrived: usize,
        total: usize,
    },
    /// 等待了一个不存在（或已完成）的事件
    #[error("awaited {event}, which is not pending in this group")]
    UnknownEvent { event: EventId },
    /// 等待的事件槽从未被 async copy 写入
    #[error("event slot {slot} awaited before any async copy set it")]
    UnsetEvent { slot: usize },
    /// 工作组大小的乘积溢出 `usize`
    #[error("work-group size {group_size:?} overflows the work-item count")]
    GroupTooLarge { group_size: [usize; 3] },
    #[error(transparent)]
    Memory(#[from] MemError),
}

impl GroupError {
    /// 是否为集体同步分歧
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            GroupError::BarrierDivergence { .. } | GroupError::WaitEventDivergence { .. }
        )
    }
}

/// 组内线性索引：`i + (j + k * size.y) * size.x`
///
/// 构造顺序与调度顺序都以此为准。
pub fn linear_index(coord: [usize; 3], size: [usize; 3]) -> usize {
    coord[0] + (coord[1] + coord[2] * size[1]) * size[0]
}

/// 工作项在 `step` 时可见的组内共享状态
///
/// 事件表只能通过 [`request_copy`](Self::request_copy) 与
/// [`await_event`](Self::await_event) 修改。
pub struct GroupContext<'g> {
    global: &'g mut dyn Memory,
    local: Box<dyn Memory>,
    events: EventRegistry,
}

impl<'g> GroupContext<'g> {
    pub fn new(global: &'g mut dyn Memory, local: Box<dyn Memory>) -> Self {
        Self {
            global,
            local,
            events: EventRegistry::new(),
        }
    }

    /// 登记 async copy，返回（可能与其他工作项共享的）事件句柄
    pub fn request_copy(&mut self, copy: AsyncCopy) -> EventId {
        self.events.request_copy(copy)
    }

    /// 声明当前工作项等待某事件
    pub fn await_event(&mut self, event: EventId) -> Result<(), GroupError> {
        self.events.await_event(event)
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn global_mut(&mut self) -> &mut dyn Memory {
        &mut *self.global
    }

    pub fn local(&self) -> &dyn Memory {
        self.local.as_ref()
    }

    pub fn local_mut(&mut self) -> &mut dyn Memory {
        self.local.as_mut()
    }

    fn fulfill(&mut self) -> Result<(), GroupError> {
        self.events.fulfill(self.local.as_mut(), &mut *self.global)
    }
}

/// 工作组
///
/// 独占组内工作项与局部内存；全局内存以借用方式持有，
/// 因而必然比工作组活得更久。
pub struct WorkGroup<'g, W: WorkItem> {
    work_dim: u32,
    group_id: [usize; 3],
    global_size: [usize; 3],
    group_size: [usize; 3],
    /// 按线性索引排列
    work_items: Vec<W>,
    ctx: GroupContext<'g>,
    finished: usize,
}

impl<'g, W: WorkItem> WorkGroup<'g, W> {
    /// 创建工作组：克隆局部内存模板，并按线性索引顺序创建全部工作项
    ///
    /// 工作项总数溢出时返回 [`GroupError::GroupTooLarge`]。
    pub fn new<K>(
        kernel: &K,
        global: &'g mut dyn Memory,
        work_dim: u32,
        group_id: [usize; 3],
        global_size: [usize; 3],
        group_size: [usize; 3],
    ) -> Result<Self, GroupError>
    where
        K: Kernel<Item = W>,
    {
        let total = group_size
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or(GroupError::GroupTooLarge { group_size })?;
        let local = kernel.local_memory().clone_box();

        let mut work_items = Vec::with_capacity(total);
        for k in 0..group_size[2] {
            for j in 0..group_size[1] {
                for i in 0..group_size[0] {
                    debug_assert_eq!(work_items.len(), linear_index([i, j, k], group_size));
                    let ids = WorkItemIds::new(group_id, [i, j, k], group_size, global_size);
                    work_items.push(kernel.create_work_item(ids));
                }
            }
        }

        Ok(Self {
            work_dim,
            group_id,
            global_size,
            group_size,
            work_items,
            ctx: GroupContext::new(global, local),
            finished: 0,
        })
    }

    /// 运行全部工作项直到完成
    ///
    /// 出现分歧、非法事件或内存错误时立即返回 `Err`，
    /// 此时工作组保持未完成状态（并非所有工作项都是 Finished）。
    pub fn run<K: Kernel>(&mut self, kernel: &K, trace: bool) -> Result<(), GroupError> {
        let _span = tracing::debug_span!("work_group", kernel = kernel.name(), group = ?self.group_id)
            .entered();

        let total = self.work_items.len();
        while self.finished < total {
            let mut barriers = 0;
            let mut wait_events = 0;

            for item in self.work_items.iter_mut() {
                if item.state() != WorkItemState::Ready {
                    continue;
                }

                if trace {
                    tracing::info!("{SMALL_SEPARATOR}");
                    tracing::info!(gid = ?item.ids().global, "work-item running");
                }

                let mut state = item.state();
                while state == WorkItemState::Ready {
                    state = item.step(&mut self.ctx, trace)?;
                }

                match state {
                    WorkItemState::Barrier => {
                        barriers += 1;
                        if trace {
                            tracing::info!("barrier reached");
                        }
                    }
                    WorkItemState::WaitEvent => {
                        wait_events += 1;
                        if trace {
                            tracing::info!("wait for events reached");
                        }
                    }
                    WorkItemState::Finished => {
                        self.finished += 1;
                        if trace {
                            tracing::info!("kernel completed");
                        }
                    }
                    WorkItemState::Ready => {}
                }
            }

            // TODO: 区分工作项到达的是哪一个 barrier
            if barriers == total {
                self.release_all();
                if trace {
                    tracing::info!("all work-items reached barrier");
                }
            } else if barriers > 0 {
                tracing::warn!(group = ?self.group_id, barriers, total, "barrier divergence detected");
                return Err(GroupError::BarrierDivergence {
                    group: self.group_id,
                    arrived: barriers,
                    total,
                });
            }

            if wait_events == total {
                self.ctx.fulfill()?;
                self.release_all();
                if trace {
                    tracing::info!("all work-items reached wait for events");
                }
            } else if wait_events > 0 {
                tracing::warn!(group = ?self.group_id, wait_events, total, "wait for events divergence detected");
                return Err(GroupError::WaitEventDivergence {
                    group: self.group_id,
                    arrived: wait_events,
                    total,
                });
            }
        }

        if trace {
            tracing::info!("all work-items completed kernel");
        }
        Ok(())
    }

    fn release_all(&mut self) {
        for item in self.work_items.iter_mut() {
            item.release();
        }
        tracing::debug!(group = ?self.group_id, "work-items released");
    }

    pub fn work_dim(&self) -> u32 {
        self.work_dim
    }

    pub fn group_id(&self) -> [usize; 3] {
        self.group_id
    }

    pub fn global_size(&self) -> [usize; 3] {
        self.global_size
    }

    pub fn group_size(&self) -> [usize; 3] {
        self.group_size
    }

    pub fn local_memory(&self) -> &dyn Memory {
        self.ctx.local()
    }

    /// 按线性索引排列的工作项
    pub fn work_items(&self) -> &[W] {
        &self.work_items
    }

    pub fn work_item(&self, local: [usize; 3]) -> Option<&W> {
        if (0..3).any(|d| local[d] >= self.group_size[d]) {
            return None;
        }
        self.work_items.get(linear_index(local, self.group_size))
    }

    /// 已执行完毕的工作项数
    pub fn finished_count(&self) -> usize {
        self.finished
    }

    pub fn is_complete(&self) -> bool {
        self.finished == self.work_items.len()
    }

    pub fn pending_event_count(&self) -> usize {
        self.ctx.events().pending_count()
    }

    /// 打印局部内存（未分配时不输出）
    pub fn dump_local_memory(&self) {
        if self.ctx.local().total_allocated() > 0 {
            println!("{SMALL_SEPARATOR}");
            println!("Local Memory:");
            self.ctx.local().dump();
        }
    }

    /// 打印每个工作项的私有内存
    pub fn dump_private_memory(&self) {
        for item in &self.work_items {
            println!("{SMALL_SEPARATOR}");
            item.dump_private_memory();
        }
    }
}

#[cfg(test)]
mod tests;
