//! 工作项（虚拟线程）
//!
//! 调度器只通过 [`WorkItem`] trait 与工作项交互：
//! 读取状态、单步执行、在同步点统一释放。
//!
//! [`ScriptedWorkItem`] 逐条解释 [`ScriptKernel`](crate::kernel::ScriptKernel)
//! 的指令，每次 `step` 执行一条。

use std::sync::Arc;

use crate::kernel::{AddressSpace, KernelOp};
use crate::memory::{FlatMemory, Memory};
use crate::work_group::{AsyncCopy, EventId, GroupContext, GroupError, linear_index};

/// 工作项执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkItemState {
    /// 可以继续执行，唯一允许调用 `step` 的状态
    #[default]
    Ready,
    /// 停在 barrier 上
    Barrier,
    /// 停在 wait 事件上
    WaitEvent,
    /// 已执行完毕（终态）
    Finished,
}

impl WorkItemState {
    /// 同步点释放：Barrier/WaitEvent 回到 Ready，其余状态不变
    pub fn release(self) -> Self {
        match self {
            WorkItemState::Barrier | WorkItemState::WaitEvent => WorkItemState::Ready,
            other => other,
        }
    }

    pub fn is_suspended(self) -> bool {
        matches!(self, WorkItemState::Barrier | WorkItemState::WaitEvent)
    }
}

/// 工作项坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItemIds {
    pub group: [usize; 3],
    pub local: [usize; 3],
    pub global: [usize; 3],
    pub local_linear: usize,
    pub global_linear: usize,
}

impl WorkItemIds {
    /// 由组坐标与组内坐标推导全局坐标和线性索引
    pub fn new(
        group: [usize; 3],
        local: [usize; 3],
        group_size: [usize; 3],
        global_size: [usize; 3],
    ) -> Self {
        let global = [
            group[0] * group_size[0] + local[0],
            group[1] * group_size[1] + local[1],
            group[2] * group_size[2] + local[2],
        ];
        Self {
            group,
            local,
            global,
            local_linear: linear_index(local, group_size),
            global_linear: linear_index(global, global_size),
        }
    }
}

/// 调度器使用的工作项接口
pub trait WorkItem {
    fn state(&self) -> WorkItemState;

    /// 执行一个单位的 kernel 工作，返回新的状态
    ///
    /// 只能在 `state() == Ready` 时调用。
    fn step(&mut self, ctx: &mut GroupContext<'_>, trace: bool) -> Result<WorkItemState, GroupError>;

    /// 从 Barrier/WaitEvent 释放回 Ready
    fn release(&mut self);

    fn ids(&self) -> &WorkItemIds;

    fn dump_private_memory(&self);
}

/// 解释脚本 kernel 的工作项
#[derive(Debug, Clone)]
pub struct ScriptedWorkItem {
    ids: WorkItemIds,
    program: Arc<[KernelOp]>,
    pc: usize,
    state: WorkItemState,
    private: FlatMemory,
    /// 事件槽，保存 async copy 返回的句柄
    events: Vec<Option<EventId>>,
}

impl ScriptedWorkItem {
    pub fn new(ids: WorkItemIds, program: Arc<[KernelOp]>, private_size: usize) -> Self {
        Self {
            ids,
            program,
            pc: 0,
            state: WorkItemState::Ready,
            private: FlatMemory::new(private_size, 0),
            events: Vec::new(),
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn private_memory(&self) -> &FlatMemory {
        &self.private
    }

    /// 事件槽中的句柄
    pub fn event(&self, slot: usize) -> Option<EventId> {
        self.events.get(slot).copied().flatten()
    }

    fn space<'a>(
        private: &'a mut FlatMemory,
        ctx: &'a mut GroupContext<'_>,
        space: AddressSpace,
    ) -> &'a mut dyn Memory {
        match space {
            AddressSpace::Private => private,
            AddressSpace::Local => ctx.local_mut(),
            AddressSpace::Global => ctx.global_mut(),
        }
    }

    fn execute(&mut self, ctx: &mut GroupContext<'_>, op: &KernelOp) -> Result<WorkItemState, GroupError> {
        let current_pc = self.pc;
        self.pc += 1;

        match op {
            KernelOp::Compute => {}
            KernelOp::Store { space, addr, value } => {
                let addr = addr.eval(&self.ids);
                let value = value.eval(&self.ids);
                Self::space(&mut self.private, ctx, *space).store_u32(addr, value)?;
            }
            KernelOp::Copy { from, src, to, dst } => {
                let src = src.eval(&self.ids);
                let dst = dst.eval(&self.ids);
                let value = Self::space(&mut self.private, ctx, *from).load_u32(src)?;
                Self::space(&mut self.private, ctx, *to).store_u32(dst, value)?;
            }
            KernelOp::AsyncCopy {
                direction,
                dest,
                src,
                size,
                event,
            } => {
                let id = ctx.request_copy(AsyncCopy {
                    instruction: current_pc,
                    direction: *direction,
                    dest: dest.eval(&self.ids),
                    src: src.eval(&self.ids),
                    size: *size,
                });
                if self.events.len() <= *event {
                    self.events.resize(*event + 1, None);
                }
                self.events[*event] = Some(id);
            }
            KernelOp::WaitEvents { events } => {
                for &slot in events {
                    let id = self.event(slot).ok_or(GroupError::UnsetEvent { slot })?;
                    ctx.await_event(id)?;
                }
                return Ok(WorkItemState::WaitEvent);
            }
            KernelOp::Barrier => return Ok(WorkItemState::Barrier),
            KernelOp::SkipIf {
                when,
                equals,
                count,
            } => {
                if when.eval(&self.ids) == *equals {
                    self.pc += *count;
                }
            }
            KernelOp::Return => return Ok(WorkItemState::Finished),
        }

        Ok(WorkItemState::Ready)
    }
}

impl WorkItem for ScriptedWorkItem {
    fn state(&self) -> WorkItemState {
        self.state
    }

    fn step(&mut self, ctx: &mut GroupContext<'_>, trace: bool) -> Result<WorkItemState, GroupError> {
        if self.state != WorkItemState::Ready {
            return Ok(self.state);
        }

        let program = Arc::clone(&self.program);
        let Some(op) = program.get(self.pc) else {
            self.state = WorkItemState::Finished;
            return Ok(self.state);
        };

        if trace {
            tracing::info!(gid = ?self.ids.global, pc = self.pc, ?op, "step");
        }

        self.state = self.execute(ctx, op)?;
        Ok(self.state)
    }

    fn release(&mut self) {
        self.state = self.state.release();
    }

    fn ids(&self) -> &WorkItemIds {
        &self.ids
    }

    fn dump_private_memory(&self) {
        let gid = self.ids.global;
        println!("Work-item ({},{},{}):", gid[0], gid[1], gid[2]);
        if self.private.total_allocated() > 0 {
            self.private.dump();
        }
    }
}
