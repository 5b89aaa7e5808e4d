//! 异步拷贝事件表
//!
//! 每个工作项在同一程序点独立发起相同的 async copy，
//! 事件表负责把这些请求合并成同一个事件句柄，
//! 并在全组都到达 wait 点后统一执行数据搬运。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::GroupError;
use crate::memory::Memory;

/// 事件句柄，组内从 1 开始单调递增，永不复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// 拷贝方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyDirection {
    GlobalToLocal,
    LocalToGlobal,
}

/// 一次 async copy 请求
///
/// 五个字段全部相等时视为同一请求（去重键）。
/// 只描述连续拷贝，不支持 strided 形式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncCopy {
    /// 发起请求的指令标识
    pub instruction: usize,
    pub direction: CopyDirection,
    pub dest: u64,
    pub src: u64,
    pub size: usize,
}

impl AsyncCopy {
    /// 执行拷贝：从源空间读入临时缓冲区，再写入目标空间
    ///
    /// 两端范围都先校验，再分配缓冲区。
    fn execute(&self, local: &mut dyn Memory, global: &mut dyn Memory) -> Result<(), GroupError> {
        match self.direction {
            CopyDirection::GlobalToLocal => {
                global.check_range(self.src, self.size)?;
                local.check_range(self.dest, self.size)?;
            }
            CopyDirection::LocalToGlobal => {
                local.check_range(self.src, self.size)?;
                global.check_range(self.dest, self.size)?;
            }
        }

        let mut buffer = vec![0u8; self.size];
        match self.direction {
            CopyDirection::GlobalToLocal => {
                global.load(&mut buffer, self.src)?;
                local.store(&buffer, self.dest)?;
            }
            CopyDirection::LocalToGlobal => {
                local.load(&mut buffer, self.src)?;
                global.store(&buffer, self.dest)?;
            }
        }
        Ok(())
    }
}

/// 组内事件表
#[derive(Debug)]
pub struct EventRegistry {
    /// 待完成事件及其拷贝列表（按登记顺序）
    pending: BTreeMap<EventId, Vec<AsyncCopy>>,
    /// 本轮同步中被等待的事件
    waiting: BTreeSet<EventId>,
    next_event: u64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            waiting: BTreeSet::new(),
            next_event: 1,
        }
    }

    /// 登记一次拷贝请求并返回事件句柄
    ///
    /// 若已有待完成事件包含完全相同的请求，返回该事件；
    /// 否则分配新句柄。实际数据搬运推迟到 [`fulfill`](Self::fulfill)。
    pub fn request_copy(&mut self, copy: AsyncCopy) -> EventId {
        let existing = self
            .pending
            .iter()
            .find(|(_, copies)| copies.contains(&copy))
            .map(|(&event, _)| event);

        if let Some(event) = existing {
            tracing::trace!(%event, instruction = copy.instruction, "async copy merged");
            return event;
        }

        let event = EventId(self.next_event);
        self.next_event += 1;
        self.pending.insert(event, vec![copy]);
        tracing::debug!(
            %event,
            instruction = copy.instruction,
            direction = ?copy.direction,
            dest = copy.dest,
            src = copy.src,
            size = copy.size,
            "async copy registered"
        );
        event
    }

    /// 标记某事件在本轮被等待
    ///
    /// 句柄必须仍处于待完成状态，否则返回 [`GroupError::UnknownEvent`]。
    pub fn await_event(&mut self, event: EventId) -> Result<(), GroupError> {
        if !self.pending.contains_key(&event) {
            return Err(GroupError::UnknownEvent { event });
        }
        self.waiting.insert(event);
        Ok(())
    }

    /// 执行所有被等待事件的拷贝，并将这些事件移出事件表
    pub fn fulfill(
        &mut self,
        local: &mut dyn Memory,
        global: &mut dyn Memory,
    ) -> Result<(), GroupError> {
        let waiting = std::mem::take(&mut self.waiting);
        for event in waiting {
            let Some(copies) = self.pending.remove(&event) else {
                continue;
            };
            for copy in &copies {
                copy.execute(local, global)?;
            }
            tracing::debug!(%event, copies = copies.len(), "event fulfilled");
        }
        Ok(())
    }

    /// 是否存在该待完成事件
    pub fn is_pending(&self, event: EventId) -> bool {
        self.pending.contains_key(&event)
    }

    /// 某事件登记的拷贝列表
    pub fn copies(&self, event: EventId) -> Option<&[AsyncCopy]> {
        self.pending.get(&event).map(Vec::as_slice)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 本轮被等待的事件（升序）
    pub fn waiting(&self) -> impl Iterator<Item = EventId> + '_ {
        self.waiting.iter().copied()
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}
