//! Kernel 抽象与最小脚本 IR
//!
//! 调度器只需要 kernel 提供三样东西：名字、局部内存模板、
//! 以及为每个局部坐标创建工作项的能力，统一由 [`Kernel`] trait 描述。
//!
//! [`ScriptKernel`] 是一个极简的指令序列实现，用于驱动调度器、
//! 编写测试与 CLI 演示。它只覆盖同步语义相关的操作
//! （barrier、async copy、wait），以及少量按工作项坐标寻址的读写。

use std::sync::Arc;

use crate::memory::{FlatMemory, Memory};
use crate::work_group::CopyDirection;
use crate::work_item::{ScriptedWorkItem, WorkItem, WorkItemIds};

/// 调度器眼中的 kernel
pub trait Kernel {
    type Item: WorkItem;

    /// kernel 函数名
    fn name(&self) -> &str;

    /// 局部内存模板，每个工作组克隆一份
    fn local_memory(&self) -> &dyn Memory;

    /// 为指定坐标创建工作项
    fn create_work_item(&self, ids: WorkItemIds) -> Self::Item;
}

/// 工作项内置索引
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// 常量 0
    Zero,
    LocalId(usize),
    GlobalId(usize),
    GroupId(usize),
    /// 组内线性索引
    LocalLinear,
    /// 全局线性索引
    GlobalLinear,
}

impl Builtin {
    pub fn eval(self, ids: &WorkItemIds) -> usize {
        match self {
            Builtin::Zero => 0,
            Builtin::LocalId(dim) => ids.local.get(dim).copied().unwrap_or(0),
            Builtin::GlobalId(dim) => ids.global.get(dim).copied().unwrap_or(0),
            Builtin::GroupId(dim) => ids.group.get(dim).copied().unwrap_or(0),
            Builtin::LocalLinear => ids.local_linear,
            Builtin::GlobalLinear => ids.global_linear,
        }
    }
}

/// 地址表达式：`base + stride * index`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrExpr {
    pub base: u64,
    pub stride: i64,
    pub index: Builtin,
}

impl AddrExpr {
    /// 与工作项无关的固定地址
    pub const fn fixed(base: u64) -> Self {
        Self {
            base,
            stride: 0,
            index: Builtin::Zero,
        }
    }

    pub const fn indexed(base: u64, stride: i64, index: Builtin) -> Self {
        Self {
            base,
            stride,
            index,
        }
    }

    /// 负地址会回绕成一个极大的值，由内存的越界检查拒绝
    pub fn eval(&self, ids: &WorkItemIds) -> u64 {
        let index = self.index.eval(ids) as i64;
        self.base.wrapping_add_signed(self.stride.wrapping_mul(index))
    }
}

/// 写入的 32 位值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueExpr {
    Const(u32),
    Builtin(Builtin),
}

impl ValueExpr {
    pub fn eval(&self, ids: &WorkItemIds) -> u32 {
        match *self {
            ValueExpr::Const(v) => v,
            ValueExpr::Builtin(b) => b.eval(ids) as u32,
        }
    }
}

/// 地址空间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Private,
    Local,
    Global,
}

/// 脚本 kernel 的一条指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp {
    /// 无副作用的计算步
    Compute,
    /// 写入一个 32 位字
    Store {
        space: AddressSpace,
        addr: AddrExpr,
        value: ValueExpr,
    },
    /// 在地址空间之间搬运一个 32 位字
    Copy {
        from: AddressSpace,
        src: AddrExpr,
        to: AddressSpace,
        dst: AddrExpr,
    },
    /// 发起组内 async copy，事件句柄存入 `event` 号事件槽
    AsyncCopy {
        direction: CopyDirection,
        dest: AddrExpr,
        src: AddrExpr,
        size: usize,
        event: usize,
    },
    /// 等待若干事件槽中的事件
    WaitEvents { events: Vec<usize> },
    Barrier,
    /// 当 `when == equals` 时跳过后面 `count` 条指令
    SkipIf {
        when: Builtin,
        equals: usize,
        count: usize,
    },
    Return,
}

/// 由指令序列描述的 kernel
#[derive(Debug, Clone)]
pub struct ScriptKernel {
    name: String,
    program: Arc<[KernelOp]>,
    local_memory: FlatMemory,
    private_size: usize,
}

impl ScriptKernel {
    /// 创建 kernel，默认不带局部内存与私有内存
    pub fn new(name: impl Into<String>, program: Vec<KernelOp>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            local_memory: FlatMemory::new(0, 0),
            private_size: 0,
        }
    }

    /// 设置局部内存模板大小（内容为全 0）
    pub fn with_local_memory(mut self, size: usize) -> Self {
        self.local_memory = FlatMemory::new(size, 0);
        self
    }

    /// 使用给定内容作为局部内存模板
    pub fn with_local_template(mut self, template: FlatMemory) -> Self {
        self.local_memory = template;
        self
    }

    /// 设置每个工作项的私有内存大小
    pub fn with_private_memory(mut self, size: usize) -> Self {
        self.private_size = size;
        self
    }

    pub fn program(&self) -> &[KernelOp] {
        &self.program
    }
}

impl Kernel for ScriptKernel {
    type Item = ScriptedWorkItem;

    fn name(&self) -> &str {
        &self.name
    }

    fn local_memory(&self) -> &dyn Memory {
        &self.local_memory
    }

    fn create_work_item(&self, ids: WorkItemIds) -> ScriptedWorkItem {
        ScriptedWorkItem::new(ids, Arc::clone(&self.program), self.private_size)
    }
}
