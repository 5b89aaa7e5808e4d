//! 工作组调度测试

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use super::*;
use crate::kernel::{AddrExpr, AddressSpace, Builtin, KernelOp, ScriptKernel, ValueExpr};
use crate::memory::FlatMemory;
use crate::work_item::ScriptedWorkItem;

const GROUP_2X2: [usize; 3] = [2, 2, 1];

fn global_with_pattern(size: usize) -> FlatMemory {
    let mut mem = FlatMemory::new(size, 0);
    let pattern: Vec<u8> = (0..size).map(|b| b as u8).collect();
    mem.write_bytes(0, &pattern).unwrap();
    mem
}

fn new_group<'g>(
    kernel: &ScriptKernel,
    global: &'g mut FlatMemory,
    group_size: [usize; 3],
) -> WorkGroup<'g, ScriptedWorkItem> {
    WorkGroup::new(kernel, global, 2, [0, 0, 0], group_size, group_size).unwrap()
}

fn local_bytes(group: &WorkGroup<'_, ScriptedWorkItem>, addr: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    group.local_memory().load(&mut buf, addr).unwrap();
    buf
}

fn g2l(dest: AddrExpr, src: AddrExpr, size: usize, event: usize) -> KernelOp {
    KernelOp::AsyncCopy {
        direction: CopyDirection::GlobalToLocal,
        dest,
        src,
        size,
        event,
    }
}

#[test]
fn test_async_copy_scenario() {
    let kernel = ScriptKernel::new(
        "load_tile",
        vec![
            g2l(AddrExpr::fixed(0), AddrExpr::fixed(0), 16, 0),
            KernelOp::WaitEvents { events: vec![0] },
            KernelOp::Return,
        ],
    )
    .with_local_memory(16);
    let mut global = global_with_pattern(64);

    let mut group = new_group(&kernel, &mut global, GROUP_2X2);
    group.run(&kernel, false).unwrap();

    assert!(group.is_complete());
    assert_eq!(group.finished_count(), 4);
    // 4 个工作项的请求合并为同一个事件
    for item in group.work_items() {
        assert_eq!(item.event(0), Some(EventId(1)));
    }
    assert_eq!(group.pending_event_count(), 0);
    assert_eq!(local_bytes(&group, 0, 16), (0..16).collect::<Vec<u8>>());
}

#[test]
fn test_barrier_divergence_scenario() {
    // 线性索引为 3 的工作项跳过 barrier 直接结束
    let kernel = ScriptKernel::new(
        "diverge",
        vec![
            KernelOp::SkipIf {
                when: Builtin::LocalLinear,
                equals: 3,
                count: 1,
            },
            KernelOp::Barrier,
            KernelOp::Return,
        ],
    );
    let mut global = FlatMemory::new(0, 0);

    let mut group = new_group(&kernel, &mut global, GROUP_2X2);
    let err = group.run(&kernel, false).unwrap_err();

    assert_eq!(
        err,
        GroupError::BarrierDivergence {
            group: [0, 0, 0],
            arrived: 3,
            total: 4,
        }
    );
    assert!(err.is_divergence());
    assert!(!group.is_complete());
    assert_eq!(group.finished_count(), 1);
    // 没有工作项被释放越过 barrier
    for item in &group.work_items()[..3] {
        assert_eq!(item.state(), WorkItemState::Barrier);
        assert_eq!(item.pc(), 2);
    }
}

#[test]
fn test_barrier_release_reverses_tile() {
    let n = 4u64;
    let kernel = ScriptKernel::new(
        "reverse",
        vec![
            KernelOp::Store {
                space: AddressSpace::Local,
                addr: AddrExpr::indexed(0, 4, Builtin::LocalLinear),
                value: ValueExpr::Builtin(Builtin::LocalLinear),
            },
            KernelOp::Barrier,
            KernelOp::Copy {
                from: AddressSpace::Local,
                src: AddrExpr::indexed((n - 1) * 4, -4, Builtin::LocalLinear),
                to: AddressSpace::Global,
                dst: AddrExpr::indexed(0, 4, Builtin::GlobalLinear),
            },
        ],
    )
    .with_local_memory(16);
    let mut global = FlatMemory::new(16, 0);

    {
        let mut group = new_group(&kernel, &mut global, GROUP_2X2);
        group.run(&kernel, false).unwrap();
        assert!(group.is_complete());
    }

    let words: Vec<u32> = (0..4).map(|i| global.load_u32(i * 4).unwrap()).collect();
    assert_eq!(words, vec![3, 2, 1, 0]);
}

#[test]
fn test_wait_event_divergence() {
    let kernel = ScriptKernel::new(
        "partial_wait",
        vec![
            g2l(AddrExpr::fixed(0), AddrExpr::fixed(0), 4, 0),
            KernelOp::SkipIf {
                when: Builtin::LocalLinear,
                equals: 0,
                count: 1,
            },
            KernelOp::WaitEvents { events: vec![0] },
        ],
    )
    .with_local_memory(4);
    let mut global = global_with_pattern(4);

    let mut group = new_group(&kernel, &mut global, GROUP_2X2);
    let err = group.run(&kernel, false).unwrap_err();

    assert!(matches!(
        err,
        GroupError::WaitEventDivergence {
            arrived: 3,
            total: 4,
            ..
        }
    ));
    // 拷贝未执行，事件仍在表中
    assert_eq!(group.pending_event_count(), 1);
    assert_eq!(local_bytes(&group, 0, 4), vec![0; 4]);
    // 到达 wait 的工作项没有被释放
    assert_eq!(group.work_items()[0].state(), WorkItemState::Finished);
    for item in &group.work_items()[1..] {
        assert_eq!(item.state(), WorkItemState::WaitEvent);
        assert_eq!(item.pc(), 3);
    }
}

#[test]
fn test_copy_reads_global_at_fulfillment_time() {
    let kernel = ScriptKernel::new(
        "deferred",
        vec![
            g2l(AddrExpr::fixed(0), AddrExpr::fixed(0), 4, 0),
            KernelOp::Store {
                space: AddressSpace::Global,
                addr: AddrExpr::fixed(0),
                value: ValueExpr::Const(0xCAFE_BABE),
            },
            KernelOp::WaitEvents { events: vec![0] },
        ],
    )
    .with_local_memory(4);
    let mut global = FlatMemory::new(4, 0);

    let mut group = new_group(&kernel, &mut global, GROUP_2X2);
    group.run(&kernel, false).unwrap();

    assert_eq!(group.local_memory().load_u32(0).unwrap(), 0xCAFE_BABE);
}

#[test]
fn test_per_item_copies_get_distinct_events() {
    let per_item = AddrExpr::indexed(0, 4, Builtin::LocalLinear);
    let kernel = ScriptKernel::new(
        "scatter",
        vec![
            g2l(per_item, per_item, 4, 0),
            KernelOp::WaitEvents { events: vec![0] },
        ],
    )
    .with_local_memory(16);
    let mut global = global_with_pattern(16);

    let mut group = new_group(&kernel, &mut global, GROUP_2X2);
    group.run(&kernel, false).unwrap();

    let events: Vec<_> = group.work_items().iter().map(|w| w.event(0)).collect();
    assert_eq!(
        events,
        vec![
            Some(EventId(1)),
            Some(EventId(2)),
            Some(EventId(3)),
            Some(EventId(4))
        ]
    );
    assert_eq!(local_bytes(&group, 0, 16), (0..16).collect::<Vec<u8>>());
}

#[test]
fn test_multiple_sync_rounds() {
    // global -> local，barrier，再把局部内存写回 global 的另一半
    let kernel = ScriptKernel::new(
        "round_trip",
        vec![
            g2l(AddrExpr::fixed(0), AddrExpr::fixed(0), 8, 0),
            KernelOp::WaitEvents { events: vec![0] },
            KernelOp::Barrier,
            KernelOp::AsyncCopy {
                direction: CopyDirection::LocalToGlobal,
                dest: AddrExpr::fixed(8),
                src: AddrExpr::fixed(0),
                size: 8,
                event: 1,
            },
            KernelOp::WaitEvents { events: vec![1] },
            KernelOp::Return,
        ],
    )
    .with_local_memory(8);
    let mut global = global_with_pattern(16);

    {
        let mut group = new_group(&kernel, &mut global, GROUP_2X2);
        group.run(&kernel, true).unwrap();
        assert!(group.is_complete());
        assert_eq!(group.work_items()[0].event(1), Some(EventId(2)));
    }

    assert_eq!(global.read_bytes(8, 8).unwrap(), (0..8).collect::<Vec<u8>>());
}

#[test]
fn test_reawait_fulfilled_event_fails() {
    let kernel = ScriptKernel::new(
        "double_wait",
        vec![
            g2l(AddrExpr::fixed(0), AddrExpr::fixed(0), 4, 0),
            KernelOp::WaitEvents { events: vec![0] },
            KernelOp::WaitEvents { events: vec![0] },
        ],
    )
    .with_local_memory(4);
    let mut global = FlatMemory::new(4, 0);

    let mut group = new_group(&kernel, &mut global, GROUP_2X2);
    let err = group.run(&kernel, false).unwrap_err();

    assert_eq!(err, GroupError::UnknownEvent { event: EventId(1) });
    assert!(!err.is_divergence());
}

#[test]
fn test_memory_fault_during_fulfillment() {
    let kernel = ScriptKernel::new(
        "too_big",
        vec![
            g2l(AddrExpr::fixed(0), AddrExpr::fixed(0), 32, 0),
            KernelOp::WaitEvents { events: vec![0] },
        ],
    )
    .with_local_memory(8);
    let mut global = FlatMemory::new(32, 0);

    let mut group = new_group(&kernel, &mut global, GROUP_2X2);
    let err = group.run(&kernel, false).unwrap_err();
    assert!(matches!(err, GroupError::Memory(_)));
}

#[test]
fn test_huge_copy_is_rejected_before_allocating() {
    let kernel = ScriptKernel::new(
        "huge",
        vec![
            g2l(AddrExpr::fixed(0), AddrExpr::fixed(0), usize::MAX, 0),
            KernelOp::WaitEvents { events: vec![0] },
        ],
    )
    .with_local_memory(8);
    let mut global = FlatMemory::new(32, 0);

    let mut group = new_group(&kernel, &mut global, [1, 1, 1]);
    let err = group.run(&kernel, false).unwrap_err();
    assert!(matches!(
        err,
        GroupError::Memory(MemError::OutOfRange { size: usize::MAX, .. })
    ));
    assert_eq!(group.work_items()[0].state(), WorkItemState::WaitEvent);
}

#[test]
fn test_group_size_overflow() {
    let kernel = RecorderKernel::new(false);
    let mut global = FlatMemory::new(0, 0);

    let size = [usize::MAX, 2, 1];
    let result = WorkGroup::new(&kernel, &mut global, 2, [0, 0, 0], size, size);
    assert!(matches!(
        result,
        Err(GroupError::GroupTooLarge { group_size }) if group_size == size
    ));
}

#[test]
fn test_finishing_at_different_times_is_fine() {
    // 工作项 0 多执行几步，不需要任何同步
    let kernel = ScriptKernel::new(
        "uneven",
        vec![
            KernelOp::SkipIf {
                when: Builtin::LocalLinear,
                equals: 0,
                count: 0,
            },
            KernelOp::SkipIf {
                when: Builtin::LocalLinear,
                equals: 0,
                count: 1,
            },
            KernelOp::Return,
            KernelOp::Compute,
            KernelOp::Compute,
        ],
    );
    let mut global = FlatMemory::new(0, 0);

    let mut group = new_group(&kernel, &mut global, [3, 1, 1]);
    group.run(&kernel, false).unwrap();
    assert!(group.is_complete());
    assert_eq!(group.work_items()[0].pc(), 5);
    assert_eq!(group.work_items()[1].pc(), 3);
}

#[test]
fn test_empty_group_completes() {
    let kernel = ScriptKernel::new("noop", vec![KernelOp::Barrier]);
    let mut global = FlatMemory::new(0, 0);

    let mut group = new_group(&kernel, &mut global, [0, 4, 1]);
    group.run(&kernel, false).unwrap();
    assert!(group.is_complete());
    assert!(group.work_items().is_empty());
}

#[test]
fn test_accessors() {
    let kernel = ScriptKernel::new("noop", vec![]).with_local_memory(32);
    let mut global = FlatMemory::new(0, 0);

    let group = WorkGroup::new(&kernel, &mut global, 3, [1, 2, 0], [4, 9, 2], [2, 3, 2]).unwrap();
    assert_eq!(group.work_dim(), 3);
    assert_eq!(group.group_id(), [1, 2, 0]);
    assert_eq!(group.global_size(), [4, 9, 2]);
    assert_eq!(group.group_size(), [2, 3, 2]);
    assert_eq!(group.local_memory().total_allocated(), 32);
    assert_eq!(group.work_items().len(), 12);
    assert_eq!(group.work_item([1, 2, 1]).unwrap().ids().global, [3, 8, 1]);
    assert!(group.work_item([2, 0, 0]).is_none());
}

#[test]
fn test_local_memory_is_cloned_per_group() {
    let mut template = FlatMemory::new(4, 0);
    template.store_u32(0, 7).unwrap();
    let kernel = ScriptKernel::new(
        "bump",
        vec![KernelOp::Store {
            space: AddressSpace::Local,
            addr: AddrExpr::fixed(0),
            value: ValueExpr::Const(99),
        }],
    )
    .with_local_template(template);
    let mut global = FlatMemory::new(0, 0);

    let mut first = new_group(&kernel, &mut global, [1, 1, 1]);
    first.run(&kernel, false).unwrap();
    assert_eq!(first.local_memory().load_u32(0).unwrap(), 99);
    drop(first);

    let second = new_group(&kernel, &mut global, [1, 1, 1]);
    assert_eq!(second.local_memory().load_u32(0).unwrap(), 7);
}

/// 记录调度顺序的工作项
struct Recorder {
    ids: WorkItemIds,
    state: WorkItemState,
    log: Rc<RefCell<Vec<usize>>>,
    rogue: bool,
}

impl WorkItem for Recorder {
    fn state(&self) -> WorkItemState {
        self.state
    }

    fn step(&mut self, ctx: &mut GroupContext<'_>, _trace: bool) -> Result<WorkItemState, GroupError> {
        self.log.borrow_mut().push(self.ids.local_linear);
        if self.rogue {
            ctx.await_event(EventId(42))?;
        }
        self.state = WorkItemState::Finished;
        Ok(self.state)
    }

    fn release(&mut self) {
        self.state = self.state.release();
    }

    fn ids(&self) -> &WorkItemIds {
        &self.ids
    }

    fn dump_private_memory(&self) {}
}

struct RecorderKernel {
    local: FlatMemory,
    log: Rc<RefCell<Vec<usize>>>,
    rogue: bool,
}

impl RecorderKernel {
    fn new(rogue: bool) -> Self {
        Self {
            local: FlatMemory::new(0, 0),
            log: Rc::default(),
            rogue,
        }
    }
}

impl Kernel for RecorderKernel {
    type Item = Recorder;

    fn name(&self) -> &str {
        "recorder"
    }

    fn local_memory(&self) -> &dyn Memory {
        &self.local
    }

    fn create_work_item(&self, ids: WorkItemIds) -> Recorder {
        Recorder {
            ids,
            state: WorkItemState::Ready,
            log: Rc::clone(&self.log),
            rogue: self.rogue,
        }
    }
}

#[test]
fn test_await_event_nobody_created() {
    let kernel = RecorderKernel::new(true);
    let mut global = FlatMemory::new(0, 0);

    let mut group = WorkGroup::new(&kernel, &mut global, 1, [0, 0, 0], [4, 1, 1], [4, 1, 1]).unwrap();
    let err = group.run(&kernel, false).unwrap_err();

    assert_eq!(err, GroupError::UnknownEvent { event: EventId(42) });
    assert_eq!(*kernel.log.borrow(), vec![0]);
}

proptest! {
    #[test]
    fn items_stored_and_visited_in_linear_order(x in 1usize..5, y in 1usize..4, z in 1usize..3) {
        let size = [x, y, z];
        let kernel = RecorderKernel::new(false);
        let mut global = FlatMemory::new(0, 0);

        let mut group = WorkGroup::new(&kernel, &mut global, 3, [0, 0, 0], size, size).unwrap();
        for k in 0..z {
            for j in 0..y {
                for i in 0..x {
                    let index = i + (j + k * y) * x;
                    prop_assert_eq!(group.work_items()[index].ids().local, [i, j, k]);
                }
            }
        }

        group.run(&kernel, false).unwrap();
        let visited = kernel.log.borrow().clone();
        let expected: Vec<usize> = (0..x * y * z).collect();
        prop_assert_eq!(visited, expected);
    }
}
