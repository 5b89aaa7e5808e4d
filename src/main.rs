//! simt_sim CLI 示例入口
//!
//! 演示一次 1 维 kernel 分发：每个工作组用 async copy 把自己的数据块
//! 搬进局部内存，等待事件完成后倒序写回全局内存的输出区。

use std::process::ExitCode;

use simt_sim::dispatch::{DispatchConfig, Dispatcher};
use simt_sim::kernel::{AddrExpr, AddressSpace, Builtin, KernelOp, ScriptKernel};
use simt_sim::memory::Memory;
use simt_sim::work_group::CopyDirection;

#[derive(clap::Parser, Debug)]
#[command(name = "simt_sim_cli")]
#[command(about = "Sequential SIMT work-group simulator demo")]
struct Args {
    /// Number of work-groups.
    #[clap(long, default_value_t = 2)]
    groups: usize,
    /// Work-items per group.
    #[clap(long, default_value_t = 4)]
    local_size: usize,
    /// Print a per-step execution trace.
    #[clap(long)]
    trace: bool,
    /// Dump local and private memory after each group.
    #[clap(long)]
    dump: bool,
    /// Make the last work-item skip the event wait, to show divergence detection.
    #[clap(long)]
    diverge: bool,
    /// Stop at the first failing work-group.
    #[clap(long)]
    stop_on_fault: bool,
    /// Enable debug logging.
    #[clap(long, short)]
    verbose: bool,
}

/// 构造倒序 kernel
fn reverse_kernel(local_size: usize, out_base: u64, skip_wait_at: Option<usize>) -> ScriptKernel {
    let chunk = (local_size * 4) as u64;
    let mut program = vec![KernelOp::AsyncCopy {
        direction: CopyDirection::GlobalToLocal,
        dest: AddrExpr::fixed(0),
        src: AddrExpr::indexed(0, chunk as i64, Builtin::GroupId(0)),
        size: chunk as usize,
        event: 0,
    }];
    if let Some(gid) = skip_wait_at {
        program.push(KernelOp::SkipIf {
            when: Builtin::GlobalLinear,
            equals: gid,
            count: 1,
        });
    }
    program.extend([
        KernelOp::WaitEvents { events: vec![0] },
        KernelOp::Copy {
            from: AddressSpace::Local,
            src: AddrExpr::indexed(chunk - 4, -4, Builtin::LocalId(0)),
            to: AddressSpace::Global,
            dst: AddrExpr::indexed(out_base, 4, Builtin::GlobalId(0)),
        },
        KernelOp::Return,
    ]);

    ScriptKernel::new("reverse_chunks", program).with_local_memory(chunk as usize)
}

fn main() -> ExitCode {
    let args = <Args as clap::Parser>::parse();

    let level = if args.verbose || args.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();
    tracing::debug!(?args, "simulator args");

    println!("=== simt_sim: 工作组调度演示 ===\n");

    let global_size = args.groups * args.local_size;
    let out_base = (global_size * 4) as u64;

    let config = DispatchConfig::new()
        .with_work_dim(1)
        .with_global_size([global_size, 1, 1])
        .with_local_size([args.local_size, 1, 1])
        .with_global_memory(0, global_size * 8)
        .with_trace(args.trace)
        .with_dump_memory(args.dump)
        .with_stop_on_fault(args.stop_on_fault);

    let mut dispatcher = match Dispatcher::from_config(config) {
        Ok(d) => d,
        Err(err) => {
            eprintln!("配置错误: {err}");
            return ExitCode::FAILURE;
        }
    };

    // 输入区写入 0..N
    for i in 0..global_size {
        if let Err(err) = dispatcher.global_memory_mut().store_u32((i * 4) as u64, i as u32) {
            eprintln!("初始化全局内存失败: {err}");
            return ExitCode::FAILURE;
        }
    }

    let skip_wait_at = args.diverge.then(|| global_size.saturating_sub(1));
    let kernel = reverse_kernel(args.local_size, out_base, skip_wait_at);
    let report = dispatcher.run(&kernel);

    println!("Kernel: {}", report.kernel);
    for group in &report.groups {
        match &group.outcome {
            Ok(()) => println!("  group {:?}: 完成", group.group_id),
            Err(err) => println!(
                "  group {:?}: 失败 ({} 个工作项已完成) - {}",
                group.group_id, group.finished, err
            ),
        }
    }

    let output: Vec<String> = (0..global_size)
        .map(|i| {
            dispatcher
                .global_memory()
                .load_u32(out_base + (i * 4) as u64)
                .map_or_else(|_| "?".to_string(), |v| v.to_string())
        })
        .collect();
    println!("输出: [{}]", output.join(", "));

    if args.dump {
        dispatcher.dump();
    }

    if report.is_success() {
        println!("✓ 全部工作组完成");
        ExitCode::SUCCESS
    } else {
        println!("✗ {} 个工作组失败", report.faults().count());
        ExitCode::FAILURE
    }
}
