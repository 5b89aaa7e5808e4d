//! 内存抽象层
//!
//! 本模块定义了地址空间的统一接口 `Memory` trait，
//! 以及用于功能仿真的简单线性内存实现 `FlatMemory`。
//!
//! 工作组内会同时出现两类地址空间：
//! - 全局内存：所有工作组共享，生命周期长于任何工作组
//! - 局部内存：每个工作组私有，由 kernel 提供的模板克隆而来

use thiserror::Error;

/// 内存访问错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    /// 地址未按访问粒度对齐
    #[error("Unaligned {size}-byte access at 0x{addr:08x}")]
    Unaligned { addr: u64, size: usize },
    /// 地址越界（未映射到当前内存区域）
    #[error(
        "Out-of-range {size}-byte access at 0x{addr:08x} (region base=0x{base:08x}, size=0x{region_size:x})"
    )]
    OutOfRange {
        addr: u64,
        size: usize,
        base: u64,
        region_size: usize,
    },
}

pub type MemResult<T> = Result<T, MemError>;

/// 地址空间的统一接口
///
/// 工作组调度器只依赖这组能力：按字节块读写、克隆、用量查询与调试输出。
pub trait Memory {
    /// 检查 `[addr, addr + len)` 是否完全落在本地址空间内
    ///
    /// 零长度访问总是合法。
    fn check_range(&self, addr: u64, len: usize) -> MemResult<()>;

    /// 从 `addr` 读取 `dst.len()` 字节
    fn load(&self, dst: &mut [u8], addr: u64) -> MemResult<()>;

    /// 向 `addr` 写入 `src` 的全部字节
    fn store(&mut self, src: &[u8], addr: u64) -> MemResult<()>;

    /// 克隆出一个独立的地址空间（包括当前内容）
    fn clone_box(&self) -> Box<dyn Memory>;

    /// 已分配的字节数
    fn total_allocated(&self) -> usize;

    /// 打印内存内容（用于调试）
    fn dump(&self);

    /// 读取 32 位数据（小端序）
    fn load_u32(&self, addr: u64) -> MemResult<u32> {
        if !addr.is_multiple_of(4) {
            return Err(MemError::Unaligned { addr, size: 4 });
        }
        let mut bytes = [0u8; 4];
        self.load(&mut bytes, addr)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// 写入 32 位数据（小端序）
    fn store_u32(&mut self, addr: u64, value: u32) -> MemResult<()> {
        if !addr.is_multiple_of(4) {
            return Err(MemError::Unaligned { addr, size: 4 });
        }
        self.store(&value.to_le_bytes(), addr)
    }
}

/// 简单线性内存实现
///
/// 使用 `Vec<u8>` 存储一段连续地址空间，支持可选的基地址偏移。
#[derive(Debug, Clone, Default)]
pub struct FlatMemory {
    /// 内存数据存储
    data: Vec<u8>,
    /// 内存映射起始地址
    base_addr: u64,
}

impl FlatMemory {
    /// 创建一个指定大小的内存区域
    ///
    /// # 示例
    ///
    /// ```
    /// use simt_sim::memory::{FlatMemory, Memory};
    ///
    /// let mem = FlatMemory::new(1024, 0);
    /// assert_eq!(mem.total_allocated(), 1024);
    /// ```
    pub fn new(size: usize, base_addr: u64) -> Self {
        FlatMemory {
            data: vec![0; size],
            base_addr,
        }
    }

    /// 获取内存的基地址
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    fn bounds_check(&self, addr: u64, len: usize) -> MemResult<usize> {
        let out_of_range = MemError::OutOfRange {
            addr,
            size: len,
            base: self.base_addr,
            region_size: self.data.len(),
        };

        let relative = addr.checked_sub(self.base_addr).ok_or(out_of_range)?;
        let relative = usize::try_from(relative).map_err(|_| out_of_range)?;
        let end = relative.checked_add(len).ok_or(out_of_range)?;

        if end > self.data.len() {
            return Err(out_of_range);
        }

        Ok(relative)
    }

    /// 批量写入数据到内存
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> MemResult<()> {
        self.store(data, addr)
    }

    /// 批量读取数据，返回副本
    pub fn read_bytes(&self, addr: u64, len: usize) -> MemResult<Vec<u8>> {
        self.check_range(addr, len)?;
        let mut out = vec![0; len];
        self.load(&mut out, addr)?;
        Ok(out)
    }

    /// 将指定范围填充为固定字节
    pub fn fill(&mut self, addr: u64, len: usize, value: u8) -> MemResult<()> {
        if len == 0 {
            return Ok(());
        }
        let start = self.bounds_check(addr, len)?;
        self.data[start..start + len].fill(value);
        Ok(())
    }
}

impl Memory for FlatMemory {
    fn check_range(&self, addr: u64, len: usize) -> MemResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.bounds_check(addr, len).map(|_| ())
    }

    fn load(&self, dst: &mut [u8], addr: u64) -> MemResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let start = self.bounds_check(addr, dst.len())?;
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        Ok(())
    }

    fn store(&mut self, src: &[u8], addr: u64) -> MemResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let start = self.bounds_check(addr, src.len())?;
        self.data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Memory> {
        Box::new(self.clone())
    }

    fn total_allocated(&self) -> usize {
        self.data.len()
    }

    fn dump(&self) {
        for (row, chunk) in self.data.chunks(16).enumerate() {
            print!("  0x{:08x}:", self.base_addr + (row * 16) as u64);
            for b in chunk {
                print!(" {:02x}", b);
            }
            println!();
        }
    }
}
