//! 共享内存区域
//!
//! 跨进程共享的 span 标签和游标不是语言层面的引用，而是一段原始字节。
//! 这里用 offset 访问的方式建模（arena + index），所有原子字段访问都经过
//! 带边界检查的 [`SharedRegion`] 视图。
//!
//! - Linux 上用 memfd 创建，fd 可以传给另一个进程后 mmap
//! - 其它平台退化为匿名映射（仅进程内共享）
//! - 可选 mlock 防止 page fault

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

/// 一段共享内存映射
pub struct SharedMemory {
    // 保持映射存活；之后只通过 ptr 访问
    _map: MmapMut,
    ptr: *mut u8,
    len: usize,
    file: Option<File>,
    memory_locked: AtomicBool,
}

// 映射内存本身没有线程亲和性，访问纪律由 span 状态协议保证
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// 创建可跨进程共享的内存
    ///
    /// Linux 上基于 memfd，其它平台退化为匿名映射
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory length must be non-zero",
            ));
        }

        #[cfg(target_os = "linux")]
        {
            use std::ffi::CString;
            use std::os::fd::FromRawFd;

            let c_name = CString::new(name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let file = unsafe { File::from_raw_fd(fd) };
            file.set_len(len as u64)?;
            Self::from_file(file, len)
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            Self::anonymous(len)
        }
    }

    /// 匿名映射（新映射保证全零）
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let mut map = MmapMut::map_anon(len)?;
        let ptr = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            ptr,
            len,
            file: None,
            memory_locked: AtomicBool::new(false),
        })
    }

    /// 映射从别处收到的文件（例如硬件驱动给的 mmap fd）
    pub fn from_file(file: File, len: usize) -> io::Result<Self> {
        let file_len = file.metadata()?.len();
        if file_len < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("shared file is {} bytes, need {}", file_len, len),
            ));
        }
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            ptr,
            len,
            file: Some(file),
            memory_locked: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// 复制底层 fd，用于传给另一个进程
    ///
    /// 匿名映射没有 fd，返回 None
    pub fn try_clone_file(&self) -> Option<io::Result<File>> {
        self.file.as_ref().map(File::try_clone)
    }

    /// 锁定共享内存，防止被换页
    ///
    /// 在实时音频场景下，page fault 会导致严重的时序抖动。
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true; // 已经锁定
        }

        let result = unsafe { libc::mlock(self.ptr as *const libc::c_void, self.len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Shared memory locked: {} bytes", self.len);
            true
        } else {
            log::warn!(
                "Failed to lock shared memory ({})",
                io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁共享内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }
        unsafe {
            libc::munlock(self.ptr as *const libc::c_void, self.len);
        }
        log::debug!("Shared memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

/// 共享内存中的一段视图
///
/// 所有 offset 都相对视图起点，越界访问直接 panic（offset 来自内部计算的布局，
/// 越界说明布局代码有 bug）
#[derive(Clone)]
pub struct SharedRegion {
    memory: Arc<SharedMemory>,
    offset: usize,
    len: usize,
}

impl SharedRegion {
    /// 覆盖整段共享内存的视图
    pub fn whole(memory: Arc<SharedMemory>) -> Self {
        let len = memory.len();
        Self {
            memory,
            offset: 0,
            len,
        }
    }

    /// 取子视图，越界返回 None
    pub fn slice(memory: Arc<SharedMemory>, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        if end > memory.len() {
            return None;
        }
        Some(Self {
            memory,
            offset,
            len,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    /// 视图内 `offset` 处的原始指针
    #[inline]
    pub fn ptr_at(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "shared region access out of bounds: {}+{} > {}",
            offset,
            len,
            self.len
        );
        unsafe { self.memory.as_ptr().add(self.offset + offset) }
    }

    #[inline]
    fn atomic_at<T>(&self, offset: usize) -> &T {
        let size = std::mem::size_of::<T>();
        let ptr = self.ptr_at(offset, size);
        debug_assert_eq!(
            ptr as usize % std::mem::align_of::<T>(),
            0,
            "misaligned atomic at offset {}",
            offset
        );
        // SAFETY: 范围已检查；mmap 起点按页对齐，布局中的字段都按自身宽度对齐；
        // 原子类型与对应整数的内存表示相同
        unsafe { &*(ptr as *const T) }
    }

    #[inline]
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.atomic_at(offset)
    }

    #[inline]
    pub fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        self.atomic_at(offset)
    }

    #[inline]
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.atomic_at(offset)
    }

    #[inline]
    pub fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        self.atomic_at(offset)
    }

    /// 用指定字节填充 `[offset, offset + len)`
    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        let ptr = self.ptr_at(offset, len);
        unsafe { std::ptr::write_bytes(ptr, value, len) };
    }
}
