// GPU device API
// Mirrors the subset of rte_gpudev.h needed for payload placement.

/// GPU page size used to round external memory regions
pub const GPU_PAGE_SIZE: usize = 1 << 16;

/// Host page size used to align GPU allocations
pub const CPU_PAGE_SIZE: usize = 4096;

/// GPU device ID
pub type GpuId = u16;

/// Properties of a GPU device (rte_gpu_info)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub dev_id: GpuId,
    pub name: String,
    pub parent: Option<GpuId>,
    pub numa_node: i32,
    pub total_memory: u64,
    pub processor_count: u32,
}

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, GPU_PAGE_SIZE), 0);
        assert_eq!(align_up(1, GPU_PAGE_SIZE), GPU_PAGE_SIZE);
        assert_eq!(align_up(GPU_PAGE_SIZE, GPU_PAGE_SIZE), GPU_PAGE_SIZE);
        assert_eq!(align_up(1024 * 8000, GPU_PAGE_SIZE), 125 * GPU_PAGE_SIZE);
        assert_eq!(align_up(4097, CPU_PAGE_SIZE), 8192);
    }
}
