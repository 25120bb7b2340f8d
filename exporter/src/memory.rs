//! On-demand process memory sampling, for observability only.

/// A point-in-time reading of process memory, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub rss_bytes: u64,
    pub vm_bytes: u64,
}

/// Reads `/proc/self/statm`. Costs on the order of a millisecond, so callers
/// sample at an interval and from blocking threads only. `None` when procfs
/// is unavailable; sampling is never load-bearing.
pub fn sample() -> Option<MemorySample> {
    let me = procfs::process::Process::myself().ok()?;
    let statm = me.statm().ok()?;
    let page_size = procfs::page_size().unwrap_or(4096) as u64;
    Some(MemorySample {
        rss_bytes: statm.resident.saturating_mul(page_size),
        vm_bytes: statm.size.saturating_mul(page_size),
    })
}
