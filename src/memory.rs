/// Process-wide resident memory sampler.
pub trait MemorySampler: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads the resident set size from `/proc/self/statm`.
#[derive(Debug, Default)]
pub struct ProcMemorySampler;

impl MemorySampler for ProcMemorySampler {
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(page_size).ok().map(|size| pages * size)
    }
}
