use std::sync::OnceLock;

/// Alignment for the shared buffer backing memory.
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Returns the page size of the underlying OS. Value is cached after the
/// first call.
pub(crate) fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}
