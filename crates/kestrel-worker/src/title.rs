//! Process titles, so `ps` shows what each process is doing

use tracing::debug;

/// Linux keeps at most this many bytes of a thread name
pub const MAX_TITLE_LEN: usize = 15;

/// Record the current phase in the process name
pub fn set(phase: &str) {
    debug!(title = phase, "Process title");

    #[cfg(target_os = "linux")]
    {
        if let Err(e) = set_process_name(truncate(phase, MAX_TITLE_LEN)) {
            debug!("Failed to set process name: {}", e);
        }
    }
}

/// Rename the main thread, whose name is what `ps` shows, from whichever
/// runtime thread the caller is on.
#[cfg(target_os = "linux")]
fn set_process_name(name: &str) -> std::io::Result<()> {
    std::fs::write(format!("/proc/self/task/{}/comm", std::process::id()), name)
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
