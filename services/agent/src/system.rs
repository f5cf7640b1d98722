use std::path::Path;

use skiff_resources::{Resource, Resources, Value};

#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_cores: i32,
    pub total_memory_bytes: i64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let total_memory_bytes = get_total_memory();

        Self {
            cpu_cores,
            total_memory_bytes,
        }
    }

    /// The advertised bundle when no `resources` flag is given: all
    /// cpus, all memory (in MB), and the unprivileged port range.
    pub fn to_resources(&self) -> Resources {
        Resources::new([
            Resource::scalar("cpus", self.cpu_cores as f64),
            Resource::scalar("mem", (self.total_memory_bytes / (1024 * 1024)) as f64),
            Resource::new(
                "ports",
                Value::Ranges(skiff_resources::Ranges::new([(31000, 32000)])),
            ),
        ])
    }
}

fn get_cpu_count() -> i32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as i32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as i32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_total_memory() -> i64 {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let total = parse_meminfo_total(&meminfo);
        if total > 0 {
            return total;
        }
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        return (page_size * total_pages) as i64;
    }

    16 * 1024 * 1024 * 1024
}

#[cfg(not(target_os = "linux"))]
fn get_total_memory() -> i64 {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            return (page_size * total_pages) as i64;
        }
    }

    16 * 1024 * 1024 * 1024
}

#[cfg(target_os = "linux")]
fn parse_meminfo_total(content: &str) -> i64 {
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 && parts[0] == "MemTotal:" {
            const KB_TO_BYTES: i64 = 1024;
            return parts[1].parse::<i64>().unwrap_or(0) * KB_TO_BYTES;
        }
    }
    0
}

/// Fraction of the filesystem holding `path` that is in use, in [0, 1].
#[cfg(unix)]
pub fn disk_usage(path: &Path) -> std::io::Result<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    if stat.f_blocks == 0 {
        return Ok(0.0);
    }

    let used = stat.f_blocks.saturating_sub(stat.f_bfree) as f64;
    Ok((used / stat.f_blocks as f64).clamp(0.0, 1.0))
}

#[cfg(not(unix))]
pub fn disk_usage(_path: &Path) -> std::io::Result<f64> {
    Ok(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_resources() {
        let system = SystemResources::measure();
        assert!(system.cpu_cores > 0);
        assert!(system.total_memory_bytes > 0);
    }

    #[test]
    fn test_to_resources_has_standard_kinds() {
        let resources = SystemResources {
            cpu_cores: 8,
            total_memory_bytes: 16 * 1024 * 1024 * 1024,
        }
        .to_resources();

        assert_eq!(resources.scalar("cpus"), Some(8.0));
        assert_eq!(resources.scalar("mem"), Some(16384.0));
        assert!(resources.get("ports").is_some());
    }

    #[test]
    fn test_get_cpu_count() {
        assert!(get_cpu_count() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_meminfo_total() {
        let sample = "MemTotal:       16384000 kB\nMemFree:         1234567 kB\n";
        assert_eq!(parse_meminfo_total(sample), 16384000 * 1024);
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_usage_in_range() {
        let usage = disk_usage(Path::new("/")).unwrap();
        assert!((0.0..=1.0).contains(&usage));
    }
}
