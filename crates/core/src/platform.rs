//! Platform probes
//!
//! Sector size is an input to WAL and segment alignment. When it is not
//! configured, it is read from the filesystem holding the data directory;
//! 4096 is used whenever the probe is unavailable or implausible.

use std::path::Path;

/// Sector size assumed when detection fails.
pub const DEFAULT_SECTOR_SIZE: usize = 4096;

const MIN_SECTOR_SIZE: usize = 512;
const MAX_SECTOR_SIZE: usize = 64 * 1024;

/// Detect the preferred I/O block size of the filesystem containing `dir`.
pub fn detect_sector_size(dir: &Path) -> usize {
    match probe(dir) {
        Some(size) if plausible(size) => size,
        Some(size) => {
            tracing::debug!(
                target: "quiver::platform",
                reported = size,
                fallback = DEFAULT_SECTOR_SIZE,
                "Ignoring implausible block size"
            );
            DEFAULT_SECTOR_SIZE
        }
        None => DEFAULT_SECTOR_SIZE,
    }
}

fn plausible(size: usize) -> bool {
    size.is_power_of_two() && (MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&size)
}

#[cfg(unix)]
fn probe(dir: &Path) -> Option<usize> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(dir).ok()?;
    usize::try_from(meta.blksize()).ok()
}

#[cfg(not(unix))]
fn probe(_dir: &Path) -> Option<usize> {
    None
}

/// Round `len` up to the next multiple of `align` (a power of two).
#[inline]
pub fn align_up(len: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (len + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_returns_plausible_size() {
        let dir = tempfile::tempdir().unwrap();
        let size = detect_sector_size(dir.path());
        assert!(plausible(size));
    }

    #[test]
    fn test_missing_dir_falls_back() {
        assert_eq!(
            detect_sector_size(Path::new("/definitely/not/a/real/dir")),
            DEFAULT_SECTOR_SIZE
        );
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
