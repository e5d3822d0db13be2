//! Cache sweep.
//!
//! Every sweep interval: delete image files whose mtime is older than the
//! max age, then remove device directories left empty.  This bounds disk
//! use and guarantees a stale frame cannot outlive the device being online
//! by more than one sweep.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub files_removed: usize,
    pub dirs_removed: usize,
}

/// One sweep pass over `cache_dir`.  Synchronous filesystem walking; callers
/// run it from a timer task.
pub fn sweep_cache(cache_dir: &Path, max_age: Duration) -> std::io::Result<SweepStats> {
    let mut stats = SweepStats::default();
    let now = SystemTime::now();

    let device_dirs = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => return Err(e),
    };

    for device_dir in device_dirs.flatten() {
        let dir_path = device_dir.path();
        if !dir_path.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(&dir_path)?.flatten() {
            let path = file.path();
            let expired = file
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age > max_age);
            if expired {
                match std::fs::remove_file(&path) {
                    Ok(()) => stats.files_removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "sweep delete failed"),
                }
            }
        }
        // Empty device directory: remove; fails harmlessly if a loop just
        // wrote into it.
        if std::fs::read_dir(&dir_path)?.next().is_none()
            && std::fs::remove_dir(&dir_path).is_ok()
        {
            stats.dirs_removed += 1;
        }
    }
    Ok(stats)
}

/// Timer task wrapping [`sweep_cache`].
pub async fn run_sweeper(
    cache_dir: std::path::PathBuf,
    max_age: Duration,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
            _ = ticker.tick() => {
                match sweep_cache(&cache_dir, max_age) {
                    Ok(stats) if stats.files_removed > 0 || stats.dirs_removed > 0 => {
                        debug!(files = stats.files_removed, dirs = stats.dirs_removed, "cache swept");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "cache sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, age: Duration) {
        fs::write(path, b"jpeg").unwrap();
        let mtime = SystemTime::now() - age;
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn old_files_are_removed_and_fresh_ones_kept() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("1");
        fs::create_dir_all(&device_dir).unwrap();
        touch(&device_dir.join("channel_1.jpg"), Duration::from_secs(600));
        touch(&device_dir.join("channel_2.jpg"), Duration::from_secs(10));

        let stats = sweep_cache(dir.path(), Duration::from_secs(180)).unwrap();
        assert_eq!(stats.files_removed, 1);
        assert!(!device_dir.join("channel_1.jpg").exists());
        assert!(device_dir.join("channel_2.jpg").exists());
    }

    #[test]
    fn emptied_device_dirs_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("2");
        fs::create_dir_all(&device_dir).unwrap();
        touch(&device_dir.join("channel_1.jpg"), Duration::from_secs(600));

        let stats = sweep_cache(dir.path(), Duration::from_secs(180)).unwrap();
        assert_eq!(stats.files_removed, 1);
        assert_eq!(stats.dirs_removed, 1);
        assert!(!device_dir.exists());
    }

    #[test]
    fn missing_cache_dir_is_not_an_error() {
        let stats = sweep_cache(Path::new("/nonexistent/avfleet-cache"), Duration::from_secs(1));
        assert_eq!(stats.unwrap(), SweepStats::default());
    }

    #[test]
    fn sweep_bounds_staleness_to_max_age() {
        // No file older than max_age survives a sweep: the property that a
        // served frame's age never exceeds max_age by more than one sweep
        // interval.
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("3");
        fs::create_dir_all(&device_dir).unwrap();
        for (i, age) in [(1u32, 200u64), (2, 181), (3, 179), (4, 1)] {
            touch(
                &device_dir.join(format!("channel_{i}.jpg")),
                Duration::from_secs(age),
            );
        }

        sweep_cache(dir.path(), Duration::from_secs(180)).unwrap();
        let survivors: Vec<_> = fs::read_dir(&device_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().into_string().unwrap())
            .collect();
        assert_eq!(survivors.len(), 2);
        assert!(survivors.contains(&"channel_3.jpg".to_owned()));
        assert!(survivors.contains(&"channel_4.jpg".to_owned()));
    }
}
