//! Temp-file housekeeping (spec §5 "Shared-resource policy"): the
//! fetching process owns its staged files, but nothing ever deletes its
//! own output immediately, so a periodic sweep reclaims anything older
//! than eight days.

use std::path::Path;
use std::time::{Duration, SystemTime};

const MAX_AGE: Duration = Duration::from_secs(8 * 24 * 60 * 60);

/// Delete regular files directly under `dir` whose modification time is
/// older than eight days. Errors reading individual entries are logged
/// and skipped rather than aborting the sweep.
pub fn sweep_temp_dir(dir: &Path, now: SystemTime) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("housekeeping: failed to read directory entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let age = match entry.metadata().and_then(|m| m.modified()).and_then(|m| {
            now.duration_since(m).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }) {
            Ok(age) => age,
            Err(e) => {
                log::warn!("housekeeping: could not determine age of {}: {e}", path.display());
                continue;
            }
        };
        if age > MAX_AGE {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("housekeeping: failed to remove {}: {e}", path.display());
            } else {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn sweeping_from_nine_days_in_the_future_removes_everything_present_now() {
        let dir = std::env::temp_dir().join(format!("nr-rail-core-housekeeping-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.gz"), b"x").unwrap();
        std::fs::write(dir.join("b.gz"), b"x").unwrap();

        let now = SystemTime::now() + StdDuration::from_secs(9 * 24 * 60 * 60);
        let removed = sweep_temp_dir(&dir, now).unwrap();
        assert_eq!(removed, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn leaves_fresh_files_alone_under_present_day_clock() {
        let dir = std::env::temp_dir().join(format!("nr-rail-core-housekeeping-fresh-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("fresh.gz"), b"x").unwrap();

        let removed = sweep_temp_dir(&dir, SystemTime::now()).unwrap();
        assert_eq!(removed, 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
