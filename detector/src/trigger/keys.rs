use chrono::{DateTime, Utc};

pub const SNAPSHOT_PREFIX: &str = "snap_";
pub const SNAPSHOT_EXT: &str = ".jpg";

fn fmt_ts(ts_secs: f64) -> String {
    let micros = (ts_secs * 1_000_000.0) as i64;
    let dt: DateTime<Utc> = DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now);
    dt.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// File name for a snapshot taken at `ts_secs`.
/// e.g. "snap_20260218T093000000Z.jpg"
///
/// Names sort lexicographically in capture order.
pub fn snapshot_file_name(ts_secs: f64) -> String {
    format!("{SNAPSHOT_PREFIX}{}{SNAPSHOT_EXT}", fmt_ts(ts_secs))
}

/// `true` for a finished snapshot name that is safe to join onto the store
/// directory.
pub fn is_snapshot_name(name: &str) -> bool {
    name.starts_with(SNAPSHOT_PREFIX)
        && name.ends_with(SNAPSHOT_EXT)
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_format() {
        // 2026-02-18T09:30:00.000Z
        let name = snapshot_file_name(1771407000.0);
        assert_eq!(name, "snap_20260218T093000000Z.jpg");
        assert!(is_snapshot_name(&name));
    }

    #[test]
    fn names_sort_by_time() {
        let earlier = snapshot_file_name(1771407000.0);
        let later = snapshot_file_name(1771407006.25);
        assert!(earlier < later);
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(!is_snapshot_name("../snap_x.jpg"));
        assert!(!is_snapshot_name("snap_../../etc.jpg"));
        assert!(!is_snapshot_name("snap_a/b.jpg"));
        assert!(!is_snapshot_name(".snap_20260218T093000000Z.jpg.tmp"));
        assert!(!is_snapshot_name("other.jpg"));
    }
}
