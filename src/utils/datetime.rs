use chrono::{Datelike, Timelike, Utc};

/// Compact UTC timestamp for file and directory names, e.g. `20260829-143005`.
pub fn dirstamp() -> String {
    let now = Utc::now();
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
    )
}
