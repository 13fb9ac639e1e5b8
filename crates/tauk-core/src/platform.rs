//! Host facts reported when a run starts.

use chrono::{Datelike, Local, Offset, TimeZone, Utc};
use std::env;
use std::fs;
use std::path::Path;

/// Milliseconds since the epoch, UTC.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// IANA name of the local time zone, e.g. `Europe/Berlin`.
///
/// Checked in order: `TZ`, `/etc/timezone`, the `/etc/localtime` link.
/// Falls back to the current UTC offset.
pub fn local_timezone() -> String {
    if let Some(tz) = env::var("TZ")
        .ok()
        .map(|tz| tz.trim_start_matches(':').trim().to_string())
        .filter(|tz| !tz.is_empty() && !tz.starts_with('/'))
    {
        return tz;
    }

    if let Ok(contents) = fs::read_to_string("/etc/timezone") {
        let name = contents.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }

    if let Some(name) = zone_from_link(Path::new("/etc/localtime")) {
        return name;
    }

    offset_name(Local::now().offset().fix().local_minus_utc())
}

fn zone_from_link(path: &Path) -> Option<String> {
    let target = fs::read_link(path).ok()?;
    let target = target.to_string_lossy();
    let (_, name) = target.split_once("zoneinfo/")?;
    (!name.is_empty()).then(|| name.to_string())
}

fn offset_name(seconds: i32) -> String {
    if seconds == 0 {
        return "UTC".to_string();
    }
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.abs() / 60;
    format!("UTC{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
}

/// Whether daylight saving time is in effect locally.
///
/// The standard offset is the smaller of the January and July offsets; DST
/// is in effect when the current offset differs from it.
pub fn is_dst() -> bool {
    let now = Local::now();
    let offset_at = |month: u32| {
        Local
            .with_ymd_and_hms(now.year(), month, 1, 12, 0, 0)
            .single()
            .map(|dt| dt.offset().fix().local_minus_utc())
    };

    match (offset_at(1), offset_at(7)) {
        (Some(january), Some(july)) if january != july => {
            now.offset().fix().local_minus_utc() != january.min(july)
        }
        _ => false,
    }
}

/// Operating system name in the form `Linux`, `Darwin` or `Windows`.
pub fn host_os_name() -> String {
    match env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "Darwin".to_string(),
        "windows" => "Windows".to_string(),
        other => other.to_string(),
    }
}

/// Kernel release where the host exposes one.
pub fn host_os_version() -> String {
    fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Whether a process with this id currently exists.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // 0 and negative ids address process groups
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => {
                matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
            }
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        pid != 0
    }
}
