/// `/proc` readers used for resource sampling
use std::fs;
use std::path::Path;

/// Snapshot of one process as reported by procfs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub pgrp: i32,
    /// user + system time, milliseconds
    pub cpu_ms: u64,
    /// Current resident set, KB
    pub rss_kb: u64,
    /// High-water resident set, KB
    pub hwm_kb: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

pub fn clock_ticks_per_sec() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// Parse `/proc/<pid>/stat` into (pgrp, utime + stime ticks).
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`.
pub fn parse_stat(content: &str) -> Option<(i32, u64)> {
    let after_comm = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is state (field 3); pgrp is field 5, utime 14, stime 15
    let pgrp = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((pgrp, utime + stime))
}

/// Pull `VmRSS` and `VmHWM` (KB) out of `/proc/<pid>/status`
pub fn parse_status(content: &str) -> (u64, u64) {
    let mut rss = 0;
    let mut hwm = 0;
    for line in content.lines() {
        let target = if line.starts_with("VmRSS:") {
            &mut rss
        } else if line.starts_with("VmHWM:") {
            &mut hwm
        } else {
            continue;
        };
        if let Some(value) = line.split_whitespace().nth(1).and_then(|v| v.parse().ok()) {
            *target = value;
        }
    }
    (rss, hwm)
}

/// Pull `read_bytes` / `write_bytes` out of `/proc/<pid>/io`
pub fn parse_io(content: &str) -> (u64, u64) {
    let mut read = 0;
    let mut write = 0;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().parse().unwrap_or(0);
            match key {
                "read_bytes" => read = value,
                "write_bytes" => write = value,
                _ => {}
            }
        }
    }
    (read, write)
}

/// Read one process. Returns `None` once the process is gone.
pub fn read_process(pid: i32, ticks_per_sec: u64) -> Option<ProcStat> {
    let base = format!("/proc/{}", pid);
    let stat = fs::read_to_string(format!("{}/stat", base)).ok()?;
    let (pgrp, ticks) = parse_stat(&stat)?;
    let (rss_kb, hwm_kb) = fs::read_to_string(format!("{}/status", base))
        .map(|s| parse_status(&s))
        .unwrap_or((0, 0));
    // io is often unreadable without ptrace rights; treat as zero
    let (read_bytes, write_bytes) = fs::read_to_string(format!("{}/io", base))
        .map(|s| parse_io(&s))
        .unwrap_or((0, 0));

    Some(ProcStat {
        pid,
        pgrp,
        cpu_ms: ticks * 1000 / ticks_per_sec.max(1),
        rss_kb,
        hwm_kb,
        read_bytes,
        write_bytes,
    })
}

/// Every live process whose process group is `pgid`
pub fn group_members(pgid: i32, ticks_per_sec: u64) -> Vec<ProcStat> {
    let entries = match fs::read_dir(Path::new("/proc")) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(|pid| read_process(pid, ticks_per_sec))
        .filter(|stat| stat.pgrp == pgid)
        .collect()
}
