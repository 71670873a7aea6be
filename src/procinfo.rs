//! Process-tree queries over `/proc`.
//!
//! Everything here races with process exit by nature. A pid vanishing
//! mid-enumeration is normal operation, not an error: lookups map
//! "no such process" to [`ProcError::Gone`] and walkers skip those
//! entries. Any other failure aborts the walk so callers never work
//! with partial numbers.

use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    /// The process exited between enumeration and lookup.
    #[error("no such process")]
    Gone,
    #[error("procfs read failed: {0}")]
    Io(#[from] io::Error),
    #[error("unparseable procfs data: {0}")]
    Parse(String),
}

fn map_read_err(e: io::Error) -> ProcError {
    match e.kind() {
        io::ErrorKind::NotFound => ProcError::Gone,
        // procfs sometimes surfaces ESRCH directly when racing an exit.
        _ if e.raw_os_error() == Some(nix::libc::ESRCH) => ProcError::Gone,
        _ => ProcError::Io(e),
    }
}

/// Slice of `/proc/<pid>/stat` this crate cares about.
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    pub pgrp: i32,
    utime_ticks: u64,
    stime_ticks: u64,
    cutime_ticks: u64,
    cstime_ticks: u64,
}

pub fn read_proc_stat(pid: i32) -> Result<ProcStat, ProcError> {
    let data =
        std::fs::read_to_string(format!("/proc/{}/stat", pid)).map_err(map_read_err)?;
    parse_proc_stat(&data)
}

/// The comm field is parenthesized and may itself contain spaces or
/// parens, so split on the last `) ` before field parsing.
fn parse_proc_stat(data: &str) -> Result<ProcStat, ProcError> {
    let open = data
        .find(" (")
        .ok_or_else(|| ProcError::Parse("missing comm open paren".to_string()))?;
    let close = data
        .rfind(") ")
        .ok_or_else(|| ProcError::Parse("missing comm close paren".to_string()))?;
    let pid = data[..open]
        .trim()
        .parse::<i32>()
        .map_err(|e| ProcError::Parse(format!("pid: {}", e)))?;
    let comm = data[open + 2..close].to_string();
    let fields: Vec<&str> = data[close + 2..].split_whitespace().collect();
    // Fields after comm, zero-indexed: 0=state 1=ppid 2=pgrp,
    // 11=utime 12=stime 13=cutime 14=cstime.
    let field = |idx: usize| -> Result<&str, ProcError> {
        fields
            .get(idx)
            .copied()
            .ok_or_else(|| ProcError::Parse(format!("stat field {} missing", idx)))
    };
    let parse_u64 = |s: &str| -> Result<u64, ProcError> {
        s.parse::<u64>()
            .map_err(|e| ProcError::Parse(format!("stat number: {}", e)))
    };
    Ok(ProcStat {
        pid,
        comm,
        state: field(0)?.chars().next().unwrap_or('?'),
        ppid: field(1)?
            .parse::<i32>()
            .map_err(|e| ProcError::Parse(format!("ppid: {}", e)))?,
        pgrp: field(2)?
            .parse::<i32>()
            .map_err(|e| ProcError::Parse(format!("pgrp: {}", e)))?,
        utime_ticks: parse_u64(field(11)?)?,
        stime_ticks: parse_u64(field(12)?)?,
        cutime_ticks: parse_u64(field(13)?)?,
        cstime_ticks: parse_u64(field(14)?)?,
    })
}

/// Scan every pid directory under `/proc`. Entries that disappear
/// mid-scan are skipped.
fn all_proc_stats() -> Result<Vec<ProcStat>, ProcError> {
    let mut stats = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        match read_proc_stat(pid) {
            Ok(stat) => stats.push(stat),
            Err(ProcError::Gone) => continue,
            Err(e) => {
                tracing::warn!("unexpected error reading procfs: {}", e);
                continue;
            }
        }
    }
    if stats.is_empty() {
        return Err(ProcError::Parse("unable to read any procfs stats".to_string()));
    }
    Ok(stats)
}

/// All transitive descendants of `pid`, including `pid` itself.
pub fn descendants(pid: i32) -> Result<Vec<i32>, ProcError> {
    let stats = all_proc_stats()?;
    let mut children_of: std::collections::HashMap<i32, Vec<i32>> =
        std::collections::HashMap::with_capacity(stats.len());
    for stat in &stats {
        children_of.entry(stat.ppid).or_default().push(stat.pid);
    }
    let mut seen = std::collections::HashSet::from([pid]);
    let mut queue = vec![pid];
    let mut result = vec![pid];
    while let Some(current) = queue.pop() {
        if let Some(kids) = children_of.get(&current) {
            for &kid in kids {
                if seen.insert(kid) {
                    result.push(kid);
                    queue.push(kid);
                }
            }
        }
    }
    Ok(result)
}

/// Immediate children of `pid`, from `/proc/<pid>/task/<tid>/children`.
pub fn child_pids(pid: i32) -> Result<Vec<i32>, ProcError> {
    let task_dir = format!("/proc/{}/task", pid);
    let mut children = Vec::new();
    let entries = std::fs::read_dir(Path::new(&task_dir)).map_err(map_read_err)?;
    for entry in entries {
        let entry = entry?;
        let children_file = entry.path().join("children");
        let contents = match std::fs::read_to_string(&children_file) {
            Ok(contents) => contents,
            // The task may have ended between readdir and read.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(map_read_err(e)),
        };
        for token in contents.split_whitespace() {
            let child = token
                .parse::<i32>()
                .map_err(|e| ProcError::Parse(format!("child pid: {}", e)))?;
            children.push(child);
        }
    }
    Ok(children)
}

fn clock_ticks_per_sec() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(100)
}

fn page_size() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(4096)
}

/// CPU time (user + system, self plus reaped children) of one process.
pub fn cpu_time(pid: i32) -> Result<Duration, ProcError> {
    let stat = read_proc_stat(pid)?;
    let ticks =
        stat.utime_ticks + stat.stime_ticks + stat.cutime_ticks + stat.cstime_ticks;
    // Convert through nanos to avoid truncating sub-second tick counts.
    let nanos = (ticks as u128 * 1_000_000_000u128) / clock_ticks_per_sec() as u128;
    Ok(Duration::from_nanos(nanos as u64))
}

/// CPU time summed over `pid` and all its descendants. Processes that
/// exit mid-walk may be double counted or missed; callers treat the
/// result as an estimate.
pub fn recursive_cpu_time(pid: i32) -> Result<Duration, ProcError> {
    let mut total = Duration::ZERO;
    for descendant in descendants(pid)? {
        match cpu_time(descendant) {
            Ok(t) => total += t,
            Err(ProcError::Gone) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Resident set size of one process in bytes, from `/proc/<pid>/statm`.
pub fn rss_bytes(pid: i32) -> Result<u64, ProcError> {
    let data =
        std::fs::read_to_string(format!("/proc/{}/statm", pid)).map_err(map_read_err)?;
    let rss_pages = data
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ProcError::Parse("statm missing rss field".to_string()))?
        .parse::<u64>()
        .map_err(|e| ProcError::Parse(format!("statm rss: {}", e)))?;
    Ok(rss_pages * page_size())
}
