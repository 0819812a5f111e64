/// Process-group termination
///
/// Capsule commands run in their own process group, so a timeout can take
/// down every descendant without touching the caller.
use log::{debug, warn};
use std::time::{Duration, Instant};

/// What the termination sequence actually did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// SIGTERM the whole group, give it `grace` to exit, then SIGKILL.
/// Falls back to signalling the leader alone if the group is gone.
pub fn terminate_group(pgid: i32, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    let term_rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if term_rc == 0 {
        report.term_sent = true;
    } else {
        let _ = unsafe { libc::kill(pgid, libc::SIGTERM) };
        report.term_sent = true;
        report.notes.push(format!(
            "group SIGTERM fallback used: {}",
            std::io::Error::last_os_error()
        ));
    }

    std::thread::sleep(grace);

    let kill_rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if kill_rc == 0 {
        report.kill_sent = true;
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!("Process group {} exited during grace period", pgid);
        } else {
            let _ = unsafe { libc::kill(pgid, libc::SIGKILL) };
            report.kill_sent = true;
            warn!("Group SIGKILL for {} failed: {}", pgid, err);
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", err));
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn test_terminate_group_kills_leader_and_children() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id() as i32;

        let report = terminate_group(pgid, Duration::from_millis(50));
        assert!(report.term_sent);

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
