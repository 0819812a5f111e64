/// Command execution with timeout, bounded output and sampled resource usage
use crate::config::types::{CelError, ResourceUsage, Result, TIMEOUT_EXIT_CODE};
use crate::exec::sampler::{Sampler, UsageAccumulator};
use crate::kernel::signal::{terminate_group, KillReport};
use crate::utils::output::{OutputCollector, OutputLimits};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One command to run
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub timeout: Duration,
    pub stdin: Option<&'a [u8]>,
}

/// Process-level outcome, before any filesystem tracking
#[derive(Debug, Clone)]
pub struct RawExecution {
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub usage: ResourceUsage,
    pub duration_ms: u64,
    pub kill_report: Option<KillReport>,
}

impl RawExecution {
    fn spawn_failure(exit_code: i32, message: String) -> Self {
        RawExecution {
            exit_code,
            timed_out: false,
            stdout: Vec::new(),
            stderr: message.into_bytes(),
            stdout_truncated: false,
            stderr_truncated: false,
            usage: ResourceUsage::default(),
            duration_ms: 0,
            kill_report: None,
        }
    }
}

/// Runs commands in their own process group
#[derive(Debug, Clone)]
pub struct Executor {
    limits: OutputLimits,
    sample_interval: Duration,
    kill_grace: Duration,
}

impl Executor {
    pub fn new(limits: OutputLimits, sample_interval: Duration, kill_grace: Duration) -> Self {
        Executor {
            limits,
            sample_interval,
            kill_grace,
        }
    }

    pub fn run(&self, req: &ExecRequest<'_>) -> Result<RawExecution> {
        let program = req
            .argv
            .first()
            .ok_or_else(|| CelError::InvalidRequest("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(&req.argv[1..])
            .current_dir(req.cwd)
            .env_clear()
            .envs(req.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if req.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .process_group(0);

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            // Same statuses a shell reports; the command failed, not the sandbox
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RawExecution::spawn_failure(
                    127,
                    format!("{}: command not found\n", program),
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Ok(RawExecution::spawn_failure(
                    126,
                    format!("{}: permission denied\n", program),
                ))
            }
            Err(e) => return Err(CelError::Process(format!("spawn {}: {}", program, e))),
        };

        let pid = child.id() as i32;
        info!("Spawned {:?} as pid {} in {}", req.argv, pid, req.cwd.display());

        let stdin_writer = match (req.stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => {
                let data = data.to_vec();
                Some(thread::spawn(move || {
                    if let Err(e) = pipe.write_all(&data) {
                        debug!("stdin write stopped: {}", e);
                    }
                }))
            }
            _ => None,
        };

        let mut collector =
            OutputCollector::start(self.limits.clone(), child.stdout.take(), child.stderr.take());
        let sampler = Sampler::spawn(pid, self.sample_interval);
        let mut acc = UsageAccumulator::default();

        let mut timed_out = false;
        let mut kill_report = None;
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };

        loop {
            let rc = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut rusage) };
            if rc == pid {
                break;
            }
            if rc == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                sampler.stop(&mut acc);
                return Err(CelError::Process(format!("wait4({}): {}", pid, err)));
            }

            if started.elapsed() >= req.timeout {
                timed_out = true;
                warn!("pid {} exceeded {:?}, terminating process group", pid, req.timeout);
                kill_report = Some(terminate_group(pid, self.kill_grace));
                loop {
                    let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
                    if rc == pid
                        || (rc == -1
                            && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR))
                    {
                        break;
                    }
                }
                break;
            }

            sampler.drain_into(&mut acc);
            collector.poll();
            thread::sleep(WAIT_POLL_INTERVAL);
        }

        // The execution ends with its group; stragglers would keep writing
        if !timed_out && unsafe { libc::kill(-pid, libc::SIGKILL) } == 0 {
            debug!("Killed leftover members of process group {}", pid);
        }

        sampler.stop(&mut acc);
        let output = collector.finish();
        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }

        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            TIMEOUT_EXIT_CODE
        };

        let usage = merge_rusage(acc.usage(), &rusage);
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            "pid {} finished: exit {} in {}ms, cpu {}ms, rss {}KB",
            pid, exit_code, duration_ms, usage.cpu_ms, usage.rss_max_kb
        );

        Ok(RawExecution {
            exit_code,
            timed_out,
            stdout: output.stdout,
            stderr: output.stderr,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
            usage,
            duration_ms,
            kill_report,
        })
    }
}

/// Fold the kernel's exit accounting into the sampled figures, keeping the
/// larger of each
fn merge_rusage(sampled: ResourceUsage, rusage: &libc::rusage) -> ResourceUsage {
    let tv_ms = |tv: &libc::timeval| tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
    let cpu_ms = tv_ms(&rusage.ru_utime) + tv_ms(&rusage.ru_stime);
    // ru_inblock / ru_oublock count 512-byte blocks
    let read_kb = rusage.ru_inblock.max(0) as u64 / 2;
    let write_kb = rusage.ru_oublock.max(0) as u64 / 2;

    ResourceUsage {
        cpu_ms: sampled.cpu_ms.max(cpu_ms),
        rss_max_kb: sampled.rss_max_kb.max(rusage.ru_maxrss.max(0) as u64),
        io_read_kb: sampled.io_read_kb.max(read_kb),
        io_write_kb: sampled.io_write_kb.max(write_kb),
    }
}
