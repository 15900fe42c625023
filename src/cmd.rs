use std::ffi::OsStr;
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const EXTERNAL_CMD_POLL_INTERVAL_MS: u64 = 200;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(unix)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // Own process group, so the whole tree can be signalled through `-pid`.
    cmd.process_group(0);
}

#[cfg(not(any(windows, unix)))]
fn configure_for_background(_cmd: &mut Command) {}

#[derive(Debug)]
pub enum CommandRunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    TimedOut(u64),
}

pub fn kill_child_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
    }

    #[cfg(unix)]
    {
        // SAFETY: kill(2) only reads its arguments. The child is not reaped yet,
        // so its pid still names the group `command` put it in.
        let _ = unsafe { libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL) };
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Runs `cmd` to completion, killing it once `timeout_secs` elapse (0 disables the limit).
pub fn run_command_output_with_timeout(
    cmd: &mut Command,
    timeout_secs: u64,
) -> std::result::Result<Output, CommandRunError> {
    use std::io::ErrorKind;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(CommandRunError::Spawn)?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stdout pipe missing"))
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stderr pipe missing"))
    })?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let started = Instant::now();
    let mut timed_out = false;

    loop {
        if !timed_out
            && timeout_secs > 0
            && started.elapsed() >= Duration::from_secs(timeout_secs)
        {
            kill_child_process_tree(&mut child);
            timed_out = true;
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                if timed_out {
                    return Err(CommandRunError::TimedOut(timeout_secs));
                }
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                thread::sleep(Duration::from_millis(EXTERNAL_CMD_POLL_INTERVAL_MS));
            }
            Err(err) => {
                kill_child_process_tree(&mut child);
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(CommandRunError::Wait(err));
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn collects_output_of_fast_command() {
        let mut cmd = command("sh");
        cmd.args(["-c", "echo out; echo err 1>&2"]);
        let output = run_command_output_with_timeout(&mut cmd, 10).expect("run");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }

    #[test]
    fn kills_command_after_timeout() {
        let mut cmd = command("sh");
        cmd.args(["-c", "exec sleep 30"]);
        let started = Instant::now();
        let err = run_command_output_with_timeout(&mut cmd, 1).expect_err("should time out");
        assert!(matches!(err, CommandRunError::TimedOut(1)));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        // The background sleep keeps stdout open after its parent shell dies.
        let mut cmd = command("sh");
        cmd.args(["-c", "sleep 30 & wait"]);
        let started = Instant::now();
        let err = run_command_output_with_timeout(&mut cmd, 1).expect_err("should time out");
        assert!(matches!(err, CommandRunError::TimedOut(1)));
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    }

    #[test]
    fn kill_reaches_the_whole_process_group() {
        let mut child = command("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn");
        let mut stdout = child.stdout.take().expect("stdout");
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        kill_child_process_tree(&mut child);
        let mut rest = Vec::new();
        stdout.read_to_end(&mut rest).expect("read to eof");
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut cmd = command("definitely-not-a-real-tool-xyz");
        let err = run_command_output_with_timeout(&mut cmd, 1).expect_err("should fail");
        assert!(matches!(err, CommandRunError::Spawn(_)));
    }
}
