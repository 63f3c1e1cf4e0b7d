use std::ffi::OsStr;
use std::process::{Child, Command};

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

    // Own process group so the whole tree (yt-dlp -> ffmpeg) can be signalled at once.
    cmd.process_group(0);
}

#[cfg(not(any(windows, unix)))]
fn configure_for_background(_cmd: &mut Command) {}

/// Kills `child` and everything it spawned, then reaps it.
///
/// Only ever called with a `Child` the caller still owns, so the pid cannot
/// have been recycled for an unrelated process.
pub fn kill_process_tree(child: &mut Child) {
    let pid = child.id().to_string();

    #[cfg(windows)]
    {
        let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
    }

    #[cfg(unix)]
    {
        let group = format!("-{pid}");
        let _ = Command::new("kill")
            .args(["-KILL", "--", &group])
            .status();
    }

    #[cfg(not(any(windows, unix)))]
    let _ = pid;

    let _ = child.kill();
    let _ = child.wait();
}
