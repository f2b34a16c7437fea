//! Detached launching of external commands.
//!
//! Restarts are fire-and-forget: the relaunched command must outlive the
//! monitor, so it is detached from our process group (new console on
//! Windows). Only launch-time failures are reported; the child is never
//! waited on.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

/// Seam for spawning external commands, so the engine can be exercised
/// with a recording fake in tests.
pub trait Launch: Send + Sync {
    /// Spawn `command` detached, in `working_dir` when given.
    fn launch(&self, command: &str, working_dir: Option<&Path>) -> Result<()>;
}

/// Real, platform-appropriate launcher.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl Launch for ProcessLauncher {
    fn launch(&self, command: &str, working_dir: Option<&Path>) -> Result<()> {
        let mut child = shell_command(command, working_dir);
        child
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut child);

        // Spawn and drop the handle: the contract is fire-and-forget
        child
            .spawn()
            .with_context(|| format!("Failed to launch command: {command}"))?;

        info!(command = %command, "Command launched");
        Ok(())
    }
}

/// Compose the shell invocation, changing into the working directory
/// first when one is known.
fn shell_command(command: &str, working_dir: Option<&Path>) -> Command {
    let full = match working_dir {
        Some(dir) => format!("cd \"{}\" && {}", dir.display(), command),
        None => command.to_string(),
    };

    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", &full]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &full]);
        cmd
    }
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // New process group: the child survives the monitor's SIGINT
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
    cmd.creation_flags(CREATE_NEW_CONSOLE);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_succeeds_for_trivial_command() {
        let launcher = ProcessLauncher;
        assert!(launcher.launch("true", None).is_ok());
    }

    #[test]
    fn test_launch_with_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher;
        assert!(launcher.launch("true", Some(dir.path())).is_ok());
    }

    #[test]
    fn test_shell_command_composition() {
        let cmd = shell_command("python app.py", Some(Path::new("/srv/app")));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert!(args.last().unwrap().contains("cd \"/srv/app\" && python app.py"));
    }
}
