//! Subprocess spawning for server-side tunnels.
//!
//! Every new tunnel gets a fresh child whose stdout feeds the tunnel and whose
//! stdin receives the client's bytes. Children are spawned with
//! `kill_on_drop(true)` in their own process group, so a cancelled session
//! never leaves an orphan behind.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::ProcessConfig;
use crate::util::expand_tilde;

/// Produces the child process bridged by a new tunnel.
pub trait ProcessFactory: Send + Sync {
    /// Spawn with stdin and stdout piped.
    fn spawn(&self) -> std::io::Result<Child>;
}

/// Spawns a fixed command line, e.g. `sshd -i`.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    program: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: HashMap<String, String>,
}

impl CommandFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            working_dir: Some(expand_tilde(&config.working_dir).into_owned()),
            env: config.env.clone(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ProcessFactory for CommandFactory {
    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        // SAFETY: setpgid is async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        cmd.spawn()
    }
}

/// Send SIGTERM to the whole process group led by `pid`.
pub fn terminate_group(pid: u32) -> std::io::Result<()> {
    let pgid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) with a negative pid signals the group; no memory is shared.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
