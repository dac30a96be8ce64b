// SPDX-License-Identifier: Apache-2.0

//! SSH transport for tail workers.
//!
//! The exporter does not implement its own SSH stack; it drives the system
//! ssh client (`sshpass -e ssh` when a password is configured) as a child
//! process and reads the remote command's stdout. Workers are generic over
//! [`TailTransport`] so tests can substitute a local shell.

use std::process::Stdio;

use tokio::process::Command;

use crate::config::TargetSpec;

/// Builds the child process that runs `remote_cmd` on a target host.
pub trait TailTransport: Send + Sync {
    fn command(&self, target: &TargetSpec, remote_cmd: &str) -> Command;
}

/// Transport using the system ssh client.
pub struct SshTransport;

impl TailTransport for SshTransport {
    fn command(&self, target: &TargetSpec, remote_cmd: &str) -> Command {
        let mut cmd = match &target.password {
            Some(password) => {
                // sshpass reads the password from SSHPASS with -e, keeping
                // it off the command line.
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh");
                cmd.env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-o").arg("BatchMode=yes");
                cmd
            }
        };

        cmd.arg("-o").arg("StrictHostKeyChecking=no");
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            target.connect_timeout.as_secs()
        ));

        if let Some(pkey) = &target.pkey {
            cmd.arg("-i").arg(pkey);
        }
        if let Some(user) = &target.user {
            cmd.arg("-l").arg(user);
        }

        cmd.arg(&target.host);
        cmd.arg(remote_cmd);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Remote command for one tail session: announce readiness, then follow the
/// file from its current end (surviving rotation).
pub fn tail_command(file: &str, sentinel: &str) -> String {
    format!(
        "printf '%s\\n' {}; exec tail -n0 -F -- {}",
        shell_quote(sentinel),
        shell_quote(file)
    )
}

/// Single-quote a string for the remote POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}
