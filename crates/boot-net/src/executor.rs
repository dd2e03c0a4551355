use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::command::{self, format_command_display};
use crate::error::Result;
use crate::namespace::NamespaceManager;

/// Runs helper programs inside a named network namespace without moving the
/// calling process.
///
/// The child joins the namespace between `fork` and `exec`; the parent's
/// active namespace never changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamespaceAwareExecutor;

impl NamespaceAwareExecutor {

    /// Run `program args...` in `netns`, returning trimmed stdout.
    pub fn run(
        &self,
        namespaces: &NamespaceManager,
        netns: &str,
        program: &str,
        args: &[&str],
    ) -> Result<String> {
        let fd = namespaces.descriptor(netns)?.as_raw_fd();

        let mut cmd = Command::new(program);
        cmd.args(args);
        // SAFETY: the closure only calls setns(2), which is async-signal-safe,
        // and `fd` stays open in the parent for the lifetime of `namespaces`.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setns(fd, libc::CLONE_NEWNET) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let output = command::run(cmd, format_command_display(program, args, Some(netns)))?;
        Ok(output)
    }
}
