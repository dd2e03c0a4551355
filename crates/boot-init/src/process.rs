use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Child processes and the final process-image replacement.
pub trait ProcessControl {
    /// Runs `program` without arguments, inheriting stdio, and waits for it.
    fn run(&self, program: &Path) -> io::Result<ExitStatus>;

    /// Replaces the current process image with `program`. Only returns on
    /// failure.
    fn exec(&self, program: &Path) -> io::Error;

    /// Parks the process forever.
    fn suspend(&self);
}

#[derive(Debug, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn run(&self, program: &Path) -> io::Result<ExitStatus> {
        Command::new(program).status()
    }

    fn exec(&self, program: &Path) -> io::Error {
        Command::new(program).exec()
    }

    fn suspend(&self) {
        loop {
            nix::unistd::pause();
        }
    }
}
