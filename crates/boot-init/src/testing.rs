//! Recording fakes for the kernel, network, metadata and process boundaries.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::rc::Rc;

use boot_net::{NetworkConfig, NetworkError};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sys::stat::SFlag;
use tempfile::TempDir;

use crate::config::BootConfig;
use crate::context::{BootEnv, Namespace};
use crate::kernel::Kernel;
use crate::metadata::{MetadataError, MetadataQuery};
use crate::network::{NetworkEnvironment, NetworkFactory};
use crate::paths::BootPaths;
use crate::process::ProcessControl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCall {
    pub source: Option<String>,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: MsFlags,
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCall {
    Mount(MountCall),
    Umount { target: PathBuf, flags: MntFlags },
    Mknod {
        path: PathBuf,
        kind: SFlag,
        mode: u32,
        major: u32,
        minor: u32,
    },
    Chdir(PathBuf),
    Chroot(PathBuf),
    CloexecFrom(RawFd),
    SetEnv(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkCall {
    CreateNamespaces,
    Enter(Namespace),
    Common,
    PortForwarding,
    Mobile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Kernel(KernelCall),
    Network(NetworkCall),
    MetadataQuery,
    Run(PathBuf),
    Exec(PathBuf),
    Suspend,
}

/// Ordered record of every boundary call, shared by all fakes of a test.
#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.0.borrow().contains(event)
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.0.borrow().iter().position(|e| e == event)
    }

    pub fn position_where(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.0.borrow().iter().position(pred)
    }

    pub fn mounts(&self) -> Vec<MountCall> {
        self.0
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Kernel(KernelCall::Mount(m)) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn mount_at(&self, target: &Path) -> Option<MountCall> {
        self.mounts().into_iter().find(|m| m.target == target)
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.0.borrow().iter().filter(|e| pred(e)).count()
    }
}

/// Kernel fake. Mounts are recorded only; device nodes become empty files.
#[derive(Debug, Default)]
pub struct FakeKernel {
    journal: Journal,
    failing_mounts: RefCell<HashSet<PathBuf>>,
    failing_umounts: RefCell<HashSet<PathBuf>>,
    fail_mknod: Cell<bool>,
    fail_chdir: Cell<bool>,
    fail_chroot: Cell<bool>,
}

impl FakeKernel {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            ..Self::default()
        }
    }

    pub fn fail_mount_at(&self, target: impl Into<PathBuf>) {
        self.failing_mounts.borrow_mut().insert(target.into());
    }

    pub fn fail_umount_at(&self, target: impl Into<PathBuf>) {
        self.failing_umounts.borrow_mut().insert(target.into());
    }

    pub fn fail_mknod(&self) {
        self.fail_mknod.set(true);
    }

    pub fn fail_chdir(&self) {
        self.fail_chdir.set(true);
    }

    pub fn fail_chroot(&self) {
        self.fail_chroot.set(true);
    }
}

impl Kernel for FakeKernel {
    fn mount(
        &self,
        source: Option<&str>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        if self.failing_mounts.borrow().contains(target) {
            return Err(Errno::EINVAL);
        }
        self.journal.push(Event::Kernel(KernelCall::Mount(MountCall {
            source: source.map(String::from),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
            flags,
            data: data.map(String::from),
        })));
        Ok(())
    }

    fn umount(&self, target: &Path, flags: MntFlags) -> nix::Result<()> {
        if self.failing_umounts.borrow().contains(target) {
            return Err(Errno::EBUSY);
        }
        self.journal.push(Event::Kernel(KernelCall::Umount {
            target: target.to_path_buf(),
            flags,
        }));
        Ok(())
    }

    fn mknod(
        &self,
        path: &Path,
        kind: SFlag,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> nix::Result<()> {
        if self.fail_mknod.get() {
            return Err(Errno::EPERM);
        }
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|_| Errno::ENOENT)?;
        self.journal.push(Event::Kernel(KernelCall::Mknod {
            path: path.to_path_buf(),
            kind,
            mode,
            major,
            minor,
        }));
        Ok(())
    }

    fn chdir(&self, path: &Path) -> nix::Result<()> {
        if self.fail_chdir.get() {
            return Err(Errno::ENOENT);
        }
        self.journal
            .push(Event::Kernel(KernelCall::Chdir(path.to_path_buf())));
        Ok(())
    }

    fn chroot(&self, path: &Path) -> nix::Result<()> {
        if self.fail_chroot.get() {
            return Err(Errno::EPERM);
        }
        self.journal
            .push(Event::Kernel(KernelCall::Chroot(path.to_path_buf())));
        Ok(())
    }

    fn mark_cloexec_from(&self, first: RawFd) {
        self.journal
            .push(Event::Kernel(KernelCall::CloexecFrom(first)));
    }

    fn set_env(&self, key: &str, value: &str) {
        self.journal.push(Event::Kernel(KernelCall::SetEnv(
            key.to_string(),
            value.to_string(),
        )));
    }
}

fn injected(call: &NetworkCall) -> NetworkError {
    NetworkError::Io {
        context: format!("{call:?}"),
        source: io::Error::other("injected failure"),
    }
}

pub struct FakeNetwork {
    journal: Journal,
    failing: HashSet<NetworkCall>,
}

impl FakeNetwork {
    fn record(&self, call: NetworkCall) -> boot_net::Result<()> {
        let failed = self.failing.contains(&call);
        self.journal.push(Event::Network(call.clone()));
        if failed { Err(injected(&call)) } else { Ok(()) }
    }
}

impl NetworkEnvironment for FakeNetwork {
    fn build_namespaces(&mut self) -> boot_net::Result<()> {
        self.record(NetworkCall::CreateNamespaces)
    }

    fn enter_namespace(&mut self, namespace: Namespace) -> boot_net::Result<()> {
        self.record(NetworkCall::Enter(namespace))
    }

    fn bring_up_common(&mut self) -> boot_net::Result<()> {
        self.record(NetworkCall::Common)
    }

    fn forward_ports(&mut self) -> boot_net::Result<()> {
        self.record(NetworkCall::PortForwarding)
    }

    fn bring_up_mobile(&mut self) -> boot_net::Result<()> {
        self.record(NetworkCall::Mobile)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeNetworkFactory {
    journal: Journal,
    failing_capability: Option<&'static str>,
    failing: HashSet<NetworkCall>,
}

impl FakeNetworkFactory {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            ..Self::default()
        }
    }

    pub fn failing_capability(mut self, capability: &'static str) -> Self {
        self.failing_capability = Some(capability);
        self
    }

    pub fn failing_on(mut self, call: NetworkCall) -> Self {
        self.failing.insert(call);
        self
    }
}

impl NetworkFactory for FakeNetworkFactory {
    fn create(&self, _config: &NetworkConfig) -> boot_net::Result<Box<dyn NetworkEnvironment>> {
        if let Some(capability) = self.failing_capability {
            return Err(NetworkError::Capability {
                capability,
                detail: "injected failure".into(),
            });
        }
        Ok(Box::new(FakeNetwork {
            journal: self.journal.clone(),
            failing: self.failing.clone(),
        }))
    }
}

/// Metadata source that fails a fixed number of times, then serves `body`.
pub struct FakeQuery {
    journal: Journal,
    failures_left: usize,
    body: String,
}

impl FakeQuery {
    pub fn new(journal: &Journal, body: &str) -> Self {
        Self {
            journal: journal.clone(),
            failures_left: 0,
            body: body.to_string(),
        }
    }

    pub fn failing_first(mut self, attempts: usize) -> Self {
        self.failures_left = attempts;
        self
    }
}

impl MetadataQuery for FakeQuery {
    fn query(&mut self) -> Result<String, MetadataError> {
        self.journal.push(Event::MetadataQuery);
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(MetadataError::Request("not ready".into()));
        }
        Ok(self.body.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RunOutcome {
    Exit(i32),
    SpawnError,
}

#[derive(Debug, Default)]
pub struct FakeProcesses {
    journal: Journal,
    outcomes: RefCell<HashMap<PathBuf, RunOutcome>>,
}

impl FakeProcesses {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            ..Self::default()
        }
    }

    pub fn set_outcome(&self, program: impl Into<PathBuf>, outcome: RunOutcome) {
        self.outcomes.borrow_mut().insert(program.into(), outcome);
    }
}

impl ProcessControl for FakeProcesses {
    fn run(&self, program: &Path) -> io::Result<ExitStatus> {
        self.journal.push(Event::Run(program.to_path_buf()));
        match self.outcomes.borrow().get(program) {
            Some(RunOutcome::SpawnError) => Err(io::Error::from(io::ErrorKind::NotFound)),
            Some(RunOutcome::Exit(code)) => Ok(ExitStatus::from_raw(code << 8)),
            None => Ok(ExitStatus::from_raw(0)),
        }
    }

    fn exec(&self, program: &Path) -> io::Error {
        self.journal.push(Event::Exec(program.to_path_buf()));
        io::Error::other("exec intercepted")
    }

    fn suspend(&self) {
        self.journal.push(Event::Suspend);
    }
}

/// A boot layout rooted in a temporary directory.
pub struct Harness {
    _root: TempDir,
    pub paths: BootPaths,
    pub config: BootConfig,
    pub journal: Journal,
    pub kernel: FakeKernel,
    pub processes: FakeProcesses,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = BootPaths::new(dir.path());
        let mut config = BootConfig::default();
        config.metadata.poll_interval_ms = 1;
        let journal = Journal::default();
        let kernel = FakeKernel::new(&journal);
        let processes = FakeProcesses::new(&journal);
        Self {
            _root: dir,
            paths,
            config,
            journal,
            kernel,
            processes,
        }
    }

    pub fn env(&self) -> BootEnv<'_> {
        BootEnv {
            config: &self.config,
            paths: &self.paths,
            kernel: &self.kernel,
            processes: &self.processes,
        }
    }

    /// Writes a file at an absolute boot path, creating parents.
    pub fn write(&self, path: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let resolved = self.paths.resolve(path);
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&resolved, contents).unwrap();
        resolved
    }

    pub fn mkdir(&self, path: &str) -> PathBuf {
        let resolved = self.paths.resolve(path);
        std::fs::create_dir_all(&resolved).unwrap();
        resolved
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.paths.resolve(path)).unwrap()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.paths.resolve(path).exists()
    }
}
