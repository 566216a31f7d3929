//! Container lifecycle against fake host backends.
//!
//! The run directory, cgroup tree, and pid file are real temporary files;
//! mounts, device nodes, and the sandboxed child are recorded by fakes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cellblock_common::error::{CellblockError, Result};
use cellblock_common::types::{ContainerState, DeviceType};
use cellblock_core::cgroup::{Cgroup, CgroupDeviceRule, CgroupFactory};
use cellblock_runtime::config::{Config, DeviceSpec, MountSpec};
use cellblock_runtime::container::Container;
use cellblock_runtime::jail::ExitState;
use common::{Call, FAKE_PID, FakeSandbox, Harness, RecordingSyscall};
use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sys::signal::Signal;

fn base_config(harness: &Harness) -> Config {
    let mut config = Config::new();
    config.set_rootfs(harness.rootfs.path()).unwrap();
    config.set_program(["/bin/sh", "-c", "true"]).unwrap();
    config
}

fn bind(dest: &str) -> MountSpec {
    MountSpec {
        name: dest.trim_start_matches('/').into(),
        source: PathBuf::from("/srv").join(dest.trim_start_matches('/')),
        destination: dest.into(),
        flags: MsFlags::MS_BIND,
        ..MountSpec::default()
    }
}

fn char_device(path: &str, major: u32, minor: Option<u32>, copy: bool) -> DeviceSpec {
    DeviceSpec {
        device_type: DeviceType::Char,
        path: path.into(),
        mode: 0o666,
        major,
        minor,
        copy_minor_from_host: copy,
        uid: 0,
        gid: 0,
        read: true,
        write: true,
        modify: false,
    }
}

fn read_trimmed(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap().trim().to_string()
}

/// What the host looked like when the cgroup was released.
#[derive(Debug, Clone)]
struct ReleaseSnapshot {
    unmounted: Vec<PathBuf>,
    run_entries: Vec<String>,
}

/// Cgroup factory whose cgroups record the host state on drop.
#[derive(Debug)]
struct WitnessFactory {
    sys: Arc<RecordingSyscall>,
    run_dir: PathBuf,
    seen: Arc<Mutex<Option<ReleaseSnapshot>>>,
}

impl CgroupFactory for WitnessFactory {
    fn create(
        &self,
        name: &str,
        _root: &Path,
        _parent: Option<&Path>,
        _owner_uid: u32,
        _owner_gid: u32,
    ) -> Result<Box<dyn Cgroup>> {
        Ok(Box::new(WitnessCgroup {
            name: name.to_string(),
            sys: Arc::clone(&self.sys),
            run_dir: self.run_dir.clone(),
            seen: Arc::clone(&self.seen),
        }))
    }
}

#[derive(Debug)]
struct WitnessCgroup {
    name: String,
    sys: Arc<RecordingSyscall>,
    run_dir: PathBuf,
    seen: Arc<Mutex<Option<ReleaseSnapshot>>>,
}

impl Cgroup for WitnessCgroup {
    fn name(&self) -> &str {
        &self.name
    }
    fn freeze(&self) -> Result<()> {
        Ok(())
    }
    fn thaw(&self) -> Result<()> {
        Ok(())
    }
    fn deny_all_devices(&self) -> Result<()> {
        Ok(())
    }
    fn add_device(&self, _rule: &CgroupDeviceRule) -> Result<()> {
        Ok(())
    }
    fn set_cpu_shares(&self, _shares: u64) -> Result<()> {
        Ok(())
    }
    fn set_cpu_quota(&self, _quota_us: i64) -> Result<()> {
        Ok(())
    }
    fn set_cpu_period(&self, _period_us: u64) -> Result<()> {
        Ok(())
    }
    fn set_cpu_rt_runtime(&self, _runtime_us: u64) -> Result<()> {
        Ok(())
    }
    fn set_cpu_rt_period(&self, _period_us: u64) -> Result<()> {
        Ok(())
    }
    fn tasks_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

impl Drop for WitnessCgroup {
    fn drop(&mut self) {
        let run_entries = std::fs::read_dir(&self.run_dir)
            .unwrap()
            .flat_map(|run| std::fs::read_dir(run.unwrap().path()).unwrap())
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        *self.seen.lock().unwrap() = Some(ReleaseSnapshot {
            unmounted: self.sys.unmounted_targets(),
            run_entries,
        });
    }
}

// ── Start and wait ───────────────────────────────────────────────────

#[test]
fn full_lifecycle_builds_and_removes_everything() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::privileged());
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config
        .add_mount(MountSpec {
            name: "tmp".into(),
            source: "tmpfs".into(),
            destination: "/tmp".into(),
            fstype: "tmpfs".into(),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            ..MountSpec::default()
        })
        .unwrap();
    config
        .add_device(char_device("/dev/foo", 245, Some(2), false))
        .unwrap();
    config.set_cpu_shares(200).unwrap();

    let mut container =
        Container::with_backends("c1", harness.run_dir.path(), harness.backends(Arc::clone(&sys), sandbox))
            .unwrap();
    container.start(&config).unwrap();

    assert_eq!(container.state(), ContainerState::Running);
    assert_eq!(container.pid().unwrap().as_raw(), FAKE_PID);

    let run_path = container.run_path().unwrap().to_path_buf();
    let root = container.root_path().unwrap().to_path_buf();
    assert_eq!(root, run_path.join("root"));
    assert!(run_path.starts_with(harness.run_dir.path()));
    assert!(
        run_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("c1_")
    );

    assert_eq!(
        sys.mounted_targets(),
        [root.clone(), root.join("tmp")],
        "rootfs bind first, then the tmpfs"
    );
    assert!(sys.calls().contains(&Call::Mount {
        target: root.join("tmp"),
        fstype: Some("tmpfs".into()),
        flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
    }));
    assert!(sys.calls().contains(&Call::Mknod {
        path: root.join("dev/foo"),
        kind: DeviceType::Char,
        major: 245,
        minor: 2,
    }));

    let devices = harness.cgroup_dir("devices", "c1");
    assert_eq!(read_trimmed(&devices.join("devices.deny")), "a");
    assert_eq!(read_trimmed(&devices.join("devices.allow")), "c 245:2 rw");
    assert_eq!(read_trimmed(&harness.cgroup_dir("cpu", "c1").join("cpu.shares")), "200");

    let pid_file = container.pid_file().unwrap().to_path_buf();
    assert_eq!(pid_file, run_path.join("container.pid"));
    assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), format!("{FAKE_PID}\n"));

    {
        let log = log.lock().unwrap();
        let plan = &log.plans[0];
        assert_eq!(plan.root, root);
        assert_eq!(plan.program, ["/bin/sh", "-c", "true"]);
        assert!(plan.mounts.is_empty());
        assert!(!plan.deny_setgroups);
        assert!(plan.cgroup_tasks.contains(&harness.cgroup_dir("cpu", "c1").join("tasks")));
    }

    assert_eq!(container.wait().unwrap(), ExitState::Exited(0));
    assert_eq!(container.state(), ContainerState::Stopped);
    assert_eq!(sys.unmounted_targets(), [root.join("tmp"), root.clone()]);
    assert!(!root.exists());
    assert!(!pid_file.exists());
    assert!(!run_path.exists());
    assert_eq!(harness.run_dir_entries(), 0);
}

#[test]
fn teardown_releases_in_reverse_order_of_setup() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));
    let seen = Arc::new(Mutex::new(None));
    let mut backends = harness.backends(Arc::clone(&sys), sandbox);
    backends.cgroups = Arc::new(WitnessFactory {
        sys: Arc::clone(&sys),
        run_dir: harness.run_dir.path().to_path_buf(),
        seen: Arc::clone(&seen),
    });

    let mut config = base_config(&harness);
    config.add_mount(bind("/data")).unwrap();
    let mut container = Container::with_backends("order", harness.run_dir.path(), backends).unwrap();
    container.start(&config).unwrap();
    let root = container.root_path().unwrap().to_path_buf();
    assert!(seen.lock().unwrap().is_none());

    let _exit = container.wait().unwrap();
    let snapshot = seen.lock().unwrap().clone().expect("cgroup released");
    assert_eq!(
        snapshot.unmounted,
        [root.join("data")],
        "mounts go before the cgroup, the root bind after it"
    );
    assert_eq!(snapshot.run_entries, ["root"], "pid file already gone, root still there");
    assert_eq!(sys.unmounted_targets(), [root.join("data"), root]);
    assert_eq!(harness.run_dir_entries(), 0);
}

#[test]
fn waiting_again_returns_the_recorded_exit() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Exited(3));
    let mut container =
        Container::with_backends("again", harness.run_dir.path(), harness.backends(sys, sandbox))
            .unwrap();
    container.start(&base_config(&harness)).unwrap();

    assert_eq!(container.wait().unwrap().code(), 3);
    assert_eq!(container.wait().unwrap(), ExitState::Exited(3));
    assert_eq!(container.exit_state(), Some(ExitState::Exited(3)));
    assert_eq!(log.lock().unwrap().waits, 1);
}

#[test]
fn custom_pid_file_is_written_and_removed() {
    let harness = Harness::new();
    let pid_dir = tempfile::tempdir().unwrap();
    let pid_path = pid_dir.path().join("android.pid");
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config.set_pid_file(&pid_path);
    let mut container =
        Container::with_backends("pidfile", harness.run_dir.path(), harness.backends(sys, sandbox))
            .unwrap();
    container.start(&config).unwrap();

    assert_eq!(container.pid_file(), Some(pid_path.as_path()));
    assert_eq!(std::fs::read_to_string(&pid_path).unwrap(), "4242\n");
    let _exit = container.wait().unwrap();
    assert!(!pid_path.exists());
}

#[test]
fn premounted_runfs_is_used_as_is() {
    let harness = Harness::new();
    let runfs = tempfile::tempdir().unwrap();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = Config::new();
    config.set_program(["/init"]).unwrap();
    config.set_premounted_runfs(runfs.path());
    let mut container = Container::with_backends(
        "premounted",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&config).unwrap();

    assert_eq!(container.root_path(), Some(runfs.path()));
    assert!(container.run_path().is_none());
    assert!(container.pid_file().is_none());
    assert_eq!(harness.run_dir_entries(), 0);

    let _exit = container.wait().unwrap();
    assert!(sys.calls().is_empty());
    assert!(runfs.path().exists());
}

#[test]
fn unprivileged_launch_skips_devices_and_denies_setgroups() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config
        .add_device(char_device("/dev/foo", 245, Some(2), false))
        .unwrap();
    let mut container = Container::with_backends(
        "unpriv",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&config).unwrap();

    assert!(
        !sys.calls()
            .iter()
            .any(|c| matches!(c, Call::Mknod { .. }))
    );
    assert!(!harness.cgroup_dir("devices", "unpriv").join("devices.allow").exists());
    assert!(log.lock().unwrap().plans[0].deny_setgroups);
    let _exit = container.wait().unwrap();
}

// ── Mounts ───────────────────────────────────────────────────────────

#[test]
fn external_mounts_are_unmounted_in_reverse() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    for dest in ["/a", "/b", "/c"] {
        config.add_mount(bind(dest)).unwrap();
    }
    let mut container = Container::with_backends(
        "order",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&config).unwrap();
    let root = container.root_path().unwrap().to_path_buf();
    assert_eq!(container.ledger().mounts().len(), 3);

    let _exit = container.wait().unwrap();
    assert_eq!(
        sys.unmounted_targets(),
        [root.join("c"), root.join("b"), root.join("a"), root]
    );
    assert!(container.ledger().is_empty());
}

#[test]
fn namespace_mounts_go_to_the_sandbox() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config
        .add_mount(MountSpec {
            name: "proc".into(),
            source: "proc".into(),
            destination: "/proc".into(),
            fstype: "proc".into(),
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            mount_in_ns: true,
            ..MountSpec::default()
        })
        .unwrap();
    let mut container = Container::with_backends(
        "nsmount",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&config).unwrap();

    let root = container.root_path().unwrap().to_path_buf();
    assert_eq!(sys.mounted_targets(), [root]);
    {
        let log = log.lock().unwrap();
        let mounts = &log.plans[0].mounts;
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].destination, Path::new("/proc"));
        assert_eq!(mounts[0].fstype.as_deref(), Some("proc"));
    }
    let _exit = container.wait().unwrap();
}

#[test]
fn loopback_mount_detaches_after_unmount() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config
        .add_mount(MountSpec {
            name: "vendor".into(),
            source: "/images/vendor.img".into(),
            destination: "/vendor".into(),
            fstype: "ext4".into(),
            flags: MsFlags::MS_RDONLY,
            loopback: true,
            ..MountSpec::default()
        })
        .unwrap();
    let mut container = Container::with_backends(
        "loop",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&config).unwrap();
    assert_eq!(container.ledger().loop_devices(), [PathBuf::from("/dev/loop7")]);

    let root = container.root_path().unwrap().to_path_buf();
    let _exit = container.wait().unwrap();

    let calls = sys.calls();
    let unmount_vendor = calls
        .iter()
        .position(|c| *c == Call::Umount(root.join("vendor")))
        .unwrap();
    let detach = calls
        .iter()
        .position(|c| *c == Call::DetachLoop("/dev/loop7".into()))
        .unwrap();
    assert!(unmount_vendor < detach);
}

// ── Devices ──────────────────────────────────────────────────────────

#[test]
fn devices_missing_on_the_host_are_skipped() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::privileged());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config
        .add_device(char_device("/dev/cellblock-absent", 10, None, true))
        .unwrap();
    config.add_device(char_device("/dev/null", 1, None, true)).unwrap();
    let mut container = Container::with_backends(
        "skip",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&config).unwrap();
    let root = container.root_path().unwrap().to_path_buf();

    let nodes: Vec<_> = sys
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Mknod { path, minor, .. } => Some((path, minor)),
            _ => None,
        })
        .collect();
    assert_eq!(nodes, [(root.join("dev/null"), 3)]);
    let _exit = container.wait().unwrap();
}

#[test]
fn missing_devices_controller_does_not_block_start() {
    let harness = Harness::with_controllers(&["cpu"]);
    let sys = Arc::new(RecordingSyscall::privileged());
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config
        .add_device(char_device("/dev/foo", 245, Some(2), false))
        .unwrap();
    config.set_cpu_shares(300).unwrap();
    let mut container = Container::with_backends(
        "cpuonly",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&config).unwrap();
    let root = container.root_path().unwrap().to_path_buf();

    assert_eq!(container.state(), ContainerState::Running);
    assert!(sys.calls().contains(&Call::Mknod {
        path: root.join("dev/foo"),
        kind: DeviceType::Char,
        major: 245,
        minor: 2,
    }));
    assert!(!harness.cgroup_dir("devices", "cpuonly").exists());
    assert_eq!(
        read_trimmed(&harness.cgroup_dir("cpu", "cpuonly").join("cpu.shares")),
        "300"
    );
    assert_eq!(
        log.lock().unwrap().plans[0].cgroup_tasks,
        [harness.cgroup_dir("cpu", "cpuonly").join("tasks")]
    );

    std::fs::remove_file(harness.cgroup_dir("cpu", "cpuonly").join("cpu.shares")).unwrap();
    let _exit = container.wait().unwrap();
    assert!(!harness.cgroup_dir("cpu", "cpuonly").exists());
}

// ── Kill and state errors ────────────────────────────────────────────

#[test]
fn kill_of_an_already_reaped_program_still_tears_down() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, log) = FakeSandbox::exiting(ExitState::AlreadyReaped);
    let mut container = Container::with_backends(
        "reaped",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    container.start(&base_config(&harness)).unwrap();
    let run_path = container.run_path().unwrap().to_path_buf();

    assert_eq!(container.kill().unwrap(), ExitState::AlreadyReaped);
    assert_eq!(log.lock().unwrap().signals, [Signal::SIGKILL]);
    assert_eq!(container.state(), ContainerState::Stopped);
    assert!(!run_path.exists());
}

#[test]
fn starting_twice_is_rejected() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));
    let config = base_config(&harness);
    let mut container =
        Container::with_backends("twice", harness.run_dir.path(), harness.backends(sys, sandbox))
            .unwrap();
    container.start(&config).unwrap();

    assert!(matches!(
        container.start(&config),
        Err(CellblockError::InvalidState { op: "start", state: ContainerState::Running, .. })
    ));
    assert_eq!(container.state(), ContainerState::Running);
    let _exit = container.wait().unwrap();
}

#[test]
fn freeze_requires_a_running_container() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));
    let container =
        Container::with_backends("frozen", harness.run_dir.path(), harness.backends(sys, sandbox))
            .unwrap();
    assert!(matches!(
        container.freeze(),
        Err(CellblockError::InvalidState { op: "freeze", .. })
    ));
}

#[test]
fn dropping_a_running_container_kills_and_cleans_up() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Signaled(Signal::SIGKILL));
    let mut container =
        Container::with_backends("dropped", harness.run_dir.path(), harness.backends(sys, sandbox))
            .unwrap();
    container.start(&base_config(&harness)).unwrap();
    drop(container);

    assert_eq!(log.lock().unwrap().signals, [Signal::SIGKILL]);
    assert_eq!(harness.run_dir_entries(), 0);
}

// ── Failed starts ────────────────────────────────────────────────────

#[test]
fn failed_mount_unwinds_and_marks_failed() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall {
        fail_mount_on: Some(PathBuf::from("b")),
        ..RecordingSyscall::default()
    });
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config.add_mount(bind("/a")).unwrap();
    config.add_mount(bind("/b")).unwrap();
    let mut container = Container::with_backends(
        "unwind",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();

    let err = container.start(&config).unwrap_err();
    assert_eq!(err.errno(), Some(Errno::EINVAL));
    assert_eq!(container.state(), ContainerState::Failed);

    let root = container.root_path().unwrap().to_path_buf();
    assert_eq!(sys.unmounted_targets(), [root.join("a"), root]);
    assert!(log.lock().unwrap().plans.is_empty());
    assert_eq!(harness.run_dir_entries(), 0);
    assert!(!harness.cgroup_dir("cpu", "unwind").exists());

    assert!(matches!(
        container.wait(),
        Err(CellblockError::InvalidState { op: "wait", .. })
    ));
}

#[test]
fn failed_remount_of_a_bind_leaves_nothing_mounted() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall {
        fail_remount: true,
        ..RecordingSyscall::default()
    });
    let (sandbox, log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    let mut readonly = bind("/ro");
    readonly.flags |= MsFlags::MS_RDONLY;
    config.add_mount(readonly).unwrap();
    let mut container = Container::with_backends(
        "remount",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();

    let err = container.start(&config).unwrap_err();
    assert_eq!(err.errno(), Some(Errno::EPERM));
    let root = container.root_path().unwrap().to_path_buf();
    assert_eq!(sys.mounted_targets(), [root.clone(), root.join("ro")]);
    assert_eq!(sys.unmounted_targets(), [root.join("ro"), root]);
    assert!(log.lock().unwrap().plans.is_empty());
    assert_eq!(harness.run_dir_entries(), 0);
}

#[test]
fn failed_rootfs_remount_unmounts_the_root_once() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall {
        fail_remount: true,
        ..RecordingSyscall::default()
    });
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));

    let mut config = base_config(&harness);
    config.set_rootfs_mount_flags(MsFlags::MS_RDONLY);
    let mut container = Container::with_backends(
        "roroot",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();

    assert!(container.start(&config).is_err());
    assert_eq!(container.state(), ContainerState::Failed);
    let root = container.root_path().unwrap().to_path_buf();
    assert_eq!(sys.unmounted_targets(), [root]);
    assert_eq!(harness.run_dir_entries(), 0);
}

#[test]
fn failed_clone_releases_the_run_directory() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (mut sandbox, log) = FakeSandbox::exiting(ExitState::Exited(0));
    sandbox.fail_run = Some(Errno::EPERM);

    let mut container = Container::with_backends(
        "noclone",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    let err = container.start(&base_config(&harness)).unwrap_err();

    assert_eq!(err.errno(), Some(Errno::EPERM));
    assert_eq!(container.state(), ContainerState::Failed);
    assert!(container.pid().is_none());
    assert!(log.lock().unwrap().signals.is_empty());
    assert_eq!(harness.run_dir_entries(), 0);
}

#[test]
fn invalid_config_fails_before_touching_the_host() {
    let harness = Harness::new();
    let sys = Arc::new(RecordingSyscall::default());
    let (sandbox, _log) = FakeSandbox::exiting(ExitState::Exited(0));

    let config = Config::new();
    let mut container = Container::with_backends(
        "empty",
        harness.run_dir.path(),
        harness.backends(Arc::clone(&sys), sandbox),
    )
    .unwrap();
    assert!(matches!(
        container.start(&config),
        Err(CellblockError::Config { .. })
    ));
    assert!(sys.calls().is_empty());
    assert_eq!(harness.run_dir_entries(), 0);
}
