//! System-wide constants and default paths.

/// Default directory under which per-container run directories are created.
pub const DEFAULT_RUN_DIR: &str = "/run/containers";

/// Cgroup v1 mount root; each controller is a directory below it.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Loop device control node.
pub const LOOP_CONTROL_PATH: &str = "/dev/loop-control";

/// Prefix of loop device nodes (`/dev/loop<N>`).
pub const LOOP_DEVICE_PREFIX: &str = "/dev/loop";

/// Directory holding device-mapper nodes.
pub const DEV_MAPPER_DIR: &str = "/dev/mapper";

/// Device-mapper control node.
pub const DEV_MAPPER_CONTROL: &str = "/dev/mapper/control";

/// Prefix of device-mapper targets created for verity mounts.
pub const DM_NAME_PREFIX: &str = "cellblock";

/// Placeholder in a verity table replaced by the backing device path.
pub const VERITY_DEVICE_PLACEHOLDER: &str = "@DEV@";

/// Name of the pivoted-into directory inside a run directory.
pub const ROOT_DIR_NAME: &str = "root";

/// Name of the pid file inside a run directory.
pub const PID_FILE_NAME: &str = "container.pid";

/// Maximum number of rlimits a container may carry.
pub const MAX_RLIMITS: usize = 32;

/// Application name used in CLI output.
pub const APP_NAME: &str = "cellblock";
