use std::path::PathBuf;

use directories::BaseDirs;
use tracing::warn;

/// Default base directory for a driver instance. Holds the control file,
/// the counter values file and the per-stream log buffers.
pub fn driver_dir<S: AsRef<str>>(instance: S) -> PathBuf {
    if let Ok(dir) = std::env::var("AQUEDUCT_DIR") {
        return PathBuf::from(dir);
    }
    let Some(base_dirs) = BaseDirs::new() else {
        warn!("couldn't find basedirs, storing driver files in /dev/shm/<instance>");
        return PathBuf::from(format!("/dev/shm/{}", instance.as_ref()));
    };
    base_dirs.data_dir().join(instance.as_ref())
}
