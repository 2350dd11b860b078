//! I/O scheduling priority (`ioprio_set`).

use std::io;

use crate::platform::cvt;

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_IDLE: libc::c_int = 3;
const IOPRIO_CLASS_SHIFT: libc::c_int = 13;

/// Put the current process in the idle I/O priority class so scans and
/// dedup passes yield to everything else on the disk.
pub fn set_idle_priority() -> io::Result<()> {
    let prio = IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT;
    let ret = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, prio) };
    cvt(ret as libc::c_int)?;
    Ok(())
}
