//! Minimal double-fork daemonization.

use std::ffi::CString;

pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

fn fork() -> Result<Fork, i32> {
    match unsafe { libc::fork() } {
        -1 => Err(-1),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

fn setsid() -> Result<libc::pid_t, i32> {
    match unsafe { libc::setsid() } {
        -1 => Err(-1),
        sid => Ok(sid),
    }
}

/// Detach from the controlling terminal. The caller's process returns
/// `Fork::Parent`; the detached grandchild returns `Fork::Child`.
///
/// `nochdir` keeps the working directory, `noclose` keeps stdio open so
/// startup errors stay visible.
pub fn daemon(nochdir: bool, noclose: bool) -> Result<Fork, i32> {
    match fork()? {
        Fork::Parent(pid) => Ok(Fork::Parent(pid)),
        Fork::Child => {
            setsid()?;

            if !nochdir {
                let root = CString::new("/").expect("static path");
                unsafe { libc::chdir(root.as_ptr()) };
            }

            if !noclose {
                let devnull = CString::new("/dev/null").expect("static path");
                unsafe {
                    let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
                    if fd != -1 {
                        libc::dup2(fd, libc::STDIN_FILENO);
                        libc::dup2(fd, libc::STDOUT_FILENO);
                        libc::dup2(fd, libc::STDERR_FILENO);
                        if fd > libc::STDERR_FILENO {
                            libc::close(fd);
                        }
                    }
                }
            }

            // Second fork: the session leader exits so the daemon can never
            // reacquire a controlling terminal
            match fork()? {
                Fork::Parent(_) => unsafe { libc::_exit(0) },
                Fork::Child => Ok(Fork::Child),
            }
        }
    }
}
