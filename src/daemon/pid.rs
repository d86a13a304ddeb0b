use global_placeholders::global;
use std::fs;

pub fn write(pid: u32) {
    if let Err(err) = fs::write(global!("portman.pid"), pid.to_string()) {
        crate::log!("[daemon] failed to write pid file", "error" => err);
    }
}

pub fn read() -> Result<i32, String> {
    let contents = fs::read_to_string(global!("portman.pid"))
        .map_err(|err| format!("cannot read pid file: {err}"))?;
    contents
        .trim()
        .parse::<i32>()
        .map_err(|err| format!("pid file does not hold a pid: {err}"))
}

pub fn exists() -> bool {
    std::path::Path::new(&global!("portman.pid")).exists()
}

pub fn remove() {
    let _ = fs::remove_file(global!("portman.pid"));
}

/// Signal 0 probe. EPERM still counts as running.
pub fn running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    let result = unsafe { libc::kill(pid, 0) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        return err.raw_os_error() == Some(libc::EPERM);
    }
    true
}
