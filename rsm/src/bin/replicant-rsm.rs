//! The object child.  The daemon spawns one of these per object with the library path as the only
//! argument and `FD=<n>` in the environment naming the socket.  The socket moves to descriptor
//! zero, every other descriptor closes, and the process serves actions until SHUTDOWN.

use std::fs::OpenOptions;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        std::process::exit(1);
    }
    let Ok(fd_str) = std::env::var("FD") else {
        std::process::exit(1);
    };
    let Ok(fd) = fd_str.parse::<libc::c_int>() else {
        std::process::exit(1);
    };
    if fd < 0 {
        std::process::exit(1);
    }
    let debug_path = std::env::var("RSM_DEBUG").ok();
    unsafe {
        if libc::dup2(fd, 0) < 0 {
            std::process::exit(1);
        }
    }
    let max_open_files = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    for fd in 1..max_open_files {
        unsafe {
            libc::close(fd as libc::c_int);
        }
    }
    let debug = debug_path.and_then(|path| {
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    let sock = unsafe { UnixStream::from_raw_fd(0) };
    match rsm::child::run(&args[1], sock, debug) {
        Ok(()) => {}
        Err(_) => {
            // already reported to the debug stream; mirror the daemon's abort-kill contract
            std::process::abort();
        }
    }
}
