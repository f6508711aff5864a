//! TCP connector: resolve a host/service pair and walk the candidate
//! addresses until one accepts a connection.

use std::ffi::{CStr, CString};
use std::mem;
use std::net::TcpStream;
use std::os::fd::FromRawFd;
use std::ptr;

/// Address family hint passed to the resolver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddrFamily {
    #[default]
    Unspec,
    V4,
    V6,
}

impl AddrFamily {
    fn as_raw(self) -> libc::c_int {
        match self {
            AddrFamily::Unspec => libc::AF_UNSPEC,
            AddrFamily::V4 => libc::AF_INET,
            AddrFamily::V6 => libc::AF_INET6,
        }
    }
}

/// Socket options applied while connecting. The benchmark harness runs with
/// everything off; the flags exist for other callers of [`connect_tcp`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOpts {
    pub nonblocking: bool,
    pub cloexec: bool,
    /// Allow the first payload bytes to ride on the handshake
    /// (`TCP_FASTOPEN`). A candidate where the option cannot be applied is
    /// skipped, never downgraded to a plain connect.
    pub fast_open: bool,
}

/// Resolve `host`/`service` and connect to the first usable candidate.
/// `service` may be a numeric port or a service name like `http`.
///
/// Returns a connected blocking stream; no local bind is performed. The
/// diagnostic on failure carries the last concrete OS error encountered.
pub fn connect_tcp(
    family: AddrFamily,
    host: &str,
    service: &str,
    opts: &ConnectOpts,
) -> Result<TcpStream, String> {
    let node = CString::new(host).map_err(|_| format!("invalid host '{host}'"))?;
    let serv = CString::new(service).map_err(|_| format!("invalid service '{service}'"))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = family.as_raw();
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let err = unsafe { libc::getaddrinfo(node.as_ptr(), serv.as_ptr(), &hints, &mut res) };
    if err != 0 {
        return Err(format!("getaddrinfo: {}", gai_error(err)));
    }
    if res.is_null() {
        return Err("no results for getaddrinfo".to_string());
    }

    let mut last_err = String::new();
    let mut ai = res;
    while !ai.is_null() {
        let cand = unsafe { &*ai };
        ai = cand.ai_next;
        match connect_candidate(cand, opts) {
            Ok(fd) => {
                unsafe { libc::freeaddrinfo(res) };
                return Ok(unsafe { TcpStream::from_raw_fd(fd) });
            }
            Err(e) => last_err = e,
        }
    }
    unsafe { libc::freeaddrinfo(res) };
    Err(format!("no usable address: {last_err}"))
}

fn connect_candidate(cand: &libc::addrinfo, opts: &ConnectOpts) -> Result<libc::c_int, String> {
    #[cfg(target_os = "linux")]
    let ty = cand.ai_socktype
        | if opts.nonblocking { libc::SOCK_NONBLOCK } else { 0 }
        | if opts.cloexec { libc::SOCK_CLOEXEC } else { 0 };
    #[cfg(not(target_os = "linux"))]
    let ty = cand.ai_socktype;

    let fd = unsafe { libc::socket(cand.ai_family, ty, 0) };
    if fd < 0 {
        return Err(format!("socket: {}", std::io::Error::last_os_error()));
    }
    #[cfg(not(target_os = "linux"))]
    if let Err(e) = apply_fd_flags(fd, opts) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    // Must be applied before connect
    if opts.fast_open {
        let qlen: libc::c_int = 5;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_FASTOPEN,
                &qlen as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(format!("setsockopt(TCP_FASTOPEN): {e}"));
        }
    }
    if unsafe { libc::connect(fd, cand.ai_addr, cand.ai_addrlen) } != 0 {
        let e = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(format!("connect: {e}"));
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn apply_fd_flags(fd: libc::c_int, opts: &ConnectOpts) -> Result<(), String> {
    if opts.nonblocking {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(format!(
                "fcntl(O_NONBLOCK): {}",
                std::io::Error::last_os_error()
            ));
        }
    }
    if opts.cloexec && unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(format!(
            "fcntl(FD_CLOEXEC): {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn gai_error(code: libc::c_int) -> String {
    unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let stream =
            connect_tcp(AddrFamily::V4, "127.0.0.1", &port, &ConnectOpts::default()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        assert_eq!(stream.peer_addr().unwrap(), peer.local_addr().unwrap());
    }

    #[test]
    fn refused_connection_reports_last_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let err =
            connect_tcp(AddrFamily::V4, "127.0.0.1", &port, &ConnectOpts::default()).unwrap_err();
        assert!(err.starts_with("no usable address:"), "{err}");
    }

    #[test]
    fn unresolvable_host_fails_in_resolver() {
        let err = connect_tcp(
            AddrFamily::Unspec,
            "nonexistent.invalid",
            "80",
            &ConnectOpts::default(),
        )
        .unwrap_err();
        assert!(err.starts_with("getaddrinfo:"), "{err}");
    }
}
