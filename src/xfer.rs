//! Byte movement: zero-copy file-to-socket transfer and full-buffer
//! socket reads.

use std::fs::File;
use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;

/// Stream `len` bytes from `file` into `sock` without staging them in user
/// space. Linux uses `sendfile(2)`; other platforms fall back to a buffered
/// copy. Partial transfers advance the remaining count until the whole
/// payload is on the wire.
pub fn send_file(sock: &TcpStream, file: &File, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let out_fd = sock.as_raw_fd();
        let in_fd = file.as_raw_fd();
        let mut remaining = len;
        while remaining > 0 {
            // cap single calls; very large counts can EINVAL on some kernels
            let chunk = remaining.min(1 << 30) as usize;
            let sent = unsafe { libc::sendfile(out_fd, in_fd, std::ptr::null_mut(), chunk) };
            if sent < 0 {
                return Err(io::Error::last_os_error());
            }
            if sent == 0 {
                return Err(truncated_input());
            }
            remaining -= sent as u64;
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::io::{Read, Write};
        let mut reader = file;
        let mut writer = sock;
        let mut buf = [0u8; 64 * 1024];
        let mut remaining = len;
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                return Err(truncated_input());
            }
            writer.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

fn truncated_input() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "input file ended before the full payload was sent",
    )
}

/// Full-buffer blocking read (`MSG_WAITALL`): blocks until `buf` is filled,
/// the peer performs an orderly shutdown, or an error occurs. Returns the
/// number of bytes received; `0` means end-of-stream.
pub fn recv_full(sock: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::recv(
            sock.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_WAITALL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::thread;

    fn tmp_file(name: &str, data: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "sendfleet-xfer-{}-{name}",
            std::process::id()
        ));
        std::fs::write(&path, data).unwrap();
        path
    }

    fn local_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn send_file_moves_the_whole_payload() {
        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let path = tmp_file("whole", &payload);
        let file = File::open(&path).unwrap();

        let (client, mut server) = local_pair();
        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            server.read_to_end(&mut got).unwrap();
            got
        });

        send_file(&client, &file, payload.len() as u64).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        assert_eq!(reader.join().unwrap(), payload);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn send_file_detects_truncated_input() {
        let path = tmp_file("short", b"only ten b");
        let file = File::open(&path).unwrap();

        let (client, mut server) = local_pair();
        let drain = thread::spawn(move || {
            let mut got = Vec::new();
            server.read_to_end(&mut got).ok();
        });

        let err = send_file(&client, &file, 1000).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        drop(client);
        drain.join().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn recv_full_returns_partial_chunk_then_eof() {
        let (client, mut server) = local_pair();
        server.write_all(b"0123456789").unwrap();
        server.shutdown(Shutdown::Write).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(recv_full(&client, &mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"0123456789");
        assert_eq!(recv_full(&client, &mut buf).unwrap(), 0);
    }
}
