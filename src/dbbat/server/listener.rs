use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error};

use crate::dbbat::common::{Error, Result};
use crate::dbbat::config::LISTEN_BACKLOG;

pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    pub fn new(address: String, reuseport: bool) -> Result<Self> {
        let addr: SocketAddr = address.parse()?;
        let sock = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        {
            if reuseport {
                sock.set_reuseport(true)?;
            }
            // The client always sends the first data after connecting,
            // so don't wake us up before it arrives.
            #[cfg(target_os = "linux")]
            unsafe {
                let optval: libc::c_int = 1;
                let ret = libc::setsockopt(
                    sock.as_raw_fd(),
                    libc::IPPROTO_TCP,
                    libc::TCP_DEFER_ACCEPT,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&optval) as libc::socklen_t,
                );
                if ret != 0 {
                    return Err(Error::from(io::Error::last_os_error()));
                }
            }
        }
        #[cfg(not(unix))]
        let _ = reuseport;
        sock.bind(addr)?;
        let listener = sock.listen(LISTEN_BACKLOG)?;
        Ok(Self { address, listener })
    }

    /// Accept the next connection, retrying on the recoverable accept errors.
    /// None means the listener is gone and the accept loop should stop.
    pub async fn accept(&self) -> Option<(TcpStream, SocketAddr)> {
        loop {
            match self.listener.accept().await {
                Ok((sock, remote_addr)) => {
                    debug!(%remote_addr, server = %self.address.as_str(), "accept connection");
                    return Some((sock, remote_addr));
                }
                Err(e) => {
                    #[cfg(target_os = "linux")]
                    match e.raw_os_error().unwrap_or(0) {
                        libc::ECONNABORTED
                        | libc::EMFILE // process file-descriptor limit
                        | libc::ENFILE // system wide file-descriptor limit
                        | libc::ENOBUFS
                        | libc::ENOMEM
                        | libc::EPROTO
                        | libc::EINTR => {
                            error!(error = %e, "accept error");
                            continue;
                        }
                        // socket closed, expected during shutdown
                        libc::EBADF => return None,
                        _ => {
                            error!(error = %e, server = %self.address.as_str(), "unrecoverable accept error");
                            return None;
                        }
                    }
                    #[cfg(not(target_os = "linux"))]
                    {
                        error!(error = %e, "accept error");
                        continue;
                    }
                }
            }
        }
    }
}
