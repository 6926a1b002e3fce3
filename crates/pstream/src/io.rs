//! The minimal event-loop adapter the core needs: non-blocking read/write
//! with readiness to wait on, and a credential-capable variant for UNIX
//! sockets. `TokioIoChannel` is the concrete adapter; `PStream` is generic
//! over `IoChannel` so tests can swap in a loopback pair.

use std::io;

use pulse_wire::Creds;
use tokio::net::{TcpStream, UnixStream};

/// Readiness-driven, non-blocking duplex byte channel.
pub trait IoChannel: Send + Sync {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Credential-capable send. Channels without ancillary-data support
    /// (e.g. TCP) silently degrade to a plain write.
    fn try_write_with_creds(&self, buf: &[u8], creds: Option<Creds>) -> io::Result<usize> {
        let _ = creds;
        self.try_write(buf)
    }

    /// Credential-capable receive. Channels without ancillary-data support
    /// always report `None`.
    fn try_read_with_creds(&self, buf: &mut [u8]) -> io::Result<(usize, Option<Creds>)> {
        self.try_read(buf).map(|n| (n, None))
    }

    fn readable(&self) -> impl std::future::Future<Output = io::Result<()>> + Send;
    fn writable(&self) -> impl std::future::Future<Output = io::Result<()>> + Send;
}

/// Wraps a connected `UnixStream` or `TcpStream`.
pub enum TokioIoChannel {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl From<UnixStream> for TokioIoChannel {
    fn from(s: UnixStream) -> Self {
        TokioIoChannel::Unix(s)
    }
}

impl From<TcpStream> for TokioIoChannel {
    fn from(s: TcpStream) -> Self {
        TokioIoChannel::Tcp(s)
    }
}

impl IoChannel for TokioIoChannel {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TokioIoChannel::Unix(s) => s.try_read(buf),
            TokioIoChannel::Tcp(s) => s.try_read(buf),
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TokioIoChannel::Unix(s) => s.try_write(buf),
            TokioIoChannel::Tcp(s) => s.try_write(buf),
        }
    }

    fn try_write_with_creds(&self, buf: &[u8], creds: Option<Creds>) -> io::Result<usize> {
        match self {
            TokioIoChannel::Unix(s) if creds.is_some() => send_with_creds(s, buf),
            _ => self.try_write(buf),
        }
    }

    fn try_read_with_creds(&self, buf: &mut [u8]) -> io::Result<(usize, Option<Creds>)> {
        match self {
            TokioIoChannel::Unix(s) => recv_with_creds(s, buf),
            TokioIoChannel::Tcp(_) => self.try_read(buf).map(|n| (n, None)),
        }
    }

    async fn readable(&self) -> io::Result<()> {
        match self {
            TokioIoChannel::Unix(s) => s.readable().await,
            TokioIoChannel::Tcp(s) => s.readable().await,
        }
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            TokioIoChannel::Unix(s) => s.writable().await,
            TokioIoChannel::Tcp(s) => s.writable().await,
        }
    }
}

/// Sends `buf` with an `SCM_CREDENTIALS` ancillary record attached.
fn send_with_creds(stream: &UnixStream, buf: &[u8]) -> io::Result<usize> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
    use nix::unistd::{getgid, getpid, getuid};
    use std::os::fd::AsRawFd;

    let creds = nix::sys::socket::UnixCredentials::from(libc::ucred {
        pid: getpid().as_raw(),
        uid: getuid().as_raw(),
        gid: getgid().as_raw(),
    });
    let cmsg = [ControlMessage::ScmCredentials(&creds)];
    let iov = [std::io::IoSlice::new(buf)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::MSG_DONTWAIT, None)
        .map(|n| n)
        .map_err(io::Error::from)
}

/// Receives into `buf`, surfacing any `SCM_CREDENTIALS` record the sender
/// attached.
fn recv_with_creds(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Option<Creds>)> {
    use nix::cmsg_space;
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
    use std::os::fd::AsRawFd;

    let mut iov = [std::io::IoSliceMut::new(buf)];
    let mut cmsg_buffer = cmsg_space!(nix::sys::socket::UnixCredentials);
    let msg = recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg_buffer), MsgFlags::MSG_DONTWAIT)
        .map_err(io::Error::from)?;

    let creds = msg.cmsgs()?.find_map(|cmsg| match cmsg {
        ControlMessageOwned::ScmCredentials(c) => Some(Creds { pid: c.pid() as u32, uid: c.uid(), gid: c.gid() }),
        _ => None,
    });

    Ok((msg.bytes, creds))
}
