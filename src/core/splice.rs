//! Kernel splice between two TCP sockets
//!
//! Data moves socket -> pipe -> socket without entering user space.

use std::io;

use super::conn::TcpConnection;
use super::signal::ActivityUpdater;

/// Whether this build can splice at all
pub(crate) const SUPPORTED: bool = cfg!(any(target_os = "linux", target_os = "android"));

/// Copy from `src` to `dst` until EOF or error.
///
/// Returns the bytes delivered to `dst` together with the outcome, so callers
/// can account for partial progress on failure.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) async fn splice_copy(
    src: &TcpConnection,
    dst: &TcpConnection,
    timer: &dyn ActivityUpdater,
) -> (u64, io::Result<()>) {
    use super::conn::Direction;
    use nix::fcntl::{splice, SpliceFFlags};

    // Default pipe capacity on Linux
    const PIPE_CHUNK: usize = 64 * 1024;

    let (pipe_rd, pipe_wr) = match nix::unistd::pipe() {
        Ok(pipe) => pipe,
        Err(errno) => return (0, Err(errno.into())),
    };
    let flags = SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK;
    let mut total = 0u64;

    loop {
        // The pipe is empty here, so EAGAIN can only come from the socket
        let filled = match src
            .io_with(Direction::Read, |socket| {
                splice(socket, None, &pipe_wr, None, PIPE_CHUNK, flags).map_err(io::Error::from)
            })
            .await
        {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };

        let mut drained = 0;
        while drained < filled {
            let pending = filled - drained;
            match dst
                .io_with(Direction::Write, |socket| {
                    splice(&pipe_rd, None, socket, None, pending, flags).map_err(io::Error::from)
                })
                .await
            {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "splice wrote zero bytes");
                    return (total + drained as u64, Err(err));
                }
                Ok(n) => drained += n,
                Err(e) => return (total + drained as u64, Err(e)),
            }
        }

        total += filled as u64;
        timer.update();
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) async fn splice_copy(
    _src: &TcpConnection,
    _dst: &TcpConnection,
    _timer: &dyn ActivityUpdater,
) -> (u64, io::Result<()>) {
    let err = io::Error::new(
        io::ErrorKind::Unsupported,
        "splice is not available on this platform",
    );
    (0, Err(err))
}
