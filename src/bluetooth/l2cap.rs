//! L2CAP socket endpoints.
//!
//! This module provides a raw `SOCK_SEQPACKET` L2CAP socket with explicit
//! blocking-mode handling. Non-blocking endpoints wait for readiness with
//! `poll(2)` before every attempt and retry after a short sleep when the
//! kernel reports `EAGAIN`.

use std::{
   fmt, io,
   os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
   sync::atomic::{AtomicBool, Ordering},
   thread,
   time::Duration,
};

use log::{debug, info, warn};
use nix::{
   errno::Errno,
   fcntl::{FcntlArg, OFlag, fcntl},
   poll::{PollFd, PollFlags, poll},
   sys::socket::{self, AddressFamily, MsgFlags, Shutdown, SockFlag, SockType},
   unistd,
};
use parking_lot::{Mutex, RwLock};

use crate::{
   bluetooth::sockaddr::{SOCKADDR_L2_LEN, SockAddrL2, sockaddr_l2},
   error::{HidError, Result},
};

/// Readiness wait before each attempt on a non-blocking endpoint
const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Back-off after the kernel reports would-block
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// One L2CAP endpoint, either listening or connected.
///
/// The descriptor is exclusively owned. Reads and writes are serialized
/// independently: a read in flight never blocks a write, but two readers
/// (or two writers) are mutually exclusive.
pub struct L2capSocket {
   fd: RwLock<Option<OwnedFd>>,
   addr: SockAddrL2,
   blocking: AtomicBool,
   reader: Mutex<()>,
   writer: Mutex<()>,
}

impl L2capSocket {
   fn from_parts(fd: OwnedFd, addr: SockAddrL2, blocking: bool) -> Self {
      Self {
         fd: RwLock::new(Some(fd)),
         addr,
         blocking: AtomicBool::new(blocking),
         reader: Mutex::new(()),
         writer: Mutex::new(()),
      }
   }

   /// Creates a listening endpoint bound to `psm` on any local adapter.
   ///
   /// The descriptor is released again if any step after its creation fails.
   pub fn listen(psm: u16, backlog: usize, blocking: bool) -> Result<Self> {
      let fd = socket::socket(
         AddressFamily::Bluetooth,
         SockType::SeqPacket,
         SockFlag::SOCK_CLOEXEC,
         None,
      )
      .map_err(io::Error::from)
      .inspect_err(|e| warn!("Failed to create L2CAP socket: {e}"))?;
      debug!("L2CAP socket created");

      set_fd_blocking(fd.as_raw_fd(), blocking)?;

      let addr = SockAddrL2::any(psm);
      let raw_addr = addr.to_raw();
      // SAFETY: `raw_addr` is a complete `sockaddr_l2` and the length matches it.
      cvt(unsafe { libc::bind(fd.as_raw_fd(), (&raw const raw_addr).cast(), SOCKADDR_L2_LEN) })
         .inspect_err(|e| warn!("Failed to bind L2CAP socket to {addr}: {e}"))?;

      socket::listen(&fd, backlog)
         .map_err(io::Error::from)
         .inspect_err(|e| warn!("Failed to listen on {addr}: {e}"))?;

      info!("Listening on {addr}");
      Ok(Self::from_parts(fd, addr, blocking))
   }

   /// Adopts a connected descriptor handed over by another process.
   ///
   /// The descriptor is closed if its local address cannot be resolved.
   pub fn wrap(fd: OwnedFd) -> Result<Self> {
      let mut local = sockaddr_l2::default();
      let mut len = SOCKADDR_L2_LEN;
      // SAFETY: the kernel writes at most `len` bytes into `local`.
      cvt(unsafe { libc::getsockname(fd.as_raw_fd(), (&raw mut local).cast(), &mut len) })
         .inspect_err(|e| warn!("Failure on getsockname: {e}"))?;

      let addr = SockAddrL2::from_raw(&local)?;
      debug!("Resolved sockname: {addr}");

      set_fd_blocking(fd.as_raw_fd(), false)?;
      Ok(Self::from_parts(fd, addr, false))
   }

   /// Accepts one connection. Accepted endpoints are always non-blocking.
   pub fn accept(&self) -> Result<Self> {
      self.accept_with(SockAddrL2::from_raw)
   }

   fn accept_with<F>(&self, decode: F) -> Result<Self>
   where
      F: Fn(&sockaddr_l2) -> Result<SockAddrL2>,
   {
      let _reader = self.reader.lock();
      let guard = self.fd.read();
      let fd = guard.as_ref().ok_or(HidError::SocketClosed)?;

      loop {
         if !self.is_blocking() && !wait_ready(fd, PollFlags::POLLIN, READY_TIMEOUT)? {
            return Err(HidError::RequestTimeout);
         }

         let mut peer = sockaddr_l2::default();
         let mut len = SOCKADDR_L2_LEN;
         // SAFETY: the kernel writes at most `len` bytes of peer address into `peer`.
         let ret = unsafe {
            libc::accept4(
               fd.as_raw_fd(),
               (&raw mut peer).cast(),
               &mut len,
               libc::SOCK_CLOEXEC,
            )
         };
         if ret < 0 {
            match Errno::last() {
               Errno::EAGAIN => thread::sleep(RETRY_DELAY),
               Errno::ECONNABORTED | Errno::EINTR => {},
               errno => {
                  warn!("Accept on {} failed: {errno}", self.addr);
                  return Err(io::Error::from(errno).into());
               },
            }
            continue;
         }

         // SAFETY: `accept4` just returned this descriptor and nothing else owns it.
         let conn = unsafe { OwnedFd::from_raw_fd(ret) };
         let addr = decode(&peer)?;
         info!("Remote address info: {addr}");

         set_fd_blocking(conn.as_raw_fd(), false)?;
         return Ok(Self::from_parts(conn, addr, false));
      }
   }

   /// Reads one packet into `buf`, returning its length. Zero means the
   /// peer closed the channel.
   pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
      self.transfer(&self.reader, PollFlags::POLLIN, |fd| {
         socket::recv(fd, &mut *buf, MsgFlags::empty())
      })
   }

   pub fn write(&self, buf: &[u8]) -> Result<usize> {
      self.transfer(&self.writer, PollFlags::POLLOUT, |fd| {
         socket::send(fd, buf, MsgFlags::MSG_NOSIGNAL)
      })
   }

   fn transfer<F>(&self, lock: &Mutex<()>, events: PollFlags, mut op: F) -> Result<usize>
   where
      F: FnMut(RawFd) -> nix::Result<usize>,
   {
      let _serial = lock.lock();
      let guard = self.fd.read();
      let fd = guard.as_ref().ok_or(HidError::SocketClosed)?;

      loop {
         if !self.is_blocking() {
            // A timeout is not fatal here: the attempt below reports EAGAIN
            // and the cycle starts over.
            wait_ready(fd, events, READY_TIMEOUT)?;
         }

         match op(fd.as_raw_fd()) {
            Ok(n) => return Ok(n),
            Err(Errno::EAGAIN) => thread::sleep(RETRY_DELAY),
            Err(Errno::EINTR) => {},
            Err(errno) => return Err(io::Error::from(errno).into()),
         }
      }
   }

   pub fn set_blocking(&self, blocking: bool) -> Result<()> {
      let guard = self.fd.read();
      let fd = guard.as_ref().ok_or(HidError::SocketClosed)?;
      set_fd_blocking(fd.as_raw_fd(), blocking)?;
      self.blocking.store(blocking, Ordering::Release);
      Ok(())
   }

   /// Shuts both directions down, waking any reader blocked on the endpoint.
   pub fn shutdown(&self) -> Result<()> {
      let guard = self.fd.read();
      let fd = guard.as_ref().ok_or(HidError::SocketClosed)?;
      socket::shutdown(fd.as_raw_fd(), Shutdown::Both).map_err(io::Error::from)?;
      Ok(())
   }

   /// Closes the descriptor. Closing an endpoint twice is an error.
   pub fn close(&self) -> Result<()> {
      let fd = self.fd.write().take().ok_or(HidError::SocketClosed)?;
      unistd::close(fd.into_raw_fd())
         .map_err(io::Error::from)
         .inspect_err(|e| warn!("Failed to close {}: {e}", self.addr))?;
      debug!("Closed L2CAP socket {}", self.addr);
      Ok(())
   }

   pub fn is_open(&self) -> bool {
      self.fd.read().is_some()
   }

   pub fn is_blocking(&self) -> bool {
      self.blocking.load(Ordering::Acquire)
   }

   /// Local address for listeners and wrapped endpoints, peer address for
   /// accepted ones.
   pub const fn addr(&self) -> SockAddrL2 {
      self.addr
   }
}

impl fmt::Debug for L2capSocket {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("L2capSocket")
         .field("fd", &self.fd.read().as_ref().map(AsRawFd::as_raw_fd))
         .field("addr", &self.addr)
         .field("blocking", &self.is_blocking())
         .finish()
   }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
   if ret < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(ret)
   }
}

/// Waits until `fd` reports `events`. Returns false on timeout.
fn wait_ready(fd: &impl AsFd, events: PollFlags, timeout: Duration) -> io::Result<bool> {
   let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
   loop {
      let mut fds = [PollFd::new(fd, events)];
      match poll(&mut fds, millis) {
         Ok(n) => return Ok(n > 0),
         Err(Errno::EINTR) => {},
         Err(errno) => {
            warn!("Select syscall failure: {errno}");
            return Err(errno.into());
         },
      }
   }
}

fn set_fd_blocking(fd: RawFd, blocking: bool) -> io::Result<()> {
   let flags = fcntl(fd, FcntlArg::F_GETFL)
      .inspect_err(|e| warn!("Failed to fetch descriptor flags: {e}"))?;
   let mut flags = OFlag::from_bits_truncate(flags);
   flags.set(OFlag::O_NONBLOCK, !blocking);
   fcntl(fd, FcntlArg::F_SETFL(flags))
      .inspect_err(|e| warn!("Failed to set descriptor flags: {e}"))?;
   Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
   use std::path::Path;

   use nix::sys::socket::UnixAddr;

   use super::*;

   fn endpoint(fd: OwnedFd, blocking: bool) -> L2capSocket {
      set_fd_blocking(fd.as_raw_fd(), blocking).unwrap();
      L2capSocket::from_parts(fd, SockAddrL2::any(0), blocking)
   }

   /// Connected `AF_UNIX` seqpacket pair standing in for an L2CAP link.
   pub(crate) fn socket_pair() -> (L2capSocket, L2capSocket) {
      let (a, b) = socket::socketpair(
         AddressFamily::Unix,
         SockType::SeqPacket,
         None,
         SockFlag::SOCK_CLOEXEC,
      )
      .unwrap();
      (endpoint(a, false), endpoint(b, false))
   }

   /// `AF_UNIX` seqpacket listener bound to `path`.
   pub(crate) fn unix_listener(path: &Path, blocking: bool) -> L2capSocket {
      let fd = socket::socket(
         AddressFamily::Unix,
         SockType::SeqPacket,
         SockFlag::SOCK_CLOEXEC,
         None,
      )
      .unwrap();
      socket::bind(fd.as_raw_fd(), &UnixAddr::new(path).unwrap()).unwrap();
      socket::listen(&fd, 4).unwrap();
      endpoint(fd, blocking)
   }

   pub(crate) fn unix_connect(path: &Path) -> L2capSocket {
      let fd = socket::socket(
         AddressFamily::Unix,
         SockType::SeqPacket,
         SockFlag::SOCK_CLOEXEC,
         None,
      )
      .unwrap();
      socket::connect(fd.as_raw_fd(), &UnixAddr::new(path).unwrap()).unwrap();
      endpoint(fd, false)
   }

   /// Peer decoder for listeners whose peers are not Bluetooth devices.
   pub(crate) fn any_peer(_: &sockaddr_l2) -> Result<SockAddrL2> {
      Ok(SockAddrL2::any(0))
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use std::time::Instant;

   use super::{
      testing::{any_peer, socket_pair, unix_connect, unix_listener},
      *,
   };

   fn fd_is_nonblocking(socket: &L2capSocket) -> bool {
      let fd = socket.fd.read().as_ref().unwrap().as_raw_fd();
      OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap()).contains(OFlag::O_NONBLOCK)
   }

   #[test]
   fn test_write_then_read_preserves_packets() {
      let (a, b) = socket_pair();
      assert_eq!(a.write(&[0xa1, 0x13, 0x03]).unwrap(), 3);
      assert_eq!(a.write(&[0x00]).unwrap(), 1);

      let mut buf = [0u8; 16];
      assert_eq!(b.read(&mut buf).unwrap(), 3);
      assert_eq!(&buf[..3], &[0xa1, 0x13, 0x03]);
      assert_eq!(b.read(&mut buf).unwrap(), 1);
      assert_eq!(buf[0], 0x00);
   }

   #[test]
   fn test_read_retries_until_data_arrives() {
      let (a, b) = socket_pair();
      let writer = thread::spawn(move || {
         thread::sleep(Duration::from_millis(50));
         a.write(b"late").unwrap();
         a
      });

      let mut buf = [0u8; 8];
      let n = b.read(&mut buf).unwrap();
      assert_eq!(&buf[..n], b"late");
      writer.join().unwrap();
   }

   #[test]
   fn test_read_returns_zero_after_peer_close() {
      let (a, b) = socket_pair();
      a.close().unwrap();

      let mut buf = [0u8; 8];
      assert_eq!(b.read(&mut buf).unwrap(), 0);
   }

   #[test]
   fn test_double_close_is_an_error() {
      let (a, _b) = socket_pair();
      assert!(a.is_open());
      a.close().unwrap();
      assert!(!a.is_open());
      assert!(matches!(a.close(), Err(HidError::SocketClosed)));

      let mut buf = [0u8; 4];
      assert!(matches!(a.read(&mut buf), Err(HidError::SocketClosed)));
      assert!(matches!(a.write(&buf), Err(HidError::SocketClosed)));
   }

   #[test]
   fn test_shutdown_wakes_blocked_reader() {
      let (a, _b) = socket_pair();
      let a = Arc::new(a);
      let reader = thread::spawn({
         let a = a.clone();
         move || {
            let mut buf = [0u8; 8];
            a.read(&mut buf)
         }
      });

      thread::sleep(Duration::from_millis(50));
      a.shutdown().unwrap();
      assert_eq!(reader.join().unwrap().unwrap(), 0);
   }

   #[test]
   fn test_set_blocking_toggles_flag() {
      let (a, _b) = socket_pair();

      assert!(fd_is_nonblocking(&a));
      a.set_blocking(true).unwrap();
      assert!(a.is_blocking());
      assert!(!fd_is_nonblocking(&a));
      a.set_blocking(false).unwrap();
      assert!(fd_is_nonblocking(&a));
   }

   #[test]
   fn test_wrap_rejects_non_bluetooth_descriptor() {
      let (ours, theirs) = socket::socketpair(
         AddressFamily::Unix,
         SockType::SeqPacket,
         None,
         SockFlag::empty(),
      )
      .unwrap();

      let err = L2capSocket::wrap(ours).unwrap_err();
      assert!(matches!(err, HidError::AddressFamily(f) if f == libc::AF_UNIX as u16));
      drop(theirs);
   }

   #[test]
   fn test_accept_times_out_without_peer() {
      let dir = tempfile::tempdir().unwrap();
      let listener = unix_listener(&dir.path().join("intr"), false);

      let started = Instant::now();
      let err = listener.accept_with(any_peer).unwrap_err();
      assert!(matches!(err, HidError::RequestTimeout));
      assert!(started.elapsed() >= READY_TIMEOUT);
      assert!(listener.is_open());
   }

   #[test]
   fn test_accepted_endpoint_is_nonblocking_and_closes_once() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("intr");
      let listener = unix_listener(&path, false);
      let client = unix_connect(&path);

      let conn = listener.accept_with(any_peer).unwrap();
      assert!(!conn.is_blocking());
      assert!(fd_is_nonblocking(&conn));

      client.write(&[0x60]).unwrap();
      let mut buf = [0u8; 4];
      assert_eq!(conn.read(&mut buf).unwrap(), 1);
      assert_eq!(buf[0], 0x60);

      conn.close().unwrap();
      assert!(matches!(conn.close(), Err(HidError::SocketClosed)));
      assert_eq!(client.read(&mut buf).unwrap(), 0);
   }

   #[test]
   fn test_nonblocking_accept_waits_for_late_peer() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("intr");
      let listener = unix_listener(&path, false);

      let connector = thread::spawn({
         let path = path.clone();
         move || {
            thread::sleep(Duration::from_millis(50));
            unix_connect(&path)
         }
      });

      let conn = listener.accept_with(any_peer).unwrap();
      let client = connector.join().unwrap();
      conn.write(b"hi").unwrap();
      let mut buf = [0u8; 4];
      assert_eq!(client.read(&mut buf).unwrap(), 2);
   }

   #[test]
   fn test_blocking_listener_hands_out_nonblocking_endpoints() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("intr");
      let listener = unix_listener(&path, true);
      let _client = unix_connect(&path);

      let conn = listener.accept_with(any_peer).unwrap();
      assert!(listener.is_blocking());
      assert!(!conn.is_blocking());
      assert!(fd_is_nonblocking(&conn));
   }

   #[test]
   fn test_accept_on_closed_listener() {
      let dir = tempfile::tempdir().unwrap();
      let listener = unix_listener(&dir.path().join("intr"), false);
      listener.close().unwrap();
      assert!(matches!(listener.accept(), Err(HidError::SocketClosed)));
   }

   #[test]
   fn test_accept_rejects_non_bluetooth_peer() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("intr");
      let listener = unix_listener(&path, false);
      let _client = unix_connect(&path);

      let err = listener.accept().unwrap_err();
      assert!(matches!(err, HidError::AddressFamily(f) if f == libc::AF_UNIX as u16));
   }

   #[test]
   fn test_listen_on_dynamic_psm() {
      // Hosts without the bluetooth module, or without the privilege to
      // create Bluetooth sockets, cannot run this path.
      let listener = match L2capSocket::listen(0x1235, 1, false) {
         Ok(listener) => listener,
         Err(HidError::Io(e))
            if matches!(
               e.raw_os_error(),
               Some(
                  libc::EAFNOSUPPORT
                     | libc::EPROTONOSUPPORT
                     | libc::EADDRNOTAVAIL
                     | libc::EPERM
                     | libc::EACCES
               )
            ) =>
         {
            return;
         },
         Err(e) => panic!("listen failed: {e}"),
      };

      assert!(listener.is_open());
      assert!(!listener.is_blocking());
      assert_eq!(listener.addr().psm, 0x1235);
      assert!(matches!(listener.accept(), Err(HidError::RequestTimeout)));
      listener.close().unwrap();
      assert!(matches!(listener.close(), Err(HidError::SocketClosed)));
   }
}
