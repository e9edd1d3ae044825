//! L2CAP socket address marshaling.
//!
//! The standard library has no representation for `AF_BLUETOOTH` socket
//! addresses, so this module converts between the typed [`SockAddrL2`]
//! and the `sockaddr_l2` layout the kernel expects in `bind(2)`,
//! `accept(2)` and `getsockname(2)`.

use std::{fmt, mem};

use bluer::Address;
use libc::{sa_family_t, socklen_t};

use crate::error::{HidError, Result};

pub const BTPROTO_L2CAP: i32 = 0;
pub const BDADDR_BREDR: u8 = 0x00;

/// Kernel `struct sockaddr_l2`.
///
/// `l2_psm` is little-endian and `l2_bdaddr` holds the address bytes in
/// reverse display order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub struct sockaddr_l2 {
   pub l2_family: sa_family_t,
   pub l2_psm: u16,
   pub l2_bdaddr: [u8; 6],
   pub l2_cid: u16,
   pub l2_bdaddr_type: u8,
}

pub const SOCKADDR_L2_LEN: socklen_t = mem::size_of::<sockaddr_l2>() as socklen_t;

/// Typed L2CAP endpoint address: PSM plus device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddrL2 {
   pub psm: u16,
   pub addr: Address,
}

impl SockAddrL2 {
   pub const fn new(psm: u16, addr: Address) -> Self {
      Self { psm, addr }
   }

   /// Local wildcard address for binding a listener.
   pub fn any(psm: u16) -> Self {
      Self::new(psm, Address::any())
   }

   pub fn to_raw(self) -> sockaddr_l2 {
      let mut bdaddr = self.addr.0;
      bdaddr.reverse();
      sockaddr_l2 {
         l2_family: libc::AF_BLUETOOTH as sa_family_t,
         l2_psm: self.psm.to_le(),
         l2_bdaddr: bdaddr,
         l2_cid: 0,
         l2_bdaddr_type: BDADDR_BREDR,
      }
   }

   pub fn from_raw(raw: &sockaddr_l2) -> Result<Self> {
      if raw.l2_family != libc::AF_BLUETOOTH as sa_family_t {
         return Err(HidError::AddressFamily(raw.l2_family));
      }
      let mut bdaddr = raw.l2_bdaddr;
      bdaddr.reverse();
      Ok(Self::new(u16::from_le(raw.l2_psm), Address(bdaddr)))
   }
}

impl fmt::Display for SockAddrL2 {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "[PSM: {:#06x}, Bdaddr: {}]", self.psm, self.addr)
   }
}
