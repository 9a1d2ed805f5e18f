use std::{
  io, mem,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
  os::fd::RawFd,
  ptr,
};

/// Reads a socket address the kernel wrote into `storage`.
///
/// # Safety
///
/// `storage` must have been filled in by the kernel (or zeroed), so that the
/// family tag describes the bytes that follow it.
pub unsafe fn sockaddr_storage_into_std(
  storage: &libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
  let storage = storage as *const libc::sockaddr_storage;
  // SAFETY: the pointer comes from a reference.
  let family = unsafe { (*storage).ss_family };

  if family == libc::AF_INET as libc::sa_family_t {
    // SAFETY: the family says this is a sockaddr_in, which fits in storage.
    let v4 = unsafe { *storage.cast::<libc::sockaddr_in>() };
    let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(v4.sin_port))))
  } else if family == libc::AF_INET6 as libc::sa_family_t {
    // SAFETY: as above, for sockaddr_in6.
    let v6 = unsafe { *storage.cast::<libc::sockaddr_in6>() };
    Ok(SocketAddr::V6(SocketAddrV6::new(
      Ipv6Addr::from(v6.sin6_addr.s6_addr),
      u16::from_be(v6.sin6_port),
      v6.sin6_flowinfo,
      v6.sin6_scope_id,
    )))
  } else {
    Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT))
  }
}

/// Encodes `addr` for the socket syscalls, returning the storage and the
/// length of the meaningful prefix.
pub fn std_into_sockaddr_storage(
  addr: SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  // SAFETY: all-zero is a valid sockaddr_storage.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

  let len = match addr {
    SocketAddr::V4(v4) => {
      let raw = into_addr(v4);
      // SAFETY: sockaddr_in fits in sockaddr_storage and the regions are
      // distinct locals.
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in as *const u8,
          &mut storage as *mut libc::sockaddr_storage as *mut u8,
          mem::size_of::<libc::sockaddr_in>(),
        );
      }
      mem::size_of::<libc::sockaddr_in>()
    }
    SocketAddr::V6(v6) => {
      let raw = into_addr6(v6);
      // SAFETY: as above, for sockaddr_in6.
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in6 as *const u8,
          &mut storage as *mut libc::sockaddr_storage as *mut u8,
          mem::size_of::<libc::sockaddr_in6>(),
        );
      }
      mem::size_of::<libc::sockaddr_in6>()
    }
  };

  (storage, len as libc::socklen_t)
}

fn into_addr(addr: SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: plain C struct, zero is valid for every field.
  let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
  raw.sin_family = libc::AF_INET as libc::sa_family_t;
  raw.sin_port = addr.port().to_be();
  raw.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
  raw
}

fn into_addr6(addr: SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: plain C struct, zero is valid for every field.
  let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
  raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  raw.sin6_port = addr.port().to_be();
  raw.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
  raw.sin6_flowinfo = addr.flowinfo();
  raw.sin6_scope_id = addr.scope_id();
  raw
}

type NameFn = unsafe extern "C" fn(
  RawFd,
  *mut libc::sockaddr,
  *mut libc::socklen_t,
) -> libc::c_int;

fn query(fd: RawFd, name: NameFn) -> io::Result<SocketAddr> {
  // SAFETY: zeroed storage is valid input for getsockname/getpeername.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

  // SAFETY: storage and len describe a writable buffer of the right size.
  let res = unsafe {
    name(fd, &mut storage as *mut libc::sockaddr_storage as *mut _, &mut len)
  };
  if res == -1 {
    return Err(io::Error::last_os_error());
  }

  // SAFETY: the kernel filled in storage.
  unsafe { sockaddr_storage_into_std(&storage) }
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
  query(fd, libc::getsockname)
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
  query(fd, libc::getpeername)
}
