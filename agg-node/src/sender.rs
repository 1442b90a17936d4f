//! Control-plane fragment sender.
//!
//! A plain UDP socket bound to the aggregation device. Each round is pushed
//! as one datagram per fragment, addressed to the sentinel so the egress
//! hook turns it into this host's own contribution.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use agg_common::{AggPayload, FRAGMENT_SIZE, GRADIENT_SIZE};
use anyhow::{anyhow, bail, Result};

pub struct FragmentSender {
    fd: RawFd,
    dest: libc::sockaddr_in,
    host_id: u32,
}

impl FragmentSender {
    /// Open a datagram socket pinned to `interface`, targeting
    /// `sentinel:port`.
    pub fn bind(interface: &str, host_id: u32, sentinel: Ipv4Addr, port: u16) -> Result<FragmentSender> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(anyhow!(
                "failed to create sender socket: {}",
                std::io::Error::last_os_error()
            ));
        }

        let ifname = std::ffi::CString::new(interface)?;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                ifname.as_ptr() as *const libc::c_void,
                (interface.len() + 1) as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(anyhow!("SO_BINDTODEVICE {}: {}", interface, err));
        }

        let mut dest: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        dest.sin_family = libc::AF_INET as libc::sa_family_t;
        dest.sin_port = port.to_be();
        dest.sin_addr = libc::in_addr {
            s_addr: u32::from_ne_bytes(sentinel.octets()),
        };

        Ok(FragmentSender { fd, dest, host_id })
    }

    /// Emit one payload per fragment for `round`. `grads` is the full
    /// fragment-major gradient matrix.
    pub fn send_round(&self, round: u32, grads: &[i32]) -> Result<()> {
        if grads.len() != FRAGMENT_SIZE * GRADIENT_SIZE {
            bail!(
                "gradient matrix must hold {} lanes, got {}",
                FRAGMENT_SIZE * GRADIENT_SIZE,
                grads.len()
            );
        }

        let mut buf = [0u8; AggPayload::WIRE_LEN];
        for fragment_id in 0..FRAGMENT_SIZE {
            let mut payload = AggPayload {
                host_id: self.host_id,
                fragment_id: fragment_id as u32,
                bcast: 0,
                round,
                grads: [0; GRADIENT_SIZE],
            };
            let base = fragment_id * GRADIENT_SIZE;
            payload.grads.copy_from_slice(&grads[base..base + GRADIENT_SIZE]);
            let len = payload
                .encode(&mut buf)
                .ok_or_else(|| anyhow!("payload buffer too small"))?;

            let sent = unsafe {
                libc::sendto(
                    self.fd,
                    buf.as_ptr() as *const libc::c_void,
                    len,
                    0,
                    &self.dest as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if sent < 0 {
                return Err(anyhow!(
                    "sendto fragment {}: {}",
                    fragment_id,
                    std::io::Error::last_os_error()
                ));
            }
        }
        Ok(())
    }
}

impl Drop for FragmentSender {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
