use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Source of the address line on the display.
pub trait AddressResolver: Send {
    /// The device's address in numeric form, or `None` when there is none.
    fn resolve(&self) -> Option<String>;
}

/// Looks up the IPv4 address of one named interface.
#[derive(Clone, Debug)]
pub struct InterfaceResolver {
    interface: String,
}

impl InterfaceResolver {
    pub fn new(interface: impl Into<String>) -> Self {
        InterfaceResolver {
            interface: interface.into(),
        }
    }
}

impl AddressResolver for InterfaceResolver {
    fn resolve(&self) -> Option<String> {
        match interface_ipv4(&self.interface) {
            Ok(Some(address)) => Some(address.to_string()),
            Ok(None) => {
                debug!("No IPv4 address on {}", self.interface);
                None
            }
            Err(e) => {
                warn!("getifaddrs failed: {}", e);
                None
            }
        }
    }
}

/// IPv4 address of `name`; the last one wins if the interface has several.
pub fn interface_ipv4(name: &str) -> io::Result<Option<Ipv4Addr>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs only writes the list head; it is freed below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut found = None;
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor is a live node of the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        // SAFETY: ifa_addr is non-null and points at a sockaddr owned by the list.
        let family = i32::from(unsafe { (*entry.ifa_addr).sa_family });
        if family != libc::AF_INET {
            continue;
        }
        // SAFETY: ifa_name is a non-null NUL-terminated string owned by the list.
        let ifname = unsafe { CStr::from_ptr(entry.ifa_name) };
        if ifname.to_bytes() != name.as_bytes() {
            continue;
        }
        // SAFETY: AF_INET entries carry a sockaddr_in.
        let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
    }

    // SAFETY: head came from a successful getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(head) };
    Ok(found)
}
