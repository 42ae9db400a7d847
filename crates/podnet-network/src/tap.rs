//! Persistent tap devices.
//!
//! A persistent tap outlives the file descriptor that created it, so the
//! hypervisor can open it by name later. Creation goes through the
//! `/dev/net/tun` ioctls; a `%d` in the requested name is replaced by the
//! kernel with the first free number.

use podnet_common::PodnetResult;
#[cfg(target_os = "linux")]
use podnet_common::PodnetError;

#[cfg(target_os = "linux")]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;

    use podnet_common::{PodnetError, PodnetResult};

    const TUN_DEVICE: &str = "/dev/net/tun";
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; libc::IF_NAMESIZE],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    fn ifreq(name: &str) -> PodnetResult<IfReq> {
        if name.len() >= libc::IF_NAMESIZE || name.as_bytes().contains(&0) {
            return Err(PodnetError::config(format!(
                "invalid interface name {name:?} (max {} chars)",
                libc::IF_NAMESIZE - 1
            )));
        }

        let mut req = IfReq {
            name: [0; libc::IF_NAMESIZE],
            flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        Ok(req)
    }

    fn open_tun() -> PodnetResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|e| PodnetError::kernel("open /dev/net/tun", e.to_string()))
    }

    /// Attach to (or create) the tap `name` and set its persist flag.
    #[allow(unsafe_code)]
    pub fn set_persist(name: &str, persist: bool) -> PodnetResult<String> {
        let mut req = ifreq(name)?;
        let file = open_tun()?;

        // SAFETY: req is a properly sized, initialized ifreq for TUNSETIFF.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(PodnetError::kernel(
                "TUNSETIFF",
                std::io::Error::last_os_error().to_string(),
            ));
        }

        // SAFETY: TUNSETPERSIST takes an integer argument by value.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                TUNSETPERSIST as _,
                libc::c_ulong::from(persist),
            )
        };
        if rc < 0 {
            return Err(PodnetError::kernel(
                "TUNSETPERSIST",
                std::io::Error::last_os_error().to_string(),
            ));
        }

        let len = req
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(libc::IF_NAMESIZE);
        let bytes: Vec<u8> = req.name[..len].iter().map(|&c| c as u8).collect();
        String::from_utf8(bytes)
            .map_err(|e| PodnetError::kernel("TUNSETIFF", format!("invalid interface name: {e}")))
    }
}

/// Create a persistent tap from a name template and return its name.
///
/// # Errors
///
/// Returns a kernel error if the tun driver refuses the request.
#[cfg(target_os = "linux")]
pub fn create_persistent(template: &str) -> PodnetResult<String> {
    let name = sys::set_persist(template, true)?;
    tracing::debug!(template, name = %name, "Persistent tap created");
    Ok(name)
}

/// Drop the persist flag of a tap, which removes it once unused.
///
/// # Errors
///
/// Returns a kernel error if the tap cannot be attached.
#[cfg(target_os = "linux")]
pub fn remove_persistent(name: &str) -> PodnetResult<()> {
    if name.contains('%') {
        return Err(PodnetError::config(format!(
            "refusing to remove tap by template {name:?}"
        )));
    }
    sys::set_persist(name, false)?;
    tracing::debug!(name, "Persistent tap removed");
    Ok(())
}

/// Tap devices are Linux only.
#[cfg(not(target_os = "linux"))]
pub fn create_persistent(_template: &str) -> PodnetResult<String> {
    Err(podnet_common::PodnetError::Unsupported {
        feature: "tap devices".to_string(),
    })
}

/// Tap devices are Linux only.
#[cfg(not(target_os = "linux"))]
pub fn remove_persistent(_name: &str) -> PodnetResult<()> {
    Err(podnet_common::PodnetError::Unsupported {
        feature: "tap devices".to_string(),
    })
}
