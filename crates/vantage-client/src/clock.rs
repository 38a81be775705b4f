//! Host monotonic clock and conversion into the XR time domain.

use openxr as xr;

use vantage_common::{Error, Result};

/// A `CLOCK_MONOTONIC` reading, kept as a raw timespec so it can be handed to
/// `xrConvertTimespecTimeToTimeKHR` without loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonotonicStamp {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl MonotonicStamp {
    pub fn now() -> Result<Self> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return Err(Error::xr("clock_gettime(CLOCK_MONOTONIC) failed"));
        }
        Ok(Self {
            tv_sec: ts.tv_sec as i64,
            tv_nsec: ts.tv_nsec as i64,
        })
    }

    fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.tv_sec as libc::time_t,
            tv_nsec: self.tv_nsec as _,
        }
    }
}

/// Wraps the `XR_KHR_convert_timespec_time` entry points acquired at init.
#[derive(Clone, Copy)]
pub struct TimeConverter {
    raw: xr::raw::ConvertTimespecTimeKHR,
}

impl TimeConverter {
    pub fn new(instance: &xr::Instance) -> Result<Self> {
        let raw = instance
            .exts()
            .khr_convert_timespec_time
            .ok_or_else(|| Error::xr("XR_KHR_convert_timespec_time not enabled"))?;
        Ok(Self { raw })
    }

    /// Convert a host monotonic stamp into the XR time domain.
    pub fn to_xr_time(&self, instance: &xr::Instance, stamp: MonotonicStamp) -> Result<xr::Time> {
        let ts = stamp.to_timespec();
        let mut time = xr::Time::from_nanos(0);
        let res = unsafe {
            (self.raw.convert_timespec_time_to_time)(instance.as_raw(), &ts, &mut time)
        };
        if res == xr::sys::Result::SUCCESS {
            Ok(time)
        } else {
            Err(Error::xr(format!("time conversion failed: {res:?}")))
        }
    }
}
