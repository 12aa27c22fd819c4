pub mod dummy;
pub mod loopback;

use std::sync::{
    atomic::{AtomicU16, Ordering},
    Arc, Mutex,
};

use anyhow::Context;
use log::{debug, error, info};

use crate::utils::hexdump;

pub const NET_DEVICE_FLAG_UP: u16 = 0x0001;
pub const NET_DEVICE_FLAG_LOOPBACK: u16 = 0x0010;
pub const NET_DEVICE_FLAG_BROADCAST: u16 = 0x0020;
pub const NET_DEVICE_FLAG_P2P: u16 = 0x0040;
pub const NET_DEVICE_FLAG_NEED_ARP: u16 = 0x0100;

pub const NET_DEVICE_ADDR_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device is already up, dev: {0}")]
    AlreadyOpen(String),
    #[error("device is not up, dev: {0}")]
    NotOpen(String),
    #[error("too long packet, dev: {dev}, mtu: {mtu}, len: {len}")]
    TooLong { dev: String, mtu: usize, len: usize },
    #[error("transmit queue is full, dev: {0}")]
    QueueFull(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetDeviceType {
    Dummy,
    Loopback,
}

#[derive(Clone, Debug)]
pub enum CastType {
    Peer([u8; NET_DEVICE_ADDR_LEN]),
    Broadcast([u8; NET_DEVICE_ADDR_LEN]),
}

/// Per-driver private state. A tagged enum instead of an opaque pointer, so
/// drivers get their state back without downcasts.
pub enum DriverState {
    Dummy(dummy::Dummy),
    Loopback(loopback::Loopback),
}

#[derive(Clone, Debug)]
pub struct NetDeviceOps {
    pub open: Option<fn(dev: &NetDevice) -> anyhow::Result<()>>,
    pub close: Option<fn(dev: &NetDevice) -> anyhow::Result<()>>,
    pub transmit: fn(
        dev: &NetDevice,
        ty: u16,
        data: &[u8],
        dst: Option<[u8; NET_DEVICE_ADDR_LEN]>,
    ) -> anyhow::Result<()>,
}

pub struct NetDevice {
    pub index: usize,
    pub name: String,
    pub ty: NetDeviceType,
    pub mtu: usize,
    // Only the UP bit ever changes after registration.
    pub flags: AtomicU16,
    pub header_len: u16,
    pub addr_len: u16,
    pub hw_addr: [u8; NET_DEVICE_ADDR_LEN],
    pub cast_type: CastType,
    pub ops: NetDeviceOps,
    pub driver: DriverState,
}

impl NetDevice {
    pub fn is_up(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & NET_DEVICE_FLAG_UP != 0
    }

    fn state(&self) -> &'static str {
        if self.is_up() {
            "up"
        } else {
            "down"
        }
    }

    pub fn open(&self) -> anyhow::Result<()> {
        if self.is_up() {
            return Err(DeviceError::AlreadyOpen(self.name.clone()).into());
        }
        if let Some(open) = self.ops.open {
            open(self).with_context(|| format!("driver open failure, dev: {}", self.name))?;
        }
        self.flags.fetch_or(NET_DEVICE_FLAG_UP, Ordering::SeqCst);
        info!("opened device, dev: {}, state: {}", self.name, self.state());
        Ok(())
    }

    pub fn close(&self) -> anyhow::Result<()> {
        if !self.is_up() {
            return Err(DeviceError::NotOpen(self.name.clone()).into());
        }
        if let Some(close) = self.ops.close {
            close(self).with_context(|| format!("driver close failure, dev: {}", self.name))?;
        }
        self.flags
            .fetch_and(!NET_DEVICE_FLAG_UP, Ordering::SeqCst);
        info!("closed device, dev: {}, state: {}", self.name, self.state());
        Ok(())
    }

    /// Hands a frame to the driver's top half. Fails without reaching the
    /// driver when the device is down or the payload exceeds the MTU.
    #[tracing::instrument(skip_all)]
    pub fn output(
        &self,
        ty: u16,
        data: &[u8],
        dst: Option<[u8; NET_DEVICE_ADDR_LEN]>,
    ) -> anyhow::Result<()> {
        if !self.is_up() {
            return Err(DeviceError::NotOpen(self.name.clone()).into());
        }
        if data.len() > self.mtu {
            return Err(DeviceError::TooLong {
                dev: self.name.clone(),
                mtu: self.mtu,
                len: data.len(),
            }
            .into());
        }
        debug!(
            "output packet, dev: {}, type: 0x{:04x}, len: {}",
            self.name,
            ty,
            data.len()
        );
        debug!("data:\n{}", hexdump(data));
        (self.ops.transmit)(self, ty, data, dst)
            .with_context(|| format!("transmit failure, dev: {}", self.name))
    }
}

struct RegistryInner {
    devices: Vec<Arc<NetDevice>>,
    next_index: usize,
}

/// Process-lifetime list of network devices. Devices are linked at
/// registration and never removed.
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            inner: Mutex::new(RegistryInner {
                devices: Vec::new(),
                next_index: 0,
            }),
        }
    }

    /// Assigns the next index and the `net<index>` name, then links the
    /// device and returns the shared handle.
    /// NOTE: Must not be called after `NetStack::run`.
    pub fn register(&self, mut dev: NetDevice) -> Arc<NetDevice> {
        let mut inner = self.inner.lock().unwrap();
        dev.index = inner.next_index;
        dev.name = format!("net{}", dev.index);
        inner.next_index += 1;
        debug!("registered device, dev: {}, type: {:?}", dev.name, dev.ty);
        let dev = Arc::new(dev);
        inner.devices.push(dev.clone());
        dev
    }

    fn devices(&self) -> Vec<Arc<NetDevice>> {
        self.inner.lock().unwrap().devices.clone()
    }

    /// Opens every device in registration order, aborting on the first
    /// failure.
    pub fn run_all(&self) -> anyhow::Result<()> {
        info!("open all devices");
        for dev in self.devices() {
            dev.open()?;
        }
        Ok(())
    }

    /// Closes every device in registration order. A close failure is logged
    /// and does not keep the remaining devices from closing.
    pub fn shutdown_all(&self) {
        info!("close all devices");
        for dev in self.devices() {
            if let Err(err) = dev.close() {
                error!("failed to close device, dev: {}: {:?}", dev.name, err);
            }
        }
    }
}
