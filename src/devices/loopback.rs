use std::{
    collections::VecDeque,
    sync::{atomic::AtomicU16, Arc, Mutex},
};

use log::debug;

use crate::{
    devices::{
        CastType, DeviceError, DriverState, NetDevice, NetDeviceOps, NetDeviceType,
        NET_DEVICE_ADDR_LEN, NET_DEVICE_FLAG_LOOPBACK,
    },
    interrupt::{InterruptController, INTR_IRQ_LOOPBACK, INTR_IRQ_SHARED},
    protocols::ProtocolRegistry,
    stack::NetStack,
    utils::hexdump,
};

pub const LOOPBACK_MTU: usize = u16::MAX as usize;
pub const LOOPBACK_QUEUE_LIMIT: usize = 16;

struct LoopbackQueueEntry {
    ty: u16,
    data: Vec<u8>,
}

pub struct Loopback {
    irq: i32,
    intr: Arc<InterruptController>,
    queue: Mutex<VecDeque<LoopbackQueueEntry>>,
}

/// Top half: copy the frame into the bounded device queue and notify the
/// bottom half. A full queue drops the frame and surfaces `QueueFull` to the
/// caller; there is no blocking and no retry.
#[tracing::instrument(skip_all)]
fn transmit(
    dev: &NetDevice,
    ty: u16,
    data: &[u8],
    _dst: Option<[u8; NET_DEVICE_ADDR_LEN]>,
) -> anyhow::Result<()> {
    let DriverState::Loopback(lo) = &dev.driver else {
        anyhow::bail!("invalid driver state, dev: {}", dev.name);
    };
    {
        let mut queue = lo.queue.lock().unwrap();
        if queue.len() >= LOOPBACK_QUEUE_LIMIT {
            return Err(DeviceError::QueueFull(dev.name.clone()).into());
        }
        queue.push_back(LoopbackQueueEntry {
            ty,
            data: data.to_vec(),
        });
        debug!(
            "queue pushed, dev: {}, num: {}, type: 0x{:04x}, len: {}",
            dev.name,
            queue.len(),
            ty,
            data.len()
        );
        debug!("data:\n{}", hexdump(data));
    }
    // The queue lock is released before raising so the ISR never contends
    // with its own notification.
    lo.intr.raise_irq(lo.irq)?;
    Ok(())
}

/// Bottom half: drain whatever accumulated since the previous dispatch and
/// hand each frame to the protocol layer. One interrupt may stand for any
/// number of queued frames.
#[tracing::instrument(skip_all)]
pub(crate) fn isr(dev: &Arc<NetDevice>, protocols: &ProtocolRegistry) -> anyhow::Result<()> {
    let DriverState::Loopback(lo) = &dev.driver else {
        anyhow::bail!("invalid driver state, dev: {}", dev.name);
    };
    loop {
        let entry = lo.queue.lock().unwrap().pop_front();
        let Some(entry) = entry else {
            break;
        };
        debug!(
            "queue popped, dev: {}, type: 0x{:04x}, len: {}",
            dev.name,
            entry.ty,
            entry.data.len()
        );
        debug!("data:\n{}", hexdump(&entry.data));
        protocols.input(entry.ty, &entry.data, dev)?;
    }
    Ok(())
}

pub fn device(intr: Arc<InterruptController>) -> NetDevice {
    NetDevice {
        index: 0,
        name: String::new(),
        ty: NetDeviceType::Loopback,
        mtu: LOOPBACK_MTU,
        flags: AtomicU16::new(NET_DEVICE_FLAG_LOOPBACK),
        header_len: 0,
        addr_len: 0,
        hw_addr: [0; NET_DEVICE_ADDR_LEN],
        cast_type: CastType::Peer([0; NET_DEVICE_ADDR_LEN]),
        ops: NetDeviceOps {
            open: None,
            close: None,
            transmit,
        },
        driver: DriverState::Loopback(Loopback {
            irq: INTR_IRQ_LOOPBACK,
            intr,
            queue: Mutex::new(VecDeque::new()),
        }),
    }
}

pub fn init(stack: &NetStack) -> anyhow::Result<Arc<NetDevice>> {
    let dev = stack.devices.register(device(stack.intr.clone()));
    let isr_dev = dev.clone();
    let protocols = stack.protocols.clone();
    stack.intr.request_irq(
        INTR_IRQ_LOOPBACK,
        INTR_IRQ_SHARED,
        &dev.name,
        Arc::new(move |_| isr(&isr_dev, &protocols)),
    )?;
    debug!("initialized loopback device, dev: {}", dev.name);
    Ok(dev)
}
