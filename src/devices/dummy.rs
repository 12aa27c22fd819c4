use std::sync::{
    atomic::AtomicU16,
    Arc,
};

use log::debug;

use crate::{
    devices::{
        CastType, DriverState, NetDevice, NetDeviceOps, NetDeviceType, NET_DEVICE_ADDR_LEN,
    },
    interrupt::{InterruptController, INTR_IRQ_DUMMY, INTR_IRQ_SHARED},
    stack::NetStack,
    utils::hexdump,
};

pub const DUMMY_MTU: usize = u16::MAX as usize;

pub struct Dummy {
    irq: i32,
    intr: Arc<InterruptController>,
}

impl Dummy {
    pub fn new(irq: i32, intr: Arc<InterruptController>) -> Self {
        Dummy { irq, intr }
    }
}

fn transmit(
    dev: &NetDevice,
    ty: u16,
    data: &[u8],
    _dst: Option<[u8; NET_DEVICE_ADDR_LEN]>,
) -> anyhow::Result<()> {
    let DriverState::Dummy(dummy) = &dev.driver else {
        anyhow::bail!("invalid driver state, dev: {}", dev.name);
    };
    debug!(
        "transmit packet, dev: {}, type: 0x{:04x}, len: {}",
        dev.name,
        ty,
        data.len()
    );
    debug!("data:\n{}", hexdump(data));
    // Drop the payload; the interrupt still fires like on real hardware.
    dummy.intr.raise_irq(dummy.irq)?;
    Ok(())
}

fn isr(irq: i32, dev: &NetDevice) -> anyhow::Result<()> {
    debug!("handle interrupt, dev: {}, irq: {}", dev.name, irq);
    Ok(())
}

pub fn device(intr: Arc<InterruptController>) -> NetDevice {
    NetDevice {
        index: 0,
        name: String::new(),
        ty: NetDeviceType::Dummy,
        mtu: DUMMY_MTU,
        flags: AtomicU16::new(0),
        header_len: 0,
        addr_len: 0,
        hw_addr: [0; NET_DEVICE_ADDR_LEN],
        cast_type: CastType::Peer([0; NET_DEVICE_ADDR_LEN]),
        ops: NetDeviceOps {
            open: None,
            close: None,
            transmit,
        },
        driver: DriverState::Dummy(Dummy::new(INTR_IRQ_DUMMY, intr)),
    }
}

pub fn init(stack: &NetStack) -> anyhow::Result<Arc<NetDevice>> {
    let dev = stack.devices.register(device(stack.intr.clone()));
    let isr_dev = dev.clone();
    stack.intr.request_irq(
        INTR_IRQ_DUMMY,
        INTR_IRQ_SHARED,
        &dev.name,
        Arc::new(move |irq| isr(irq, &isr_dev)),
    )?;
    debug!("initialized dummy device, dev: {}", dev.name);
    Ok(dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmit_drops_the_payload_and_raises_its_irq() {
        let stack = NetStack::new().unwrap();
        let dev = init(&stack).unwrap();
        stack.run().unwrap();

        dev.output(0x0800, &[0x01, 0x02, 0x03], None).unwrap();
        // Joining the dispatcher proves the ISR consumed the raise.
        stack.shutdown();
    }

    #[test]
    fn transmit_fails_before_the_dispatcher_runs() {
        let stack = NetStack::new().unwrap();
        let dev = init(&stack).unwrap();
        dev.open().unwrap();

        assert!(dev.output(0x0800, &[0x01], None).is_err());
    }
}
