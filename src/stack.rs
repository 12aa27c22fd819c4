use std::sync::Arc;

use log::info;

use crate::{
    devices::DeviceRegistry,
    interrupt::{InterruptController, INTR_IRQ_SOFT},
    protocols::ProtocolRegistry,
};

/// One process-lifetime instance of the stack: the interrupt controller, the
/// device list and the protocol table, each lock-guarded and owned here
/// rather than living in ambient globals.
pub struct NetStack {
    pub intr: Arc<InterruptController>,
    pub devices: Arc<DeviceRegistry>,
    pub protocols: Arc<ProtocolRegistry>,
}

impl NetStack {
    /// Builds the registries and hooks the protocol drain onto the soft IRQ,
    /// so frames queued by device ISRs are handled in a later dispatch pass.
    pub fn new() -> anyhow::Result<Arc<Self>> {
        let intr = Arc::new(InterruptController::new());
        let devices = Arc::new(DeviceRegistry::new());
        let protocols = Arc::new(ProtocolRegistry::new(intr.clone()));

        let drain_protocols = protocols.clone();
        intr.request_irq(
            INTR_IRQ_SOFT,
            0,
            "softnet",
            Arc::new(move |_| {
                drain_protocols.drain();
                Ok(())
            }),
        )?;

        info!("initialized");
        Ok(Arc::new(NetStack {
            intr,
            devices,
            protocols,
        }))
    }

    /// Starts the dispatch thread (blocking until it listens), then opens
    /// every registered device.
    pub fn run(&self) -> anyhow::Result<()> {
        self.intr.run()?;
        self.devices.run_all()?;
        info!("running");
        Ok(())
    }

    /// Closes all devices (close failures are logged, not fatal), then stops
    /// and joins the dispatch thread.
    pub fn shutdown(&self) {
        self.devices.shutdown_all();
        self.intr.shutdown();
        info!("shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        thread::sleep,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        devices::loopback,
        interrupt::IntrError,
        protocols::NET_PROTOCOL_TYPE_IP,
    };

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn loopback_frame_travels_up_to_the_registered_protocol() {
        let stack = NetStack::new().unwrap();
        let dev = loopback::init(&stack).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        stack
            .protocols
            .register(
                NET_PROTOCOL_TYPE_IP,
                Arc::new(move |data, dev| {
                    sink.lock().unwrap().push((data.to_vec(), dev.name.clone()));
                    Ok(())
                }),
            )
            .unwrap();

        stack.run().unwrap();
        dev.output(NET_PROTOCOL_TYPE_IP, &[0xde, 0xad, 0xbe, 0xef], None)
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || !received
            .lock()
            .unwrap()
            .is_empty()));
        stack.shutdown();

        assert_eq!(
            *received.lock().unwrap(),
            vec![(vec![0xde, 0xad, 0xbe, 0xef], "net0".to_string())]
        );
    }

    #[test]
    fn unregistered_protocol_does_not_fail_the_sender() {
        let stack = NetStack::new().unwrap();
        let dev = loopback::init(&stack).unwrap();
        stack.run().unwrap();

        // No protocol registered for 0x0800: the frame is dropped on the
        // receive side while the transmit still succeeds.
        dev.output(NET_PROTOCOL_TYPE_IP, &[0xde, 0xad, 0xbe, 0xef], None)
            .unwrap();
        stack.shutdown();
    }

    #[test]
    fn shutdown_stops_the_dispatcher_for_good() {
        let stack = NetStack::new().unwrap();
        let dev = loopback::init(&stack).unwrap();
        stack.run().unwrap();
        stack.shutdown();

        assert!(!dev.is_up());
        let err = stack.intr.raise_irq(INTR_IRQ_SOFT).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IntrError>(),
            Some(IntrError::NotRunning)
        ));
    }
}
