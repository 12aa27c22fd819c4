pub mod ipv4;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use log::{debug, error, info, warn};

use crate::{
    devices::NetDevice,
    interrupt::{InterruptController, INTR_IRQ_SOFT},
    utils::hexdump,
};

pub const NET_PROTOCOL_TYPE_IP: u16 = 0x0800;
pub const NET_PROTOCOL_TYPE_ARP: u16 = 0x0806;
pub const NET_PROTOCOL_TYPE_IPV6: u16 = 0x86dd;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol is already registered, type: 0x{0:04x}")]
    AlreadyRegistered(u16),
}

pub type ProtocolHandler =
    Arc<dyn Fn(&[u8], &Arc<NetDevice>) -> anyhow::Result<()> + Send + Sync>;

pub struct NetProtocolQueueEntry {
    pub dev: Arc<NetDevice>,
    pub data: Vec<u8>,
}

pub struct NetProtocol {
    pub ty: u16,
    queue: Mutex<VecDeque<NetProtocolQueueEntry>>,
    handler: ProtocolHandler,
}

/// Type-keyed table of inbound protocol handlers, each with its own queue.
/// Device ISRs push through `input`; the dispatch thread empties the queues
/// through `drain` when the soft IRQ fires.
pub struct ProtocolRegistry {
    protocols: Mutex<Vec<Arc<NetProtocol>>>,
    intr: Arc<InterruptController>,
}

impl ProtocolRegistry {
    pub fn new(intr: Arc<InterruptController>) -> Self {
        ProtocolRegistry {
            protocols: Mutex::new(Vec::new()),
            intr,
        }
    }

    /// At most one handler per type tag; duplicates are rejected and leave
    /// the existing registration untouched.
    pub fn register(&self, ty: u16, handler: ProtocolHandler) -> anyhow::Result<()> {
        let mut protocols = self.protocols.lock().unwrap();
        if protocols.iter().any(|proto| proto.ty == ty) {
            return Err(ProtocolError::AlreadyRegistered(ty).into());
        }
        protocols.push(Arc::new(NetProtocol {
            ty,
            queue: Mutex::new(VecDeque::new()),
            handler,
        }));
        info!("registered protocol, type: 0x{:04x}", ty);
        Ok(())
    }

    /// Queues a received frame for the protocol registered on `ty`. A frame
    /// for an unregistered type is dropped with a diagnostic; that is the
    /// expected fate of unsupported EtherTypes, not an error.
    #[tracing::instrument(skip_all)]
    pub fn input(&self, ty: u16, data: &[u8], dev: &Arc<NetDevice>) -> anyhow::Result<()> {
        let proto = self
            .protocols
            .lock()
            .unwrap()
            .iter()
            .find(|proto| proto.ty == ty)
            .cloned();
        let Some(proto) = proto else {
            warn!("unsupported protocol, type: 0x{:04x}, dev: {}", ty, dev.name);
            return Ok(());
        };
        {
            let mut queue = proto.queue.lock().unwrap();
            queue.push_back(NetProtocolQueueEntry {
                dev: dev.clone(),
                data: data.to_vec(),
            });
            debug!(
                "protocol queue pushed, type: 0x{:04x}, dev: {}, num: {}, len: {}",
                ty,
                dev.name,
                queue.len(),
                data.len()
            );
        }
        debug!("data:\n{}", hexdump(data));
        // Defer handler invocation to the dispatch thread. Without a running
        // dispatcher the entry just stays queued until drained explicitly.
        if let Err(err) = self.intr.raise_irq(INTR_IRQ_SOFT) {
            debug!("soft irq not raised: {}", err);
        }
        Ok(())
    }

    /// Empties every protocol queue, invoking the owning handler entry by
    /// entry. A handler failure is logged and does not stop the drain.
    #[tracing::instrument(skip_all)]
    pub fn drain(&self) {
        let protocols: Vec<Arc<NetProtocol>> = self.protocols.lock().unwrap().clone();
        for proto in protocols {
            loop {
                let entry = proto.queue.lock().unwrap().pop_front();
                let Some(entry) = entry else {
                    break;
                };
                debug!(
                    "protocol queue popped, type: 0x{:04x}, dev: {}, len: {}",
                    proto.ty,
                    entry.dev.name,
                    entry.data.len()
                );
                if let Err(err) = (proto.handler)(&entry.data, &entry.dev) {
                    error!(
                        "protocol handler failed, type: 0x{:04x}: {:?}",
                        proto.ty, err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{dummy, DeviceRegistry};

    fn fixture() -> (ProtocolRegistry, Arc<NetDevice>) {
        let intr = Arc::new(InterruptController::new());
        let registry = DeviceRegistry::new();
        let dev = registry.register(dummy::device(intr.clone()));
        (ProtocolRegistry::new(intr), dev)
    }

    #[test]
    fn duplicate_registration_keeps_the_original_handler() {
        let (protocols, dev) = fixture();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        protocols
            .register(
                NET_PROTOCOL_TYPE_IP,
                Arc::new(move |data, _| {
                    sink.lock().unwrap().push(data.to_vec());
                    Ok(())
                }),
            )
            .unwrap();

        let err = protocols
            .register(NET_PROTOCOL_TYPE_IP, Arc::new(|_, _| Ok(())))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::AlreadyRegistered(NET_PROTOCOL_TYPE_IP))
        ));

        protocols
            .input(NET_PROTOCOL_TYPE_IP, &[0xab], &dev)
            .unwrap();
        protocols.drain();
        assert_eq!(*received.lock().unwrap(), vec![vec![0xab]]);
    }

    #[test]
    fn input_for_an_unregistered_type_is_dropped_silently() {
        let (protocols, dev) = fixture();
        protocols
            .input(NET_PROTOCOL_TYPE_IPV6, &[0x01, 0x02], &dev)
            .unwrap();
        // Nothing registered, nothing to drain, no error surfaced.
        protocols.drain();
    }

    #[test]
    fn drain_delivers_payload_and_source_device() {
        let (protocols, dev) = fixture();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        protocols
            .register(
                NET_PROTOCOL_TYPE_ARP,
                Arc::new(move |data, dev| {
                    sink.lock().unwrap().push((data.to_vec(), dev.name.clone()));
                    Ok(())
                }),
            )
            .unwrap();

        protocols
            .input(NET_PROTOCOL_TYPE_ARP, &[0x0a, 0x0b], &dev)
            .unwrap();
        protocols.drain();

        assert_eq!(
            *received.lock().unwrap(),
            vec![(vec![0x0a, 0x0b], "net0".to_string())]
        );
    }

    #[test]
    fn failing_handler_does_not_stop_the_drain() {
        let (protocols, dev) = fixture();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        protocols
            .register(NET_PROTOCOL_TYPE_IP, Arc::new(|_, _| anyhow::bail!("parse error")))
            .unwrap();
        protocols
            .register(
                NET_PROTOCOL_TYPE_ARP,
                Arc::new(move |data, _| {
                    sink.lock().unwrap().push(data.to_vec());
                    Ok(())
                }),
            )
            .unwrap();

        protocols.input(NET_PROTOCOL_TYPE_IP, &[0x01], &dev).unwrap();
        protocols.input(NET_PROTOCOL_TYPE_ARP, &[0x02], &dev).unwrap();
        protocols.drain();

        assert_eq!(*received.lock().unwrap(), vec![vec![0x02]]);
    }
}
