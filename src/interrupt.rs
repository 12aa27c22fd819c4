use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Barrier, Mutex,
    },
    thread::{self, JoinHandle},
};

use anyhow::Context;
use log::{debug, error, info, warn};

pub const INTR_IRQ_SHARED: u8 = 0x01;

// IRQ numbers keep their traditional values in the real-time signal range
// even though delivery goes through a channel rather than the kernel.
pub const INTR_IRQ_BASE: i32 = 35; // SIGRTMIN + 1
pub const INTR_IRQ_DUMMY: i32 = INTR_IRQ_BASE;
pub const INTR_IRQ_LOOPBACK: i32 = INTR_IRQ_BASE + 1;
pub const INTR_IRQ_SOFT: i32 = INTR_IRQ_BASE + 2;

#[derive(Debug, thiserror::Error)]
pub enum IntrError {
    #[error("irq {0} conflicts with an already registered entry")]
    Conflict(i32),
    #[error("interrupt dispatcher is not running")]
    NotRunning,
}

/// Handler invoked by the dispatch thread. The owner's context (device handle,
/// protocol registry, ...) is captured by the closure.
pub type IrqHandler = Arc<dyn Fn(i32) -> anyhow::Result<()> + Send + Sync>;

pub struct IrqEntry {
    pub irq: i32,
    pub flags: u8,
    pub name: String,
    handler: IrqHandler,
}

enum InterruptMessage {
    Irq(i32),
    Terminate,
}

struct Dispatcher {
    tx: Sender<InterruptMessage>,
    thread: JoinHandle<()>,
}

/// Emulates a NIC interrupt controller in user space. `raise_irq` stands in
/// for signal delivery: raised IRQ numbers travel over a channel to one
/// dedicated dispatch thread, which is the only invoker of registered
/// handlers, so no two handlers ever run concurrently.
pub struct InterruptController {
    irqs: Arc<Mutex<Vec<IrqEntry>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl InterruptController {
    pub fn new() -> Self {
        InterruptController {
            irqs: Arc::new(Mutex::new(Vec::new())),
            dispatcher: Mutex::new(None),
        }
    }

    /// Registers a handler for `irq`. An IRQ number may be reused only when
    /// every registration on it sets `INTR_IRQ_SHARED`. Entries are immutable
    /// once linked; there is no unregister.
    pub fn request_irq(
        &self,
        irq: i32,
        flags: u8,
        name: &str,
        handler: IrqHandler,
    ) -> anyhow::Result<()> {
        let mut irqs = self.irqs.lock().unwrap();
        for entry in irqs.iter() {
            if entry.irq == irq
                && (entry.flags & INTR_IRQ_SHARED == 0 || flags & INTR_IRQ_SHARED == 0)
            {
                return Err(IntrError::Conflict(irq).into());
            }
        }
        irqs.push(IrqEntry {
            irq,
            flags,
            name: name.to_string(),
            handler,
        });
        debug!("registered irq, irq: {}, name: {}", irq, name);
        Ok(())
    }

    /// Spawns the dispatch thread and blocks until it is listening, so an IRQ
    /// raised right after `run` returns cannot be lost.
    pub fn run(&self) -> anyhow::Result<()> {
        let mut dispatcher = self.dispatcher.lock().unwrap();
        if dispatcher.is_some() {
            anyhow::bail!("interrupt dispatcher is already running");
        }

        let (tx, rx) = mpsc::channel();
        let barrier = Arc::new(Barrier::new(2));
        let thread_barrier = barrier.clone();
        let irqs = self.irqs.clone();
        let thread = thread::Builder::new()
            .name("softirq".to_string())
            .spawn(move || dispatch_loop(irqs, rx, thread_barrier))
            .context("failed to spawn interrupt dispatch thread")?;
        *dispatcher = Some(Dispatcher { tx, thread });
        drop(dispatcher);

        barrier.wait();
        Ok(())
    }

    /// Delivers `irq` to the dispatch thread. Fire-and-forget: the caller is
    /// decoupled from handler invocation. Callable from any thread, including
    /// from inside a running handler.
    pub fn raise_irq(&self, irq: i32) -> anyhow::Result<()> {
        let dispatcher = self.dispatcher.lock().unwrap();
        let Some(dispatcher) = dispatcher.as_ref() else {
            return Err(IntrError::NotRunning.into());
        };
        dispatcher
            .tx
            .send(InterruptMessage::Irq(irq))
            .map_err(|_| IntrError::NotRunning)?;
        Ok(())
    }

    /// Stops the dispatch thread and joins it. IRQs already raised are still
    /// dispatched before the terminate message is seen. No-op when the
    /// dispatcher was never started.
    pub fn shutdown(&self) {
        let Some(dispatcher) = self.dispatcher.lock().unwrap().take() else {
            return;
        };
        let _ = dispatcher.tx.send(InterruptMessage::Terminate);
        if dispatcher.thread.join().is_err() {
            error!("interrupt dispatch thread panicked");
        }
    }
}

fn dispatch_loop(
    irqs: Arc<Mutex<Vec<IrqEntry>>>,
    rx: Receiver<InterruptMessage>,
    barrier: Arc<Barrier>,
) {
    info!("interrupt dispatcher started");
    barrier.wait();

    while let Ok(InterruptMessage::Irq(irq)) = rx.recv() {
        // Snapshot the matching handlers so the table lock is not held while
        // handler code runs; a handler may re-enter the controller.
        let handlers: Vec<(String, IrqHandler)> = irqs
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.irq == irq)
            .map(|entry| (entry.name.clone(), entry.handler.clone()))
            .collect();
        if handlers.is_empty() {
            warn!("spurious interrupt, irq: {}", irq);
            continue;
        }
        for (name, handler) in handlers {
            debug!("dispatch irq, irq: {}, name: {}", irq, name);
            if let Err(err) = handler(irq) {
                error!("irq handler failed, irq: {}, name: {}: {:?}", irq, name, err);
            }
        }
    }
    info!("interrupt dispatcher terminated");
}
