use std::{
    sync::{mpsc, Arc},
    thread::{sleep, JoinHandle},
    time::Duration,
};

use log::{error, info};

use crate::{devices::NetDevice, protocols::NET_PROTOCOL_TYPE_IP, stack::NetStack};

// Sample IP datagram: ICMP echo request from 127.0.0.1 to 127.0.0.1.
const TEST_DATA: [u8; 48] = [
    0x45, 0x00, 0x00, 0x30, 0x00, 0x80, 0x00, 0x00, 0xff, 0x01, 0xbd, 0x4a, 0x7f, 0x00, 0x00,
    0x01, 0x7f, 0x00, 0x00, 0x01, 0x08, 0x00, 0x35, 0x64, 0x00, 0x80, 0x00, 0x01, 0x31, 0x32,
    0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x30, 0x21, 0x40, 0x23, 0x24, 0x25, 0x5e, 0x26,
    0x2a, 0x28, 0x29,
];

pub struct App {
    stack: Arc<NetStack>,
    dev: Arc<NetDevice>,
}

impl App {
    pub fn new(stack: Arc<NetStack>, dev: Arc<NetDevice>) -> Self {
        App { stack, dev }
    }

    /// Transmits the test datagram once a second until a message arrives on
    /// `rx` or the stack refuses the frame.
    pub fn run(&self, rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let dev = self.dev.clone();
        info!("running app");
        std::thread::spawn(move || {
            while rx.try_recv().is_err() {
                if let Err(err) = dev.output(NET_PROTOCOL_TYPE_IP, &TEST_DATA, None) {
                    error!("transmit packet failed: {:?}", err);
                    break;
                }
                sleep(Duration::from_secs(1));
            }
        })
    }

    pub fn stop(&self) {
        info!("stopping app");
        self.stack.shutdown();
    }
}
