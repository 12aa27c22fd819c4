use std::sync::Arc;

use log::debug;

use crate::{
    devices::NetDevice,
    protocols::NET_PROTOCOL_TYPE_IP,
    stack::NetStack,
    utils::hexdump,
};

/// Stub input handler: real header parsing lives above this layer, so
/// received datagrams are only inspected and logged.
pub fn input(data: &[u8], dev: &Arc<NetDevice>) -> anyhow::Result<()> {
    debug!("ip input, dev: {}, len: {}", dev.name, data.len());
    debug!("data:\n{}", hexdump(data));
    Ok(())
}

pub fn init(stack: &NetStack) -> anyhow::Result<()> {
    stack
        .protocols
        .register(NET_PROTOCOL_TYPE_IP, Arc::new(input))
}
