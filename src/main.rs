use std::sync::mpsc;

use app::App;
use log::{error, info};
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};
use stack::NetStack;
use tracing_subscriber::EnvFilter;

mod app;
mod devices;
mod interrupt;
mod protocols;
mod stack;
mod utils;

fn init_tracing() -> anyhow::Result<()> {
    tracing_log::LogTracer::init()?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() {
    if let Err(err) = init_tracing() {
        eprintln!("failed to initialize tracing: {:?}", err);
        return;
    }

    let stack = match NetStack::new() {
        Ok(stack) => stack,
        Err(err) => {
            error!("init net failed: {:?}", err);
            return;
        }
    };
    if let Err(err) = devices::dummy::init(&stack) {
        error!("init dummy device failed: {:?}", err);
        return;
    }
    let loopback = match devices::loopback::init(&stack) {
        Ok(dev) => dev,
        Err(err) => {
            error!("init loopback device failed: {:?}", err);
            return;
        }
    };
    if let Err(err) = protocols::ipv4::init(&stack) {
        error!("init ip failed: {:?}", err);
        return;
    }
    if let Err(err) = stack.run() {
        error!("run net failed: {:?}", err);
        return;
    }

    let (tx, rx) = mpsc::channel();
    let app = App::new(stack.clone(), loopback);
    let app_join = app.run(rx);

    let mut signals = Signals::new(TERM_SIGNALS).unwrap();
    let handle = signals.handle();
    if let Some(signal) = signals.forever().next() {
        info!("received signal: {}, terminating", signal);
    }

    let _ = tx.send(());
    if app_join.join().is_err() {
        error!("app thread panicked");
    }
    handle.close();
    app.stop();
}
