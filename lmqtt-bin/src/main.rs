#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

use lmqtt::net::BufferAllocator;
use lmqtt::server::MqttServerCreator;
use lmqtt::subscribe::DefaultSubscriptionManager;
use lmqtt_conf::{Allocator, Listener, Options, Settings};

use crate::logger::logger_init;

mod logger;

#[tokio::main]
async fn main() -> Result<()> {
    //init config
    let settings = Settings::init(Options::from_args())?;

    //init log
    let _guard = logger_init(&settings.log)?;

    Settings::logs();

    let server = creator(&settings.listener)
        .task_exec(settings.task.exec_workers, settings.task.exec_queue_max)
        .start()
        .await
        .inspect_err(|e| log::error!("{} start failed, {:?}", settings.listener.name, e))?;

    tokio::signal::ctrl_c().await?;
    log::info!("{} received ctrl-c, stopping", settings.listener.name);
    server.stop().await;
    Ok(())
}

fn creator(listen_cfg: &Listener) -> MqttServerCreator {
    let allocator = match listen_cfg.buffer_allocator {
        Allocator::Heap => BufferAllocator::Heap,
        Allocator::Direct => BufferAllocator::Direct,
    };

    let mut creator = MqttServerCreator::new()
        .name(listen_cfg.name.as_str())
        .ip(listen_cfg.ip.as_str())
        .port(listen_cfg.port)
        .heartbeat_timeout(listen_cfg.heartbeat_timeout)
        .buffer_allocator(allocator)
        .read_buffer_size(listen_cfg.read_buffer_size.as_usize())
        .max_packet_size(listen_cfg.max_packet_size.as_u32())
        .sub_manager(Arc::new(DefaultSubscriptionManager::new()))
        .debug(listen_cfg.debug);

    if let Some(tls) = listen_cfg.tls.as_ref() {
        creator = creator.use_tls_files(tls.cert.as_str(), tls.key.as_str(), tls.client_ca.as_deref());
    }
    creator
}
