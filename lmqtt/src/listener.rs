//! Connection lifecycle listener
//!
//! Reacts to transport events for every MQTT connection. The important one is
//! [`MqttServerListener::on_before_close`], which runs exactly once per connection and
//! releases everything the broker holds for the departing client:
//!
//! 1. connections that carried an HTTP request are skipped,
//! 2. an abnormal close (no DISCONNECT, or an error cause) publishes and clears the will,
//! 3. the session, the subscriptions and the in-flight state are removed,
//! 4. the offline notification is queued on the task executor.
//!
//! Each release step is isolated, a failing or panicking step is logged and the remaining
//! steps still run.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::dispatcher::MessageDispatcher;
use crate::event::ConnectStatusListener;
use crate::executor::TaskExecutor;
use crate::interceptor::MessageInterceptors;
use crate::net::{is_io_error, panic_message, ClientId, ConnectionContext, Packet, ServerListener};
use crate::publish::PublishManager;
use crate::session::SessionManager;
use crate::store::MessageStore;
use crate::subscribe::SubscriptionManager;
use crate::Result;

/// Result of one isolated release step.
#[derive(Debug)]
pub enum StepOutcome {
    Ok,
    Failed(anyhow::Error),
    Panicked(String),
}

impl StepOutcome {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok)
    }
}

async fn step<F>(name: &'static str, client_id: &str, fut: F) -> StepOutcome
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => StepOutcome::Ok,
        Ok(Err(e)) => {
            log::error!("Mqtt server clientId:{} {} error, {:?}", client_id, name, e);
            StepOutcome::Failed(e)
        }
        Err(e) => {
            let msg = panic_message(e.as_ref());
            log::error!("Mqtt server clientId:{} {} panicked, {}", client_id, name, msg);
            StepOutcome::Panicked(msg)
        }
    }
}

#[inline]
fn failed_steps(outcomes: &[(&'static str, StepOutcome)]) -> Vec<&'static str> {
    outcomes.iter().filter(|(_, o)| !o.is_ok()).map(|(name, _)| *name).collect()
}

pub struct MqttServerListener {
    session_manager: Arc<dyn SessionManager>,
    sub_manager: Arc<dyn SubscriptionManager>,
    publish_manager: Arc<dyn PublishManager>,
    message_store: Arc<dyn MessageStore>,
    dispatcher: Arc<dyn MessageDispatcher>,
    connect_status_listener: Arc<dyn ConnectStatusListener>,
    interceptors: MessageInterceptors,
    executor: Arc<TaskExecutor>,
}

impl MqttServerListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_manager: Arc<dyn SessionManager>,
        sub_manager: Arc<dyn SubscriptionManager>,
        publish_manager: Arc<dyn PublishManager>,
        message_store: Arc<dyn MessageStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        connect_status_listener: Arc<dyn ConnectStatusListener>,
        interceptors: MessageInterceptors,
        executor: Arc<TaskExecutor>,
    ) -> Self {
        Self {
            session_manager,
            sub_manager,
            publish_manager,
            message_store,
            dispatcher,
            connect_status_listener,
            interceptors,
            executor,
        }
    }

    async fn send_will_message(&self, client_id: &str) -> Result<()> {
        let Some(will) = self.message_store.get_will_message(client_id).await? else {
            return Ok(());
        };
        let result = self.dispatcher.send(will).await?;
        log::debug!("Mqtt server clientId:{} send willMessage result:{}", client_id, result);
        Ok(())
    }

    /// Runs every release step for `client_id`, in order, without early exit.
    async fn release(&self, client_id: &ClientId, abnormal: bool) -> Vec<(&'static str, StepOutcome)> {
        let mut outcomes = Vec::with_capacity(5);
        if abnormal {
            outcomes.push(("send will", step("send will", client_id, self.send_will_message(client_id)).await));
            outcomes.push((
                "clear will",
                step("clear will", client_id, self.message_store.clear_will_message(client_id)).await,
            ));
        }
        outcomes.push((
            "remove session",
            step("remove session", client_id, self.session_manager.remove(client_id)).await,
        ));
        outcomes.push((
            "remove subscriptions",
            step("remove subscriptions", client_id, self.sub_manager.remove(client_id)).await,
        ));
        outcomes.push((
            "remove inflight",
            step("remove inflight", client_id, async {
                self.publish_manager.remove(client_id).await;
                Ok(())
            })
            .await,
        ));
        outcomes
    }

    async fn notify_offline(&self, ctx: &ConnectionContext, client_id: ClientId, remark: &str) {
        let username = ctx.update_state(|s| {
            s.graceful_disconnect = false;
            s.username.take()
        });
        let listener = self.connect_status_listener.clone();
        let (ctx1, cid, remark) = (ctx.clone(), client_id.clone(), remark.to_owned());
        if let Err(e) = self
            .executor
            .execute("offline", async move {
                listener.offline(&ctx1, &cid, username.as_ref(), &remark).await;
            })
            .await
        {
            log::error!("Mqtt server clientId:{} offline notify error, {}", client_id, e);
        }
    }
}

#[async_trait]
impl ServerListener for MqttServerListener {
    async fn on_heartbeat_timeout(&self, ctx: &ConnectionContext, interval: Duration, count: usize) -> bool {
        log::info!(
            "Mqtt HeartbeatTimeout clientId:{:?} interval:{:?} count:{}",
            ctx.client_id(),
            interval,
            count
        );
        false
    }

    async fn on_before_close(
        &self,
        ctx: &ConnectionContext,
        cause: Option<&anyhow::Error>,
        remark: &str,
        is_remove: bool,
    ) {
        if ctx.is_http() {
            ctx.set_http(false);
            return;
        }

        let state = ctx.state();
        let client_id = state.client_id;
        let abnormal = !state.graceful_disconnect || cause.is_some();
        if abnormal {
            match cause {
                Some(e) if is_io_error(e) => log::error!(
                    "Mqtt server close clientId:{:?}, remark:{} isRemove:{} error:{}",
                    client_id,
                    remark,
                    is_remove,
                    e
                ),
                Some(e) => log::error!(
                    "Mqtt server close clientId:{:?}, remark:{} isRemove:{} error:{:?}",
                    client_id,
                    remark,
                    is_remove,
                    e
                ),
                None => log::error!(
                    "Mqtt server close clientId:{:?}, remark:{} isRemove:{}",
                    client_id,
                    remark,
                    is_remove
                ),
            }
        } else {
            log::info!("Mqtt server close clientId:{:?} remark:{} isRemove:{}", client_id, remark, is_remove);
        }

        let Some(client_id) = client_id.filter(|c| !c.trim().is_empty()) else {
            return;
        };

        let failed = failed_steps(&self.release(&client_id, abnormal).await);
        if !failed.is_empty() {
            log::warn!("Mqtt server clientId:{} release finished with failed steps: {:?}", client_id, failed);
        }
        self.notify_offline(ctx, client_id, remark).await;
    }

    async fn on_after_sent(&self, ctx: &ConnectionContext, _packet: &Packet, _is_sent_success: bool) {
        if ctx.is_http() {
            ctx.close("http response sent");
        }
    }

    async fn on_after_received_bytes(&self, ctx: &ConnectionContext, received_bytes: usize) -> Result<()> {
        self.interceptors.on_after_received_bytes(ctx, received_bytes).await
    }

    async fn on_after_decoded(&self, ctx: &ConnectionContext, packet: &Packet, packet_size: usize) -> Result<()> {
        match packet.as_mqtt() {
            Some(packet) => self.interceptors.on_after_decoded(ctx, packet, packet_size).await,
            None => Ok(()),
        }
    }

    async fn on_after_handled(&self, ctx: &ConnectionContext, packet: &Packet, cost: Duration) -> Result<()> {
        match packet.as_mqtt() {
            Some(packet) => self.interceptors.on_after_handled(ctx, packet, cost).await,
            None => Ok(()),
        }
    }
}
