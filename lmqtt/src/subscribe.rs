use async_trait::async_trait;
use itertools::Itertools;

use crate::codec::types::QoS;
use crate::net::ClientId;
use crate::topic::is_match;
use crate::types::{DashMap, DashSet, TopicFilter};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: ClientId,
    pub topic_filter: TopicFilter,
    pub qos: QoS,
}

/// Topic filter to subscriber associations.
#[async_trait]
pub trait SubscriptionManager: Sync + Send {
    async fn subscribe(&self, client_id: &ClientId, topic_filter: &TopicFilter, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, client_id: &str, topic_filter: &str) -> Result<()>;

    ///Drops every subscription of the client.
    async fn remove(&self, client_id: &str) -> Result<()>;

    ///All subscriptions matching a topic name. A client may appear more than once when
    ///several of its filters match.
    async fn search(&self, topic: &str) -> Result<Vec<Subscriber>>;
}

#[derive(Default)]
pub struct DefaultSubscriptionManager {
    filters: DashMap<TopicFilter, DashMap<ClientId, QoS>>,
    clients: DashMap<ClientId, DashSet<TopicFilter>>,
}

impl DefaultSubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn filters_count(&self) -> usize {
        self.filters.len()
    }

    #[inline]
    fn unsubscribe_filter(&self, client_id: &str, topic_filter: &str) {
        self.filters.remove_if(topic_filter, |_, subs| {
            subs.remove(client_id);
            subs.is_empty()
        });
    }
}

#[async_trait]
impl SubscriptionManager for DefaultSubscriptionManager {
    async fn subscribe(&self, client_id: &ClientId, topic_filter: &TopicFilter, qos: QoS) -> Result<()> {
        self.filters.entry(topic_filter.clone()).or_default().insert(client_id.clone(), qos);
        self.clients.entry(client_id.clone()).or_default().insert(topic_filter.clone());
        Ok(())
    }

    async fn unsubscribe(&self, client_id: &str, topic_filter: &str) -> Result<()> {
        self.unsubscribe_filter(client_id, topic_filter);
        self.clients.remove_if(client_id, |_, filters| {
            filters.remove(topic_filter);
            filters.is_empty()
        });
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<()> {
        if let Some((_, filters)) = self.clients.remove(client_id) {
            for topic_filter in filters {
                self.unsubscribe_filter(client_id, &topic_filter);
            }
        }
        Ok(())
    }

    async fn search(&self, topic: &str) -> Result<Vec<Subscriber>> {
        let matched = self
            .filters
            .iter()
            .filter(|entry| is_match(entry.key(), topic))
            .flat_map(|entry| {
                let topic_filter = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(|sub| Subscriber {
                        client_id: sub.key().clone(),
                        topic_filter: topic_filter.clone(),
                        qos: *sub.value(),
                    })
                    .collect_vec()
            })
            .collect_vec();
        Ok(matched)
    }
}
