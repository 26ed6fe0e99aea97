/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! An in-process broker implementing the broker traits.
//!
//! Supports exchanges of every kind, bindings, topic routing, prefetch,
//! ack/nack with requeue, passive queue inspection and heartbeat counting.
//! Failures can be injected, and every channel operation is recorded in an
//! operation log so tests can check what reached the broker and in which
//! order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::common::{topic_matches, BusError, ExchangeKind, ExchangeSettings, QueueSettings, Result};
use crate::message::{Delivery, MessageProperties, OutgoingMessage};
use crate::traits::{BrokerChannel, BrokerClient, BrokerConnection, DeliveryStream};

/// One operation that reached the broker through a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    /// A message was accepted for routing.
    Publish {
        /// Target exchange.
        exchange: String,
        /// Routing key.
        routing_key: String,
        /// Message properties.
        properties: MessageProperties,
        /// Message body.
        body: Vec<u8>,
    },
    /// A delivery was acknowledged.
    Ack {
        /// Delivery tag.
        delivery_tag: u64,
    },
    /// A delivery was rejected.
    Nack {
        /// Delivery tag.
        delivery_tag: u64,
        /// Whether it was put back on its queue.
        requeue: bool,
    },
    /// A consumer was registered.
    Consume {
        /// Queue consumed from.
        queue: String,
    },
    /// The consumers of a channel were cancelled.
    StopConsuming,
}

/// A message waiting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Message properties.
    pub properties: MessageProperties,
    /// Message body.
    pub body: Vec<u8>,
    /// Whether the message was delivered before.
    pub redelivered: bool,
}

#[derive(Debug)]
struct Consumer {
    channel: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

#[derive(Debug)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct Channel {
    connection: u64,
    open: bool,
    prefetch_count: u16,
    unacked: HashMap<u64, (String, QueuedMessage)>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, Channel>,
    connections: HashMap<u64, bool>,
    next_id: u64,
    next_tag: u64,
    ops: Vec<BrokerOp>,
    heartbeats: u64,
    connections_opened: u64,
    failing_connects: u32,
    failing_publishes: bool,
    paused: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel(&self, id: u64) -> Result<&Channel> {
        match self.channels.get(&id) {
            Some(channel) if channel.open && self.connections.get(&channel.connection) == Some(&true) => {
                Ok(channel)
            }
            _ => Err(BusError::ChannelClosed(format!("channel {id} is closed"))),
        }
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut Channel> {
        self.channel(id)?;
        self.channels
            .get_mut(&id)
            .ok_or_else(|| BusError::ChannelClosed(format!("channel {id} is closed")))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }
        let kind = self.exchanges.get(exchange).ok_or_else(|| BusError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason: "no such exchange".to_string(),
        })?;
        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, message: &OutgoingMessage, targets: &[String]) {
        for queue in targets {
            if let Some(queue) = self.queues.get_mut(queue) {
                queue.ready.push_back(QueuedMessage {
                    exchange: message.exchange().to_string(),
                    routing_key: message.routing_key().to_string(),
                    properties: message.properties().clone(),
                    body: message.body().to_vec(),
                    redelivered: false,
                });
            }
        }
    }

    fn publish_all(&mut self, messages: &[OutgoingMessage]) -> Result<()> {
        if self.failing_publishes {
            let first = messages.first();
            return Err(BusError::Publish {
                exchange: first.map(|m| m.exchange().to_string()).unwrap_or_default(),
                routing_key: first.map(|m| m.routing_key().to_string()).unwrap_or_default(),
                reason: "publish rejected by broker".to_string(),
            });
        }
        let routes = messages
            .iter()
            .map(|message| self.route(message.exchange(), message.routing_key()))
            .collect::<Result<Vec<_>>>()?;
        let mut touched: Vec<String> = Vec::new();
        for (message, targets) in messages.iter().zip(routes) {
            self.enqueue(message, &targets);
            self.ops.push(BrokerOp::Publish {
                exchange: message.exchange().to_string(),
                routing_key: message.routing_key().to_string(),
                properties: message.properties().clone(),
                body: message.body().to_vec(),
            });
            touched.extend(targets);
        }
        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch(&queue);
        }
        Ok(())
    }

    /// Hands ready messages to consumers with free prefetch capacity, round robin.
    fn dispatch(&mut self, name: &str) {
        if self.paused {
            return;
        }
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            queue
                .consumers
                .retain(|consumer| !consumer.sender.is_closed());
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (queue.next_consumer + offset) % count;
                let channel_id = queue.consumers[index].channel;
                let has_capacity = self.channels.get(&channel_id).is_some_and(|channel| {
                    channel.open
                        && (channel.prefetch_count == 0
                            || channel.unacked.len() < usize::from(channel.prefetch_count))
                });
                if has_capacity {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else {
                return;
            };

            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            queue.next_consumer = (index + 1) % count;
            let consumer = &queue.consumers[index];
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            if consumer.sender.send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                continue;
            }
            let channel_id = consumer.channel;
            trace!(queue = name, delivery_tag, channel = channel_id, "delivered");
            if let Some(channel) = self.channels.get_mut(&channel_id) {
                channel.unacked.insert(delivery_tag, (name.to_string(), message));
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut message: QueuedMessage) {
        message.redelivered = true;
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.ready.push_front(message);
        }
    }

    fn drop_consumers(&mut self, channel_id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel != channel_id);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let mut unacked: Vec<(u64, (String, QueuedMessage))> = channel.unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        self.drop_consumers(channel_id);
        let mut touched = Vec::new();
        for (_, (queue, message)) in unacked {
            self.requeue(&queue, message);
            touched.push(queue);
        }
        touched.sort();
        touched.dedup();
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection_id: u64, error: Option<&BusError>) {
        if self.connections.get(&connection_id) != Some(&true) {
            return;
        }
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection_id && channel.open)
            .map(|(id, _)| *id)
            .collect();
        if let Some(error) = error {
            for queue in self.queues.values() {
                for consumer in &queue.consumers {
                    if channel_ids.contains(&consumer.channel) {
                        let _ = consumer
                            .sender
                            .send(Err(BusError::ChannelClosed(error.to_string())));
                    }
                }
            }
        }
        self.connections.insert(connection_id, false);
        for id in channel_ids {
            self.close_channel(id);
        }
    }
}

/// In-process broker. Cheap to clone; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a durable queue outside of any channel.
    pub fn declare_queue(&self, name: &str) {
        self.state.lock().queues.entry(name.to_string()).or_default();
    }

    /// Publishes a message outside of any channel. Not recorded in [`MemoryBroker::ops`].
    pub fn inject(&self, message: &OutgoingMessage) -> Result<()> {
        let mut state = self.state.lock();
        let targets = state.route(message.exchange(), message.routing_key())?;
        state.enqueue(message, &targets);
        for queue in targets {
            state.dispatch(&queue);
        }
        Ok(())
    }

    /// Messages waiting in `queue`, oldest first.
    #[must_use]
    pub fn ready(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting in `queue`.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Number of delivered but unacknowledged messages across all channels.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    /// Number of consumers registered on `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// True if an exchange with this name was declared.
    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    /// True if a queue with this name was declared.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Routing keys binding `queue` to `exchange`.
    #[must_use]
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.queue == queue)
            .map(|b| b.routing_key.clone())
            .collect()
    }

    /// Every recorded channel operation, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.state.lock().ops.clone()
    }

    /// Messages accepted through channels, in order.
    #[must_use]
    pub fn published(&self) -> Vec<BrokerOp> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, BrokerOp::Publish { .. }))
            .collect()
    }

    /// Delivery tags acknowledged so far, in order.
    #[must_use]
    pub fn acked(&self) -> Vec<u64> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                BrokerOp::Ack { delivery_tag } => Some(delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// Number of heartbeat rounds processed.
    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.state.lock().heartbeats
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|open| **open)
            .count()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Makes every publish fail while set.
    pub fn fail_publishes(&self, failing: bool) {
        self.state.lock().failing_publishes = failing;
    }

    /// Holds back deliveries while set; messages stay ready in their queues.
    pub fn pause_deliveries(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        if !paused {
            let names: Vec<String> = state.queues.keys().cloned().collect();
            for name in names {
                state.dispatch(&name);
            }
        }
    }

    /// Simulates the broker dropping every open connection.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, open)| **open)
            .map(|(id, _)| *id)
            .collect();
        debug!(connections = ids.len(), "dropping connections");
        for id in ids {
            state.close_connection(id, Some(&BusError::ConnectionClosed));
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BusError::Connection("connection refused".to_string()));
        }
        let id = state.next_id();
        state.connections.insert(id, true);
        state.connections_opened += 1;
        trace!(connection = id, "connection opened");
        Ok(Arc::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.state.lock();
        if state.connections.get(&self.id) != Some(&true) {
            return Err(BusError::ConnectionClosed);
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            Channel {
                connection: self.id,
                open: true,
                ..Channel::default()
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn process_heartbeat_events(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.connections.get(&self.id) != Some(&true) {
            return Err(BusError::ConnectionClosed);
        }
        state.heartbeats += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().connections.get(&self.id) == Some(&true)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_connection(self.id, None);
        Ok(())
    }
}

/// Channel of a [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, settings: &ExchangeSettings) -> Result<()> {
        let mut state = self.state.lock();
        state.channel(self.id)?;
        match state.exchanges.get(name) {
            Some(kind) if *kind != settings.kind => Err(BusError::Topology(format!(
                "exchange '{name}' already declared as {kind}"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), settings.kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, _settings: &QueueSettings) -> Result<()> {
        let mut state = self.state.lock();
        state.channel(self.id)?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.channel(self.id)?;
        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!(
                "cannot bind '{queue}' to '{exchange}'"
            )));
        }
        let exists = state.bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_qos(&self, _prefetch_size: u32, prefetch_count: u16) -> Result<()> {
        self.state.lock().channel_mut(self.id)?.prefetch_count = prefetch_count;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.state.lock().channel(self.id).map(|_| ())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let mut state = self.state.lock();
        state.channel(self.id)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Topology(format!("no queue '{queue}'")))?;
        entry.consumers.push(Consumer {
            channel: self.id,
            sender,
        });
        state.ops.push(BrokerOp::Consume {
            queue: queue.to_string(),
        });
        state.dispatch(queue);
        Ok(receiver)
    }

    async fn stop_consuming(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.channel(self.id)?;
        state.drop_consumers(self.id);
        state.ops.push(BrokerOp::StopConsuming);
        Ok(())
    }

    async fn publish(&self, message: &OutgoingMessage, _confirm: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.channel(self.id)?;
        state.publish_all(std::slice::from_ref(message))
    }

    async fn publish_batch(&self, messages: &[OutgoingMessage], _confirm: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.channel(self.id)?;
        state.publish_all(messages)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock();
        let (queue, _) = state
            .channel_mut(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BusError::Acknowledge {
                delivery_tag,
                reason: "unknown delivery tag".to_string(),
            })?;
        state.ops.push(BrokerOp::Ack { delivery_tag });
        state.dispatch(&queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state.lock();
        let (queue, message) = state
            .channel_mut(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BusError::Acknowledge {
                delivery_tag,
                reason: "unknown delivery tag".to_string(),
            })?;
        state.ops.push(BrokerOp::Nack {
            delivery_tag,
            requeue,
        });
        if requeue {
            state.requeue(&queue, message);
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<u32> {
        let state = self.state.lock();
        state.channel(self.id)?;
        let depth = state
            .queues
            .get(queue)
            .ok_or_else(|| BusError::Topology(format!("no queue '{queue}'")))?
            .ready
            .len();
        Ok(u32::try_from(depth).unwrap_or(u32::MAX))
    }

    fn is_open(&self) -> bool {
        self.state.lock().channel(self.id).is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(exchange: &str, routing_key: &str, body: &[u8]) -> OutgoingMessage {
        OutgoingMessage::new(exchange, routing_key, MessageProperties::default(), body.to_vec())
    }

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect().await.expect("connect");
        connection.open_channel().await.expect("channel")
    }

    #[tokio::test]
    async fn topic_exchange_routes_by_pattern() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_exchange("events", &ExchangeSettings::topic())
            .await
            .expect("exchange");
        for queue in ["eu", "all"] {
            channel
                .declare_queue(queue, &QueueSettings::default())
                .await
                .expect("queue");
        }
        channel.bind_queue("eu", "events", "orders.*.eu").await.expect("bind");
        channel.bind_queue("all", "events", "orders.#").await.expect("bind");

        channel
            .publish(&message("events", "orders.created.eu", b"1"), true)
            .await
            .expect("publish");
        channel
            .publish(&message("events", "orders.created.us", b"2"), true)
            .await
            .expect("publish");

        assert_eq!(broker.ready_count("eu"), 1);
        assert_eq!(broker.ready_count("all"), 2);
    }

    #[tokio::test]
    async fn batches_are_all_or_nothing() {
        let broker = MemoryBroker::new();
        broker.declare_queue("target");
        let channel = channel(&broker).await;

        let batch = vec![message("", "target", b"1"), message("missing", "x", b"2")];
        let result = channel.publish_batch(&batch, true).await;

        assert!(matches!(result, Err(BusError::Publish { .. })));
        assert_eq!(broker.ready_count("target"), 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        for body in [b"1", b"2", b"3"] {
            broker.inject(&message("", "work", body)).expect("inject");
        }
        let channel = channel(&broker).await;
        channel.set_qos(0, 1).await.expect("qos");
        let mut stream = channel.consume("work").await.expect("consume");

        let first = stream.recv().await.expect("open").expect("delivery");
        assert_eq!(first.body, b"1");
        assert!(stream.try_recv().is_err());
        assert_eq!(broker.ready_count("work"), 2);

        channel.ack(first.delivery_tag).await.expect("ack");
        let second = stream.recv().await.expect("open").expect("delivery");
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_messages() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        broker.inject(&message("", "work", b"1")).expect("inject");
        let channel = channel(&broker).await;
        let mut stream = channel.consume("work").await.expect("consume");
        let delivery = stream.recv().await.expect("open").expect("delivery");
        assert!(!delivery.redelivered);

        channel.close().await.expect("close");
        assert!(stream.recv().await.is_none());
        let ready = broker.ready("work");
        assert_eq!(ready.len(), 1);
        assert!(ready[0].redelivered);
    }

    #[tokio::test]
    async fn dropped_connections_fail_their_consumers() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let channel = channel(&broker).await;
        let mut stream = channel.consume("work").await.expect("consume");

        broker.drop_connections();

        assert!(matches!(stream.recv().await, Some(Err(_))));
        assert!(stream.recv().await.is_none());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn injected_connect_failures_are_consumed() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connections_opened(), 1);
    }
}
