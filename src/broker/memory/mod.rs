//! In-memory broker.
//!
//! Implements the same topology rules the worker and bridge rely on from
//! RabbitMQ: durable and server-named queues, fanout exchanges, per-consumer
//! prefetch, ack/reject with optional requeue, and dead-lettering of
//! rejected messages. Everything lives in one process, which makes it
//! suitable for tests and broker-less local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    Acknowledger, Broker, BrokerError, Delivery, DeliveryStream, PublishTarget, QueueSpec, Result,
};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// Record of one settled delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub body: Vec<u8>,
    pub disposition: Disposition,
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<Message>,
}

#[derive(Default)]
struct ConsumerState {
    queue: String,
    prefetch: Option<u16>,
    unacked: usize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    /// Exchange name to bound queue names.
    exchanges: HashMap<String, Vec<String>>,
    consumers: HashMap<u64, ConsumerState>,
    max_unacked: usize,
    prefetch: Option<u16>,
    settlements: Vec<Settlement>,
    published: Vec<(PublishTarget, Vec<u8>)>,
    fail_on_publish: bool,
    next_consumer: u64,
    next_generated: u64,
}

enum Take {
    Ready(Message),
    Wait,
    Closed,
}

impl State {
    fn route(&mut self, target: &PublishTarget, body: &[u8]) -> Result<()> {
        match target {
            PublishTarget::Queue(name) => match self.queues.get_mut(name) {
                Some(queue) => queue.messages.push_back(Message {
                    body: body.to_vec(),
                    redelivered: false,
                }),
                None => debug!(queue = %name, "Unroutable message dropped"),
            },
            PublishTarget::Exchange(name) => {
                let bound = self.exchanges.get(name).cloned().ok_or_else(|| {
                    BrokerError::Publish(format!("Exchange \"{}\" not found", name))
                })?;
                for queue in bound {
                    if let Some(queue) = self.queues.get_mut(&queue) {
                        queue.messages.push_back(Message {
                            body: body.to_vec(),
                            redelivered: false,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn take(&mut self, consumer_id: u64) -> Take {
        let max_unacked = &mut self.max_unacked;
        let Some(consumer) = self.consumers.get_mut(&consumer_id) else {
            return Take::Closed;
        };
        let Some(queue) = self.queues.get_mut(&consumer.queue) else {
            return Take::Closed;
        };
        if let Some(limit) = consumer.prefetch.filter(|limit| *limit > 0) {
            if consumer.unacked >= limit as usize {
                return Take::Wait;
            }
        }
        match queue.messages.pop_front() {
            Some(message) => {
                consumer.unacked += 1;
                *max_unacked = (*max_unacked).max(consumer.unacked);
                Take::Ready(message)
            }
            None => Take::Wait,
        }
    }
}

/// Removes a consumer from the broker when its stream is dropped.
struct ConsumerGuard {
    broker: MemoryBroker,
    consumer_id: u64,
    queue: String,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.broker.lock().consumers.remove(&self.consumer_id);
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// Broker that keeps queues and exchanges in process memory.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make publishes fail until switched off again.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.lock().fail_on_publish = fail;
    }

    /// Every message accepted by `publish`, in order.
    pub fn published(&self) -> Vec<(PublishTarget, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// Every settled delivery, in settlement order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    /// Messages waiting in `queue` (not counting unacknowledged ones).
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    /// Queues currently bound to `exchange`.
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        self.lock()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of unacknowledged deliveries any consumer held at once.
    pub fn max_unacked(&self) -> usize {
        self.lock().max_unacked
    }

    /// Consumers whose delivery streams are still alive.
    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Drop a queue, ending its consumers' streams as a broker cancel would.
    pub fn delete_queue(&self, queue: &str) {
        {
            let mut state = self.lock();
            state.queues.remove(queue);
            for bound in state.exchanges.values_mut() {
                bound.retain(|q| q != queue);
            }
        }
        self.inner.notify.notify_waiters();
    }

    fn settle(&self, consumer_id: u64, queue: &str, message: &Message, disposition: Disposition) {
        {
            let mut state = self.lock();
            if let Some(consumer) = state.consumers.get_mut(&consumer_id) {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
            let queue = queue.to_string();

            state.settlements.push(Settlement {
                queue: queue.clone(),
                body: message.body.clone(),
                disposition,
            });

            if let Disposition::Reject { requeue } = disposition {
                if requeue {
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.messages.push_front(Message {
                            body: message.body.clone(),
                            redelivered: true,
                        });
                    }
                } else {
                    let dead_letter = state
                        .queues
                        .get(&queue)
                        .and_then(|q| q.spec.dead_letter_exchange.clone());
                    if let Some(exchange) = dead_letter {
                        let target = PublishTarget::Exchange(exchange);
                        if let Err(e) = state.route(&target, &message.body) {
                            debug!(error = %e, "Dead-letter routing failed");
                        }
                    }
                }
            }
        }
        self.inner.notify.notify_waiters();
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    consumer_id: u64,
    queue: String,
    message: Message,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(
            self.consumer_id,
            &self.queue,
            &self.message,
            Disposition::Ack,
        );
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker.settle(
            self.consumer_id,
            &self.queue,
            &self.message,
            Disposition::Reject { requeue },
        );
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let mut state = self.lock();

        let name = if spec.name.is_empty() {
            state.next_generated += 1;
            format!("amq.gen-{}", state.next_generated)
        } else {
            spec.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            let mut requested = spec.clone();
            requested.name = name.clone();
            if existing.spec != requested {
                return Err(BrokerError::Topology(format!(
                    "Queue \"{}\" already declared with different options",
                    name
                )));
            }
            return Ok(name);
        }

        let mut spec = spec.clone();
        spec.name = name.clone();
        state.queues.insert(
            name.clone(),
            MemoryQueue {
                spec,
                messages: VecDeque::new(),
            },
        );
        Ok(name)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.lock().exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Topology(format!("Queue \"{}\" not found", queue)));
        }
        let bound = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BrokerError::Topology(format!("Exchange \"{}\" not found", exchange))
        })?;
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.lock().prefetch = Some(count);
        Ok(())
    }

    async fn publish(&self, target: &PublishTarget, body: &[u8]) -> Result<()> {
        {
            let mut state = self.lock();
            if state.fail_on_publish {
                return Err(BrokerError::Publish("Memory broker publish failure".to_string()));
            }
            state.route(target, body)?;
            state.published.push((target.clone(), body.to_vec()));
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer_id = {
            let mut state = self.lock();
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Consume(format!("Queue \"{}\" not found", queue)));
            }
            state.next_consumer += 1;
            let id = state.next_consumer;
            let prefetch = state.prefetch;
            state.consumers.insert(
                id,
                ConsumerState {
                    queue: queue.to_string(),
                    prefetch,
                    ..Default::default()
                },
            );
            id
        };

        let guard = ConsumerGuard {
            broker: self.clone(),
            consumer_id,
            queue: queue.to_string(),
        };
        let stream = futures::stream::unfold(guard, |guard| async move {
            loop {
                // Register interest before looking, so a publish between the
                // check and the await still wakes us.
                let inner = Arc::clone(&guard.broker.inner);
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let taken = guard.broker.lock().take(guard.consumer_id);
                match taken {
                    Take::Ready(message) => {
                        let delivery = Delivery::new(
                            message.body.clone(),
                            message.redelivered,
                            Box::new(MemoryAcker {
                                broker: guard.broker.clone(),
                                consumer_id: guard.consumer_id,
                                queue: guard.queue.clone(),
                                message,
                            }),
                        );
                        return Some((Ok(delivery), guard));
                    }
                    Take::Closed => return None,
                    Take::Wait => notified.await,
                }
            }
        });

        Ok(stream.boxed())
    }
}
