use super::*;
use crate::broker::memory::{Disposition, Settlement};
use crate::broker::{MemoryBroker, PublishTarget};
use crate::jobs::JobFn;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn envelope(job: &str, payload: Value) -> Vec<u8> {
    JobEnvelope::new(job, payload).encode().unwrap()
}

/// Handler that records every payload it sees.
fn recording_handler() -> (Arc<dyn crate::jobs::JobHandler>, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = JobFn::arc(move |payload: Value| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(payload);
            Ok(())
        }
    });
    (handler, seen)
}

fn spawn_listener(
    worker: Worker,
    queue: &'static str,
    exchange: Option<&'static str>,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move { worker.listen(queue, exchange).await })
}

async fn wait_for_settlements(broker: &MemoryBroker, count: usize) -> Vec<Settlement> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let settlements = broker.settlements();
            if settlements.len() >= count {
                return settlements;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timed out waiting for settlements")
}

async fn wait_for_queue(broker: &MemoryBroker, queue: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.queue_depth(queue).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timed out waiting for queue");
}

#[tokio::test]
async fn test_registered_job_is_invoked_and_acked() {
    let broker = MemoryBroker::new();
    let (handler, seen) = recording_handler();
    let registry = JobRegistry::builder()
        .register("sendWelcomeEmail", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    let body = envelope("sendWelcomeEmail", json!({"to": "a@x.com"}));
    broker
        .publish(&PublishTarget::Queue(DEFAULT_QUEUE.into()), &body)
        .await
        .unwrap();

    let settlements = wait_for_settlements(&broker, 1).await;
    assert_eq!(
        settlements,
        vec![Settlement {
            queue: DEFAULT_QUEUE.into(),
            body,
            disposition: Disposition::Ack,
        }]
    );
    assert_eq!(*seen.lock().unwrap(), vec![json!({"to": "a@x.com"})]);
    listener.abort();
}

#[tokio::test]
async fn test_unknown_job_is_rejected_without_requeue() {
    let broker = MemoryBroker::new();
    let (handler, seen) = recording_handler();
    let registry = JobRegistry::builder()
        .register("sendWelcomeEmail", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    broker
        .publish(
            &PublishTarget::Queue(DEFAULT_QUEUE.into()),
            &envelope("unknownJob", json!({})),
        )
        .await
        .unwrap();

    let settlements = wait_for_settlements(&broker, 1).await;
    assert_eq!(
        settlements[0].disposition,
        Disposition::Reject { requeue: false }
    );
    assert_eq!(broker.queue_depth(DEFAULT_QUEUE), Some(0));
    assert!(seen.lock().unwrap().is_empty());
    listener.abort();
}

#[tokio::test]
async fn test_execute_reports_missing_job_by_name() {
    let worker = Worker::new(
        Arc::new(JobRegistry::default()),
        Arc::new(MemoryBroker::new()),
    );

    let err = worker
        .execute(DEFAULT_QUEUE, &envelope("unknownJob", json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::NotRegistered(ref job) if job == "unknownJob"));
    assert!(err.to_string().contains("unknownJob"));
    assert_eq!(err.job(), Some("unknownJob"));
}

#[tokio::test]
async fn test_undecodable_message_is_rejected() {
    let broker = MemoryBroker::new();
    let worker = Worker::new(Arc::new(JobRegistry::default()), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    broker
        .publish(&PublishTarget::Queue(DEFAULT_QUEUE.into()), b"not json")
        .await
        .unwrap();
    broker
        .publish(
            &PublishTarget::Queue(DEFAULT_QUEUE.into()),
            br#"{"payload": {}}"#,
        )
        .await
        .unwrap();

    let settlements = wait_for_settlements(&broker, 2).await;
    assert!(settlements
        .iter()
        .all(|s| s.disposition == Disposition::Reject { requeue: false }));
    listener.abort();
}

#[tokio::test]
async fn test_handler_failure_is_rejected_and_worker_continues() {
    let broker = MemoryBroker::new();
    let (handler, seen) = recording_handler();
    let registry = JobRegistry::builder()
        .register(
            "flaky",
            JobFn::arc(|_payload: Value| async { Err(HandlerError::failed("smtp down")) }),
        )
        .unwrap()
        .register("steady", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    let target = PublishTarget::Queue(DEFAULT_QUEUE.into());
    broker
        .publish(&target, &envelope("flaky", json!({})))
        .await
        .unwrap();
    broker
        .publish(&target, &envelope("steady", json!({"n": 2})))
        .await
        .unwrap();

    let settlements = wait_for_settlements(&broker, 2).await;
    assert_eq!(
        settlements[0].disposition,
        Disposition::Reject { requeue: false }
    );
    assert_eq!(settlements[1].disposition, Disposition::Ack);
    assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 2})]);
    listener.abort();
}

#[tokio::test]
async fn test_jobs_run_one_at_a_time() {
    let broker = MemoryBroker::new();
    let running = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let (r, o, seen) = (running.clone(), overlap.clone(), order.clone());
    let handler = JobFn::arc(move |payload: Value| {
        let (running, overlap, order) = (r.clone(), o.clone(), seen.clone());
        async move {
            if running.fetch_add(1, Ordering::SeqCst) > 0 {
                overlap.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            order.lock().unwrap().push(payload["n"].as_u64().unwrap_or_default());
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let registry = JobRegistry::builder()
        .register("slow", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    let target = PublishTarget::Queue(DEFAULT_QUEUE.into());
    for n in 0..5 {
        broker
            .publish(&target, &envelope("slow", json!({"n": n})))
            .await
            .unwrap();
    }

    let settlements = wait_for_settlements(&broker, 5).await;
    assert_eq!(settlements.len(), 5);
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    assert_eq!(broker.max_unacked(), 1);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    listener.abort();
}

#[tokio::test]
async fn test_every_delivery_is_settled_exactly_once() {
    let broker = MemoryBroker::new();
    let (handler, _) = recording_handler();
    let registry = JobRegistry::builder()
        .register("known", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    let target = PublishTarget::Queue(DEFAULT_QUEUE.into());
    let bodies = vec![
        envelope("known", json!({"i": 1})),
        envelope("missing", json!({"i": 2})),
        b"{broken".to_vec(),
        envelope("known", json!({"i": 3})),
    ];
    for body in &bodies {
        broker.publish(&target, body).await.unwrap();
    }

    wait_for_settlements(&broker, bodies.len()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let settlements = broker.settlements();
    assert_eq!(settlements.len(), bodies.len());
    for body in &bodies {
        assert_eq!(
            settlements.iter().filter(|s| &s.body == body).count(),
            1,
            "body settled more than once or not at all"
        );
    }
    listener.abort();
}

#[tokio::test]
async fn test_handler_timeout_rejects_message() {
    let broker = MemoryBroker::new();
    let registry = JobRegistry::builder()
        .register(
            "stuck",
            JobFn::arc(|_payload: Value| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        )
        .unwrap()
        .build();
    let worker = Worker::with_options(
        Arc::new(registry),
        Arc::new(broker.clone()),
        WorkerOptions {
            handler_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        },
    );

    let err = worker
        .execute(DEFAULT_QUEUE, &envelope("stuck", json!({})))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        JobError::Handler {
            source: HandlerError::TimedOut(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_listen_binds_queue_to_exchange() {
    let broker = MemoryBroker::new();
    let (handler, seen) = recording_handler();
    let registry = JobRegistry::builder()
        .register("notify", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, "notifications", Some("jobs"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.bound_queues("jobs").is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.bound_queues("jobs"), vec!["notifications".to_string()]);

    broker
        .publish(
            &PublishTarget::Exchange("jobs".into()),
            &envelope("notify", json!({"k": "v"})),
        )
        .await
        .unwrap();

    wait_for_settlements(&broker, 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!({"k": "v"})]);
    listener.abort();
}

#[tokio::test]
async fn test_rejected_message_is_dead_lettered_when_configured() {
    let broker = MemoryBroker::new();
    broker.declare_exchange("dead").await.unwrap();
    broker
        .declare_queue(&QueueSpec::durable("graveyard"))
        .await
        .unwrap();
    broker.bind_queue("graveyard", "dead").await.unwrap();

    let worker = Worker::with_options(
        Arc::new(JobRegistry::default()),
        Arc::new(broker.clone()),
        WorkerOptions {
            dead_letter_exchange: Some("dead".into()),
            ..Default::default()
        },
    );
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    broker
        .publish(
            &PublishTarget::Queue(DEFAULT_QUEUE.into()),
            &envelope("unknownJob", json!({})),
        )
        .await
        .unwrap();

    wait_for_settlements(&broker, 1).await;
    assert_eq!(broker.queue_depth("graveyard"), Some(1));
    listener.abort();
}

#[tokio::test]
async fn test_worker_resubscribes_after_consumer_cancel() {
    let broker = MemoryBroker::new();
    let (handler, seen) = recording_handler();
    let registry = JobRegistry::builder()
        .register("job", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    broker.delete_queue(DEFAULT_QUEUE);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    broker
        .publish(
            &PublishTarget::Queue(DEFAULT_QUEUE.into()),
            &envelope("job", json!({"after": "cancel"})),
        )
        .await
        .unwrap();

    wait_for_settlements(&broker, 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!({"after": "cancel"})]);
    assert!(!listener.is_finished());
    listener.abort();
}

#[tokio::test]
async fn test_listen_fails_on_conflicting_topology() {
    let broker = MemoryBroker::new();
    let mut transient = QueueSpec::durable(DEFAULT_QUEUE);
    transient.durable = false;
    broker.declare_queue(&transient).await.unwrap();

    let worker = Worker::new(Arc::new(JobRegistry::default()), Arc::new(broker));
    let result = worker.listen(DEFAULT_QUEUE, None).await;

    assert!(matches!(result, Err(BrokerError::Topology(_))));
}

#[tokio::test]
async fn test_panicking_handler_is_rejected_and_worker_continues() {
    let broker = MemoryBroker::new();
    let (handler, seen) = recording_handler();
    let registry = JobRegistry::builder()
        .register(
            "boom",
            JobFn::arc(|payload: Value| async move {
                if payload.is_object() {
                    panic!("template missing");
                }
                Ok(())
            }),
        )
        .unwrap()
        .register("ok", handler)
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(broker.clone()));
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);
    wait_for_queue(&broker, DEFAULT_QUEUE).await;

    let target = PublishTarget::Queue(DEFAULT_QUEUE.into());
    let poison = envelope("boom", json!({}));
    broker.publish(&target, &poison).await.unwrap();
    broker
        .publish(&target, &envelope("ok", json!({"n": 1})))
        .await
        .unwrap();

    let settlements = wait_for_settlements(&broker, 2).await;
    assert_eq!(settlements[0].body, poison);
    assert_eq!(
        settlements[0].disposition,
        Disposition::Reject { requeue: false }
    );
    assert_eq!(settlements[1].disposition, Disposition::Ack);
    assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 1})]);
    assert!(!listener.is_finished());
    listener.abort();
}

#[tokio::test]
async fn test_execute_reports_panic_as_handler_error() {
    let registry = JobRegistry::builder()
        .register(
            "boom",
            JobFn::arc(|payload: Value| async move {
                if payload.is_object() {
                    panic!("template missing");
                }
                Ok(())
            }),
        )
        .unwrap()
        .build();
    let worker = Worker::new(Arc::new(registry), Arc::new(MemoryBroker::new()));

    let err = worker
        .execute(DEFAULT_QUEUE, &envelope("boom", json!({})))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        JobError::Handler {
            source: HandlerError::Panicked(ref message),
            ..
        } if message == "template missing"
    ));
}

#[tokio::test]
async fn test_dead_letter_worker_and_dispatcher_share_queue() {
    use crate::config::Config;
    use crate::dispatch::Dispatcher;

    let mut config = Config::default();
    config.worker.dead_letter_exchange = Some("jobs.dlx".into());

    let broker = MemoryBroker::new();
    broker.declare_exchange("jobs.dlx").await.unwrap();
    broker
        .declare_queue(&QueueSpec::durable("graveyard"))
        .await
        .unwrap();
    broker.bind_queue("graveyard", "jobs.dlx").await.unwrap();

    // The producer declares the queue before any worker is up.
    let dispatcher = Dispatcher::new(Arc::new(broker.clone()), config.dispatch_route());
    dispatcher
        .dispatch("sendWelcomeEmail", json!({"to": "a@x.com"}))
        .await
        .unwrap();
    dispatcher.dispatch("unknownJob", json!({})).await.unwrap();

    let (handler, seen) = recording_handler();
    let registry = JobRegistry::builder()
        .register("sendWelcomeEmail", handler)
        .unwrap()
        .build();
    let worker = Worker::with_options(
        Arc::new(registry),
        Arc::new(broker.clone()),
        config.worker.options(),
    );
    let listener = spawn_listener(worker, DEFAULT_QUEUE, None);

    let settlements = wait_for_settlements(&broker, 2).await;
    assert_eq!(settlements[0].disposition, Disposition::Ack);
    assert_eq!(
        settlements[1].disposition,
        Disposition::Reject { requeue: false }
    );
    assert_eq!(*seen.lock().unwrap(), vec![json!({"to": "a@x.com"})]);
    assert_eq!(broker.queue_depth("graveyard"), Some(1));
    assert!(!listener.is_finished());
    listener.abort();
}
