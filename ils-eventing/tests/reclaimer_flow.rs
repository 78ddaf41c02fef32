mod common;

use chrono::Utc;
use common::FaultyLog;
use ils_eventing::backend::{MemoryStreamLog, StreamLog, StreamsBackend};
use ils_eventing::consumer::ConsumerName;
use ils_eventing::error::{EventingError, EventingResult};
use ils_eventing::event::{DlqEntry, StreamEntry};
use ils_eventing::eventing::{
    BusConfig, DEFAULT_GROUP, DeadLetterQueue, DeadLetterSink, EventBus, EventHandler, FnHandler,
    HandlerRegistry, PelSampler, Reclaimer, ReclaimerConfig,
};
use ils_eventing::metrics::EventingMetrics;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const STREAM: &str = "order.submitted";
const IDLE: Duration = Duration::from_secs(60);

fn counting(calls: Arc<AtomicUsize>, succeed: bool) -> Arc<dyn EventHandler> {
    FnHandler::arc("counting", move |_, _, _| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if succeed {
                Ok(())
            } else {
                Err(anyhow::anyhow!("boom"))
            }
        }
    })
}

fn backend(
    log: Arc<MemoryStreamLog>,
    consumer: &str,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<EventingMetrics>,
) -> Arc<StreamsBackend> {
    Arc::new(
        StreamsBackend::builder()
            .log(log)
            .group(DEFAULT_GROUP)
            .consumer(ConsumerName::new(consumer))
            .registry(registry)
            .metrics(metrics)
            .build(),
    )
}

/// 模拟已投递给崩溃消费者、尚未确认的条目
async fn stuck_entry(log: &MemoryStreamLog, stream: &str, payload: Value) -> String {
    log.ensure_group(stream, DEFAULT_GROUP).await.unwrap();
    let fields = StreamEntry::encode(stream, &payload, Utc::now()).unwrap();
    let id = log.append(stream, fields).await.unwrap();
    let read = log
        .read_group(stream, DEFAULT_GROUP, "crashed", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
    id
}

struct BrokenSink;

#[async_trait::async_trait]
impl DeadLetterSink for BrokenSink {
    async fn write(&self, _entry: &DlqEntry) -> EventingResult<String> {
        Err(EventingError::transport("connection reset"))
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_entry_moves_to_dead_letters() {
    let log = Arc::new(MemoryStreamLog::new());
    let metrics = Arc::new(EventingMetrics::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(STREAM, counting(calls.clone(), false))
        .unwrap();
    let streams = backend(log.clone(), "worker-a", registry, metrics.clone());
    let dlq = DeadLetterQueue::new(log.clone(), ":dlq");

    let reclaimer = Reclaimer::builder()
        .backend(streams.clone())
        .dead_letters(Arc::new(dlq.clone()))
        .metrics(metrics.clone())
        .config(ReclaimerConfig::builder().max_deliveries(3).build())
        .build();

    let id = stuck_entry(&log, STREAM, json!({"orderId": "O-1"})).await;

    let mut last = (0, 0);
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        tokio::time::sleep(IDLE).await;
        let summary = reclaimer.run_once().await.remove(0);
        outcomes.push((summary.retained, summary.dead_lettered));

        let now = (metrics.reclaimed_total(), metrics.dlq_total());
        assert!(now.0 >= last.0 && now.1 >= last.1);
        last = now;
    }

    // 第 2 次投递失败留在 PEL，第 3 次进入死信，之后无可回收条目
    assert_eq!(outcomes, vec![(1, 0), (0, 1), (0, 0)]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.dlq_total(), 1);
    assert_eq!(metrics.reclaimed_total(), 0);
    assert_eq!(streams.pending_count(STREAM).await.unwrap(), 0);

    let letters = dlq.list(STREAM, 10).await.unwrap();
    assert_eq!(letters.len(), 1);
    let (_, letter) = &letters[0];
    assert_eq!(letter.original_event_id(), id);
    assert_eq!(letter.original_payload(), &json!({"orderId": "O-1"}));
    assert_eq!(letter.group_name(), DEFAULT_GROUP);
    assert_eq!(letter.delivery_count(), 3);
    assert!(letter.failure_reason().contains("boom"));
}

#[tokio::test(start_paused = true)]
async fn failed_dead_letter_write_keeps_entry_pending() {
    let log = Arc::new(MemoryStreamLog::new());
    let metrics = Arc::new(EventingMetrics::new());
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(STREAM, counting(Arc::new(AtomicUsize::new(0)), false))
        .unwrap();
    let streams = backend(log.clone(), "worker-a", registry, metrics.clone());

    let reclaimer = Reclaimer::builder()
        .backend(streams.clone())
        .dead_letters(Arc::new(BrokenSink))
        .metrics(metrics.clone())
        .config(ReclaimerConfig::builder().max_deliveries(1).build())
        .build();

    stuck_entry(&log, STREAM, json!({"orderId": "O-1"})).await;
    tokio::time::sleep(IDLE).await;
    let summary = reclaimer.run_once().await.remove(0);

    assert_eq!(summary.dead_lettered, 0);
    assert_eq!(summary.retained, 1);
    assert_eq!(metrics.dlq_total(), 0);
    assert_eq!(metrics.reclaimer_failures_total(), 1);
    assert_eq!(streams.pending_count(STREAM).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_reclaimers_process_stuck_entry_once() {
    let log = Arc::new(MemoryStreamLog::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mk = |consumer: &str| {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(STREAM, counting(calls.clone(), true))
            .unwrap();
        backend(
            log.clone(),
            consumer,
            registry,
            Arc::new(EventingMetrics::new()),
        )
    };
    let a = mk("worker-a");
    let b = mk("worker-b");

    stuck_entry(&log, STREAM, json!({"orderId": "O-1"})).await;
    tokio::time::sleep(IDLE).await;

    let (ra, rb) = tokio::join!(
        a.reclaim_and_process(STREAM, IDLE, 10),
        b.reclaim_and_process(STREAM, IDLE, 10),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ra.succeeded + rb.succeeded, 1);
    assert_eq!(ra.claimed + rb.claimed, 1);
    assert_eq!(a.pending_count(STREAM).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_stream_does_not_block_others() {
    let log = Arc::new(MemoryStreamLog::new());
    let metrics = Arc::new(EventingMetrics::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(HandlerRegistry::new());
    // "invoice.created" 没有处理器，回收时报错
    registry
        .register(STREAM, counting(calls.clone(), true))
        .unwrap();
    let streams = backend(log.clone(), "worker-a", registry, metrics.clone());

    let reclaimer = Reclaimer::builder()
        .backend(streams.clone())
        .dead_letters(Arc::new(DeadLetterQueue::new(log.clone(), ":dlq")))
        .metrics(metrics.clone())
        .config(
            ReclaimerConfig::builder()
                .streams(vec!["invoice.created".to_string(), STREAM.to_string()])
                .max_deliveries(5)
                .build(),
        )
        .build();

    stuck_entry(&log, STREAM, json!({"orderId": "O-9"})).await;
    tokio::time::sleep(IDLE).await;
    let summaries = reclaimer.run_once().await;

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].stream, "invoice.created");
    assert!(summaries[0].failure.is_some());
    assert_eq!(summaries[1].reclaimed, 1);
    assert_eq!(metrics.reclaimed_total(), 1);
    assert_eq!(metrics.reclaimer_failures_total(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sampler_reports_pending_backlog() {
    let log = Arc::new(MemoryStreamLog::new());
    let metrics = Arc::new(EventingMetrics::new());
    log.ensure_group(STREAM, DEFAULT_GROUP).await.unwrap();
    for i in 0..7 {
        let fields = StreamEntry::encode(STREAM, &json!({ "n": i }), Utc::now()).unwrap();
        log.append(STREAM, fields).await.unwrap();
    }
    log.read_group(STREAM, DEFAULT_GROUP, "worker-a", 10, Duration::ZERO)
        .await
        .unwrap();

    let sampler = PelSampler::with_targets(
        log.clone(),
        vec![
            (STREAM.to_string(), DEFAULT_GROUP.to_string()),
            ("missing".to_string(), DEFAULT_GROUP.to_string()),
        ],
        metrics.clone(),
    );

    assert_eq!(sampler.sample_once().await, 1);
    assert_eq!(metrics.pending(STREAM, DEFAULT_GROUP), Some(7));
    assert!(
        metrics
            .render_prometheus()
            .contains("pending_entries{stream=\"order.submitted\",group=\"ils_group\"} 7")
    );
}

#[tokio::test(start_paused = true)]
async fn dead_letter_can_be_replayed_manually() {
    let log = Arc::new(MemoryStreamLog::new());
    let metrics = Arc::new(EventingMetrics::new());
    let bus = EventBus::with_stream_log(log.clone(), &BusConfig::default(), metrics.clone());
    let dlq = bus.dead_letters().unwrap();

    let letter = DlqEntry::builder()
        .original_event_id("1-0")
        .original_payload(json!({"orderId": "O-1"}))
        .stream_name(STREAM)
        .group_name(DEFAULT_GROUP)
        .failure_reason("boom")
        .delivery_count(3)
        .build();
    dlq.write(&letter).await.unwrap();
    assert_eq!(dlq.stream_for(STREAM), "order.submitted:dlq");

    let new_id = dlq.replay(&bus, &letter).await.unwrap();

    let replayed = log.range(STREAM, 10).await.unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].id, new_id);
    let entry = StreamEntry::decode(STREAM, &replayed[0]).unwrap();
    assert_eq!(entry.payload(), &json!({"orderId": "O-1"}));
    // 死信本身保留
    assert_eq!(dlq.list(STREAM, 10).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn claim_error_is_counted_and_other_entries_still_reclaimed() {
    let memory = Arc::new(MemoryStreamLog::new());
    let log = FaultyLog::new(memory.clone());
    let metrics = Arc::new(EventingMetrics::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(STREAM, counting(calls.clone(), true))
        .unwrap();
    let streams = StreamsBackend::builder()
        .log(log.clone())
        .group(DEFAULT_GROUP)
        .consumer(ConsumerName::new("worker-a"))
        .registry(registry)
        .metrics(metrics.clone())
        .build();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(stuck_entry(&memory, STREAM, json!({ "n": i })).await);
    }
    log.break_claim(&ids[1]);
    tokio::time::sleep(IDLE).await;

    let report = streams.reclaim_and_process(STREAM, IDLE, 10).await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.errors, 1);
    assert_eq!(report.succeeded, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.reclaimer_failures_total(), 1);
    assert_eq!(metrics.reclaimed_total(), 2);
    assert_eq!(streams.pending_count(STREAM).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn ack_error_after_reclaim_keeps_entry_pending() {
    let memory = Arc::new(MemoryStreamLog::new());
    let log = FaultyLog::new(memory.clone());
    let metrics = Arc::new(EventingMetrics::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(STREAM, counting(calls.clone(), true))
        .unwrap();
    let streams = StreamsBackend::builder()
        .log(log.clone())
        .group(DEFAULT_GROUP)
        .consumer(ConsumerName::new("worker-a"))
        .registry(registry)
        .metrics(metrics.clone())
        .build();

    let first = stuck_entry(&memory, STREAM, json!({"orderId": "O-1"})).await;
    stuck_entry(&memory, STREAM, json!({"orderId": "O-2"})).await;
    log.break_ack(&first);
    tokio::time::sleep(IDLE).await;

    let report = streams.reclaim_and_process(STREAM, IDLE, 10).await.unwrap();

    assert_eq!(report.claimed, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.reclaimer_failures_total(), 1);
    assert_eq!(metrics.reclaimed_total(), 1);
    assert_eq!(streams.pending_count(STREAM).await.unwrap(), 1);
}
