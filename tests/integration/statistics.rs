use crate::*;

use std::sync::Mutex;

use calcnode_services::cache_registry::DeferredCacheRegistry;
use calcnode_services::deferred_cache::WriteStrategy;
use calcnode_services::statistics::{DeferredInvocationStatistics, FunctionInvocationStatisticsSink, InvocationRecord};
use calcnode_services::worker_pool::WorkerPool;

/// Items that never ran and invocations that failed leave no record.
#[test]
fn only_produced_results_are_recorded() {
    let h = Harness::new();
    h.register("PV", Behaviour::ProduceAll);
    h.register("Broken", Behaviour::Fail);
    let t = trade("T~1");
    h.add_target(&t);
    let market = value("Market", t.clone());
    h.seed(&market, serde_json::json!({ "spot": 101.25 }));

    let items = vec![
        item("PV", &t, vec![market.clone()], vec![value("PV", t.clone())]),
        item("PV", &t, vec![], vec![value("Delta", t.clone())]),
        item("Broken", &t, vec![], vec![value("X", t.clone())]),
        item("PV", &t, vec![value("Absent", t.clone())], vec![value("Gamma", t.clone())]),
    ];
    h.node().execute_job(job(items)).unwrap();

    assert_eq!(h.statistics.invocations(CONFIG, "PV"), 2);
    assert_eq!(h.statistics.invocations(CONFIG, "Broken"), 0);

    let summary = h.statistics.snapshot();
    let pv = summary.iter().find(|s| s.function_id == "PV").unwrap();
    // Only the first PV item had an input.
    assert!(pv.mean_data_input_bytes.unwrap() > 0.0);
    assert!(pv.mean_data_output_bytes.unwrap() > 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_behind_sizes_arrive_before_the_result() {
    let h = Harness::new();
    h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let pool = WorkerPool::current(2).unwrap();
    let registry = DeferredCacheRegistry::new(WriteStrategy::from_flags(true, false), Some(pool.clone())).unwrap();
    let node = CalculationNode::new(
        "node-0",
        h.services().with_cache_registry(registry).with_worker_pool(pool),
    )
    .unwrap();

    let items = (0..5)
        .map(|i| item("PV", &t, vec![], vec![value(&format!("V{i}"), t.clone())]))
        .collect();
    node.run_job(job(items)).await.unwrap().unwrap();

    assert_eq!(h.statistics.invocations(CONFIG, "PV"), 5);
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<InvocationRecord>>);

impl FunctionInvocationStatisticsSink for RecordingSink {
    fn record_invocation(&self, record: InvocationRecord) {
        self.0.lock().unwrap().push(record);
    }
}

#[test]
fn concurrent_output_reports_emit_once() {
    for _ in 0..50 {
        let sink = Arc::new(RecordingSink::default());
        let stats = DeferredInvocationStatistics::new(CONFIG, "PV", sink.clone());
        stats.begin_invocation();
        stats.end_invocation();
        stats.set_data_input_bytes(0, 0);
        stats.set_expected_data_output_samples(3);

        let threads: Vec<_> = (0..3)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || stats.add_data_output_bytes(16))
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].data_input_bytes.is_nan());
        assert_eq!(records[0].invocation_count, 1);
        assert!(stats.is_emitted());
    }
}
