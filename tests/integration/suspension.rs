use crate::*;

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use calcnode_core::config::BlacklistScope;
use calcnode_core::job::CancellationFlag;
use calcnode_core::result::InvocationResult;
use calcnode_core::value::NotCalculatedSentinel;
use calcnode_services::blacklist::{BlacklistMaintainer, BlacklistPolicy, BlacklistQuery, FunctionBlacklist};
use calcnode_services::function::{InvocationOutcome, PendingInvocation};
use calcnode_services::worker_pool::WorkerPool;
use calcnode_services::JobExecution;

/// Function that completes on the runtime rather than on the calling thread.
struct AsyncFunction {
    calls: AtomicUsize,
    behaviour: Behaviour,
    delay: Duration,
}

impl AsyncFunction {
    fn new(behaviour: Behaviour, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            behaviour,
            delay,
        })
    }
}

impl FunctionInvoker for AsyncFunction {
    fn execute(
        &self,
        _context: &InvocationContext,
        _target: Option<&ComputationTarget>,
        inputs: &FunctionInputs,
        desired_outputs: &BTreeSet<ValueSpecification>,
    ) -> Invocation {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let produced = produce_all(inputs, desired_outputs);
        let behaviour = self.behaviour;
        let delay = self.delay;
        Invocation::Suspended(PendingInvocation::new(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            match behaviour {
                Behaviour::Fail => Err(InvocationError::failed("TimeoutException", "remote grid timed out")),
                Behaviour::Blacklisted => Err(InvocationError::Blacklisted),
                Behaviour::ProduceNone => Ok(Vec::new()),
                Behaviour::ProduceAll | Behaviour::ProduceExtra => Ok(produced),
            }
        }))
    }
}

/// Resolver that takes its time, so async resolution really overlaps.
struct SlowResolver {
    inner: Arc<CountingResolver>,
    delay: Duration,
}

impl ComputationTargetResolver for SlowResolver {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget> {
        std::thread::sleep(self.delay);
        self.inner.resolve(specification)
    }
}

#[tokio::test]
async fn suspended_items_keep_their_order() {
    let h = Harness::new();
    h.register("Sync", Behaviour::ProduceAll);
    let remote = AsyncFunction::new(Behaviour::ProduceAll, Duration::from_millis(5));
    h.functions.register("Remote", remote.clone());
    let t = trade("T~1");
    h.add_target(&t);

    let a = value("A", t.clone());
    let b = value("B", t.clone());
    let c = value("C", t.clone());
    let items = vec![
        item("Remote", &t, vec![], vec![a.clone()]),
        item("Sync", &t, vec![a.clone()], vec![b.clone()]),
        item("Remote", &t, vec![a.clone(), b.clone()], vec![c.clone()]),
    ];
    let node = h.node();
    let handle = match node.execute_job(job(items)).unwrap() {
        JobExecution::Suspended(handle) => handle,
        _ => panic!("first item suspends, so the job must too"),
    };
    assert!(node.is_busy());
    assert_eq!(handle.specification(), &job_spec(1));

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.items.len(), 3);
    assert!(result.items.iter().all(|i| i.status == InvocationResult::Success));
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.cached(&c), Some(CacheValue::Value(serde_json::json!(2))));
    assert!(!node.is_busy());
}

#[tokio::test]
async fn log_is_detached_while_suspended() {
    let h = Harness::new();
    let detached = Arc::new(AtomicBool::new(false));
    struct Observer(Arc<AtomicBool>);
    impl FunctionInvoker for Observer {
        fn execute(
            &self,
            context: &InvocationContext,
            _target: Option<&ComputationTarget>,
            inputs: &FunctionInputs,
            desired_outputs: &BTreeSet<ValueSpecification>,
        ) -> Invocation {
            context.log().info("before suspending");
            let log = context.log().clone();
            let detached = self.0.clone();
            let produced = produce_all(inputs, desired_outputs);
            Invocation::Suspended(PendingInvocation::new(async move {
                tokio::task::yield_now().await;
                detached.store(!log.is_attached(), Ordering::SeqCst);
                log.info("while suspended");
                Ok(produced)
            }))
        }
    }
    h.functions.register("Observer", Arc::new(Observer(detached.clone())));

    let null = ComputationTargetSpecification::null();
    let mut job_item = item("Observer", &null, vec![], vec![value("PV", null.clone())]);
    job_item.log_mode = ExecutionLogMode::Full;

    let result = h.node().run_job(job(vec![job_item])).await.unwrap().unwrap();
    assert!(detached.load(Ordering::SeqCst));
    let events = result.items[0].execution_log.events.clone().unwrap();
    let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["before suspending"]);
}

#[tokio::test]
async fn async_failure_is_an_exception_and_blacklisted() {
    let h = Harness::new();
    h.functions
        .register("Remote", AsyncFunction::new(Behaviour::Fail, Duration::ZERO));
    let t = trade("T~1");
    h.add_target(&t);

    let list = Arc::new(FunctionBlacklist::new("failures"));
    let maintainer = BlacklistMaintainer::Enforcing {
        blacklist: list.clone(),
        policy: BlacklistPolicy::new([(BlacklistScope::Function, Duration::from_secs(60))]),
    };
    let node = CalculationNode::new("node-0", h.services().with_blacklist(BlacklistQuery::Disabled, maintainer)).unwrap();

    let out = value("PV", t.clone());
    let result = node
        .run_job(job(vec![item("Remote", &t, vec![], vec![out.clone()])]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.items[0].status, InvocationResult::Exception);
    let exception = result.items[0].execution_log.exception.clone().unwrap();
    assert_eq!(exception.class_name, "TimeoutException");
    assert_eq!(list.len(), 1);
    assert_eq!(h.cached(&out), Some(CacheValue::NotCalculated(NotCalculatedSentinel::EvaluationError)));
}

/// Suspends, then panics when resumed.
struct PanicsWhenResumed;

fn decode_remote_result(payload: &str) -> InvocationOutcome {
    panic!("cannot decode remote result {payload:?}")
}

impl FunctionInvoker for PanicsWhenResumed {
    fn execute(
        &self,
        _context: &InvocationContext,
        _target: Option<&ComputationTarget>,
        _inputs: &FunctionInputs,
        _desired_outputs: &BTreeSet<ValueSpecification>,
    ) -> Invocation {
        Invocation::Suspended(PendingInvocation::new(async {
            tokio::task::yield_now().await;
            decode_remote_result("garbled")
        }))
    }
}

#[tokio::test]
async fn async_panic_is_an_item_exception() {
    let h = Harness::new();
    h.register("Sync", Behaviour::ProduceAll);
    h.functions
        .register("Remote", AsyncFunction::new(Behaviour::ProduceAll, Duration::ZERO));
    h.functions.register("Garbled", Arc::new(PanicsWhenResumed));
    let t = trade("T~1");
    h.add_target(&t);

    let list = Arc::new(FunctionBlacklist::new("failures"));
    let maintainer = BlacklistMaintainer::Enforcing {
        blacklist: list.clone(),
        policy: BlacklistPolicy::new([(BlacklistScope::Function, Duration::from_secs(60))]),
    };
    let node = CalculationNode::new("node-0", h.services().with_blacklist(BlacklistQuery::Disabled, maintainer)).unwrap();

    let garbled = value("X", t.clone());
    let items = vec![
        item("Remote", &t, vec![], vec![value("A", t.clone())]),
        item("Garbled", &t, vec![], vec![garbled.clone()]),
        item("Sync", &t, vec![], vec![value("C", t.clone())]),
    ];
    let result = node.run_job(job(items)).await.unwrap().unwrap();

    let statuses: Vec<InvocationResult> = result.items.iter().map(|i| i.status).collect();
    assert_eq!(
        statuses,
        vec![InvocationResult::Success, InvocationResult::Exception, InvocationResult::Success]
    );
    let exception = result.items[1].execution_log.exception.clone().unwrap();
    assert_eq!(exception.class_name, "Panic");
    assert_eq!(h.cached(&garbled), Some(CacheValue::NotCalculated(NotCalculatedSentinel::EvaluationError)));
    assert_eq!(list.len(), 1);
    assert!(!node.is_busy());
}

#[tokio::test]
async fn async_blacklist_is_a_suppression() {
    let h = Harness::new();
    h.functions
        .register("Remote", AsyncFunction::new(Behaviour::Blacklisted, Duration::ZERO));
    let null = ComputationTargetSpecification::null();
    let out = value("PV", null.clone());

    let result = h
        .node()
        .run_job(job(vec![item("Remote", &null, vec![], vec![out.clone()])]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.items[0].status, InvocationResult::Suppressed);
    assert_eq!(h.cached(&out), Some(CacheValue::NotCalculated(NotCalculatedSentinel::Suppressed)));
}

#[tokio::test]
async fn async_missing_outputs_are_backfilled() {
    let h = Harness::new();
    h.functions
        .register("Remote", AsyncFunction::new(Behaviour::ProduceNone, Duration::ZERO));
    let null = ComputationTargetSpecification::null();
    let out = value("PV", null.clone());

    let result = h
        .node()
        .run_job(job(vec![item("Remote", &null, vec![], vec![out.clone()])]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.items[0].status, InvocationResult::Success);
    assert!(result.items[0].missing_outputs.contains(&out));
    assert_eq!(h.cached(&out), Some(CacheValue::NotCalculated(NotCalculatedSentinel::EvaluationError)));
}

/// Many consecutive suspensions must not grow the stack.
#[tokio::test]
async fn long_chains_of_suspensions_complete() {
    let h = Harness::new();
    h.functions
        .register("Remote", AsyncFunction::new(Behaviour::ProduceAll, Duration::ZERO));
    let null = ComputationTargetSpecification::null();

    let items: Vec<CalculationJobItem> = (0..500)
        .map(|i| item("Remote", &null, vec![], vec![value(&format!("V{i}"), null.clone())]))
        .collect();
    let result = h.node().run_job(job(items)).await.unwrap().unwrap();

    assert_eq!(result.items.len(), 500);
    assert!(result.items.iter().all(|i| i.status == InvocationResult::Success));
    assert!(h.cached(&value("V499", null)).is_some());
}

#[tokio::test]
async fn cancellation_while_suspended_stops_the_job() {
    let h = Harness::new();
    let later = h.register("Later", Behaviour::ProduceAll);
    let null = ComputationTargetSpecification::null();

    let items = vec![
        item("Cancels", &null, vec![], vec![value("A", null.clone())]),
        item("Later", &null, vec![], vec![value("B", null.clone())]),
    ];
    let job = job(items);

    struct Cancels(CancellationFlag);
    impl FunctionInvoker for Cancels {
        fn execute(
            &self,
            _context: &InvocationContext,
            _target: Option<&ComputationTarget>,
            inputs: &FunctionInputs,
            desired_outputs: &BTreeSet<ValueSpecification>,
        ) -> Invocation {
            let flag = self.0.clone();
            let produced = produce_all(inputs, desired_outputs);
            Invocation::Suspended(PendingInvocation::new(async move {
                tokio::task::yield_now().await;
                flag.cancel();
                Ok(produced)
            }))
        }
    }
    h.functions.register("Cancels", Arc::new(Cancels(job.cancellation())));

    let node = h.node();
    assert_eq!(node.run_job(job).await.unwrap(), None);
    assert_eq!(later.calls(), 0);
    // The suspended item itself still completed and wrote its output.
    assert!(h.cached(&value("A", null.clone())).is_some());
    assert!(h.cached(&value("B", null)).is_none());
    assert_eq!(node.status().jobs_cancelled, 1);
}

// ── Async target resolution ───────────────────────────────────────────────────

fn async_resolving_node(h: &Harness, delay: Duration) -> CalculationNode {
    let resolver = Arc::new(SlowResolver {
        inner: h.targets.clone(),
        delay,
    });
    let services = NodeServices::new(
        Arc::new(h.source.clone()),
        Arc::new(h.functions.clone()),
        resolver,
    )
    .with_worker_pool(WorkerPool::current(2).unwrap())
    .with_async_target_resolve(true);
    CalculationNode::new("node-0", services).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_target_resolution_feeds_the_function() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let node = async_resolving_node(&h, Duration::from_millis(20));

    let result = node
        .run_job(job(vec![item("PV", &t, vec![], vec![value("PV", t.clone())])]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.items[0].status, InvocationResult::Success);
    assert_eq!(f.calls(), 1);
    assert_eq!(f.saw_target.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_target_resolution_with_missing_inputs_skips_invocation() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let node = async_resolving_node(&h, Duration::from_millis(20));

    let result = node
        .run_job(job(vec![item("PV", &t, vec![value("Absent", t.clone())], vec![value("PV", t.clone())])]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.items[0].status, InvocationResult::MissingInputs);
    assert_eq!(f.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_target_resolution_failure_is_an_exception() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let missing = trade("T~gone");
    let node = async_resolving_node(&h, Duration::from_millis(5));

    let out = value("PV", missing.clone());
    let result = node
        .run_job(job(vec![item("PV", &missing, vec![], vec![out.clone()])]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.items[0].status, InvocationResult::Exception);
    assert_eq!(
        result.items[0].execution_log.exception.as_ref().unwrap().class_name,
        "InvalidTargetException"
    );
    assert_eq!(f.calls(), 0);
    assert_eq!(h.cached(&out), Some(CacheValue::NotCalculated(NotCalculatedSentinel::EvaluationError)));
}
