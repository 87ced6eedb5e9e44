use crate::*;

use std::sync::Arc;

use calcnode_core::result::InvocationResult;
use calcnode_core::value::{CacheSelectHint, CacheValue, ComputationTargetSpecification, ComputedValue, NotCalculatedSentinel, ValueSpecification};
use calcnode_services::blacklist::{BlacklistMaintainer, BlacklistPolicy, BlacklistQuery, FunctionBlacklist};
use calcnode_services::function::{
    ClosureInvoker, DependentValueSpecificationQuery, DependentValueSpecificationReply,
    DependentValueSpecificationRequest, InvocationError,
};
use calcnode_services::value_cache::{CacheSection, ViewComputationCache};
use calcnode_services::{CalculationNode, JobExecution};
use calcnode_core::config::BlacklistScope;
use std::time::Duration;

fn sentinel(s: NotCalculatedSentinel) -> Option<CacheValue> {
    Some(CacheValue::NotCalculated(s))
}

/// One result per item, in item order.
#[test]
fn results_match_items_in_order() {
    let h = Harness::new();
    h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);

    let items = vec![
        item("PV", &t, vec![], vec![value("A", t.clone())]),
        item("Unknown", &t, vec![], vec![value("B", t.clone())]),
        item("PV", &t, vec![value("Missing", t.clone())], vec![value("C", t.clone())]),
        item("PV", &t, vec![value("A", t.clone())], vec![value("D", t.clone())]),
    ];
    let result = match h.node().execute_job(job(items)).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("direct-write synchronous job should complete"),
    };

    let statuses: Vec<InvocationResult> = result.items.iter().map(|i| i.status).collect();
    assert_eq!(
        statuses,
        vec![
            InvocationResult::Success,
            InvocationResult::Exception,
            InvocationResult::MissingInputs,
            InvocationResult::Success,
        ]
    );
    assert_eq!(
        result.items[1].execution_log.exception.as_ref().unwrap().class_name,
        "InvalidFunctionException"
    );
    assert_eq!(result.compute_node_id, "node-0");
    assert_eq!(result.specification, job_spec(1));
}

/// Cancelling before item k: nothing from k on runs or is written.
#[test]
fn cancellation_stops_before_next_item() {
    let h = Harness::new();
    let later = h.register("Later", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);

    let first = vec![value("First", t.clone())];
    let rest = vec![value("Second", t.clone()), value("Third", t.clone())];
    let job = job(vec![
        item("CancelsJob", &t, vec![], first.clone()),
        item("Later", &t, vec![], vec![rest[0].clone()]),
        item("Later", &t, vec![], vec![rest[1].clone()]),
    ]);

    let flag = job.cancellation();
    h.functions.register(
        "CancelsJob",
        Arc::new(ClosureInvoker::new(move |_, _, inputs, desired| {
            flag.cancel();
            Ok(produce_all(inputs, desired))
        })),
    );

    let node = h.node();
    assert!(matches!(node.execute_job(job).unwrap(), JobExecution::Cancelled));
    assert_eq!(later.calls(), 0);
    assert!(h.cached(&first[0]).is_some());
    for spec in &rest {
        assert!(h.cached(spec).is_none());
    }
    assert_eq!(node.status().jobs_cancelled, 1);
    assert!(!node.is_busy());
}

#[test]
fn cancelled_before_start_yields_no_result() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let job = job(vec![item("PV", &t, vec![], vec![value("PV", t.clone())])]);
    job.cancel();

    assert!(matches!(h.node().execute_job(job).unwrap(), JobExecution::Cancelled));
    assert_eq!(f.calls(), 0);
}

/// Every declared output ends up in the cache, whatever the status.
#[test]
fn declared_outputs_always_covered() {
    let h = Harness::new();
    h.register("Ok", Behaviour::ProduceAll);
    h.register("Partial", Behaviour::ProduceNone);
    h.register("Fails", Behaviour::Fail);
    h.register("Skipped", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);

    let blacklist = Arc::new(FunctionBlacklist::new("test"));
    blacklist.add_rule(
        calcnode_services::blacklist::BlacklistRule {
            function_id: Some("Skipped".into()),
            ..Default::default()
        },
        Duration::from_secs(60),
    );
    let services = h
        .services()
        .with_blacklist(BlacklistQuery::Enforcing(blacklist), BlacklistMaintainer::Disabled);
    let node = CalculationNode::new("node-0", services).unwrap();

    let outputs = |prefix: &str| vec![value(&format!("{prefix}-1"), t.clone()), value(&format!("{prefix}-2"), t.clone())];
    let items = vec![
        item("Ok", &t, vec![], outputs("ok")),
        item("Partial", &t, vec![], outputs("partial")),
        item("Fails", &t, vec![], outputs("fails")),
        item("Skipped", &t, vec![], outputs("skipped")),
        item("Ok", &t, vec![value("Absent", t.clone())], outputs("missing")),
        item("Unknown", &t, vec![], outputs("unknown")),
        item("Ok", &trade("T~unresolvable"), vec![], outputs("target")),
    ];
    let job = job(items.clone());
    let result = match node.execute_job(job).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    assert_eq!(result.items.len(), items.len());

    for job_item in &items {
        for spec in job_item.output_specifications() {
            assert!(h.cached(&spec).is_some(), "{spec} not covered");
        }
    }

    assert_eq!(h.cached(&value("ok-1", t.clone())), Some(CacheValue::Value(serde_json::json!(0))));
    assert_eq!(h.cached(&value("partial-1", t.clone())), sentinel(NotCalculatedSentinel::EvaluationError));
    assert_eq!(result.items[1].status, InvocationResult::Success);
    assert_eq!(result.items[1].missing_outputs.len(), 2);
    assert_eq!(h.cached(&value("fails-1", t.clone())), sentinel(NotCalculatedSentinel::EvaluationError));
    assert_eq!(h.cached(&value("skipped-1", t.clone())), sentinel(NotCalculatedSentinel::Suppressed));
    assert_eq!(h.cached(&value("missing-1", t.clone())), sentinel(NotCalculatedSentinel::MissingInputs));
    assert_eq!(h.cached(&value("unknown-1", t.clone())), sentinel(NotCalculatedSentinel::EvaluationError));
    assert_eq!(h.cached(&value("target-1", t.clone())), sentinel(NotCalculatedSentinel::EvaluationError));
}

/// Two required inputs, one cached: no invocation, MissingInputs sentinels.
#[test]
fn missing_inputs_skip_invocation() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let present = value("Market", t.clone());
    let absent = value("Curve", t.clone());
    h.seed(&present, serde_json::json!(101.5));

    let outputs = vec![value("PV", t.clone()), value("Delta", t.clone())];
    let job = job(vec![item("PV", &t, vec![present, absent.clone()], outputs.clone())]);
    let result = match h.node().execute_job(job).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };

    let item_result = &result.items[0];
    assert_eq!(item_result.status, InvocationResult::MissingInputs);
    assert_eq!(f.calls(), 0);
    assert_eq!(item_result.missing_inputs.iter().collect::<Vec<_>>(), vec![&absent]);
    for spec in &outputs {
        assert_eq!(h.cached(spec), sentinel(NotCalculatedSentinel::MissingInputs));
    }
}

#[test]
fn sentinel_inputs_count_as_missing() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let upstream = value("Market", t.clone());
    h.store()
        .put(
            CacheSection::Shared,
            &[ComputedValue::new(upstream.clone(), NotCalculatedSentinel::EvaluationError)],
        )
        .unwrap();

    let job = job(vec![item("PV", &t, vec![upstream], vec![value("PV", t.clone())])]);
    let result = match h.node().execute_job(job).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    assert_eq!(result.items[0].status, InvocationResult::MissingInputs);
    assert_eq!(f.calls(), 0);
}

#[test]
fn tolerant_function_runs_with_partial_inputs() {
    let h = Harness::new();
    let f = h.register_tolerant("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let present = value("Market", t.clone());
    h.seed(&present, serde_json::json!(1));

    let out = value("PV", t.clone());
    let job = job(vec![item("PV", &t, vec![present, value("Curve", t.clone())], vec![out.clone()])]);
    let result = match h.node().execute_job(job).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    assert_eq!(result.items[0].status, InvocationResult::PartialInputs);
    assert_eq!(result.items[0].missing_inputs.len(), 1);
    assert_eq!(f.calls(), 1);
    // The function saw one input.
    assert_eq!(h.cached(&out), Some(CacheValue::Value(serde_json::json!(1))));
}

/// [Success, Exception, Success], with the failure blacklisted exactly once.
#[test]
fn failing_middle_item_does_not_abort_job() {
    let h = Harness::new();
    h.register("First", Behaviour::ProduceAll);
    h.register("Broken", Behaviour::Fail);
    h.register("Third", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);

    let blacklist = Arc::new(FunctionBlacklist::new("failures"));
    let maintainer = BlacklistMaintainer::Enforcing {
        blacklist: blacklist.clone(),
        policy: BlacklistPolicy::new([(BlacklistScope::ExecutionNode, Duration::from_secs(60))]),
    };
    let node = CalculationNode::new(
        "node-0",
        h.services().with_blacklist(BlacklistQuery::Disabled, maintainer),
    )
    .unwrap();

    let broken_outputs = vec![value("X", t.clone()), value("Y", t.clone())];
    let items = vec![
        item("First", &t, vec![], vec![value("A", t.clone())]),
        item("Broken", &t, vec![value("A", t.clone())], broken_outputs.clone()),
        item("Third", &t, vec![], vec![value("C", t.clone())]),
    ];
    let result = match node.execute_job(job(items.clone())).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };

    let statuses: Vec<InvocationResult> = result.items.iter().map(|i| i.status).collect();
    assert_eq!(
        statuses,
        vec![InvocationResult::Success, InvocationResult::Exception, InvocationResult::Success]
    );
    for spec in &broken_outputs {
        assert_eq!(h.cached(spec), sentinel(NotCalculatedSentinel::EvaluationError));
    }
    let exception = result.items[1].execution_log.exception.clone().unwrap();
    assert_eq!(exception.class_name, "RuntimeException");
    assert_eq!(exception.message.as_deref(), Some("boom"));

    let entries = blacklist.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].rule.matches(&items[1]));
    assert!(!entries[0].rule.matches(&items[0]));
    assert!(!entries[0].rule.matches(&items[2]));
}

/// A panicking function fails its own item only.
#[test]
fn panicking_function_is_an_item_exception() {
    let h = Harness::new();
    h.register("PV", Behaviour::ProduceAll);
    h.functions.register(
        "Panics",
        Arc::new(ClosureInvoker::new(|_, _, _, _| panic!("index out of range"))),
    );
    let t = trade("T~1");
    h.add_target(&t);

    let blacklist = Arc::new(FunctionBlacklist::new("failures"));
    let maintainer = BlacklistMaintainer::Enforcing {
        blacklist: blacklist.clone(),
        policy: BlacklistPolicy::new([(BlacklistScope::Function, Duration::from_secs(60))]),
    };
    let node = CalculationNode::new(
        "node-0",
        h.services().with_blacklist(BlacklistQuery::Disabled, maintainer),
    )
    .unwrap();

    let panicked = value("X", t.clone());
    let items = vec![
        item("PV", &t, vec![], vec![value("A", t.clone())]),
        item("Panics", &t, vec![], vec![panicked.clone()]),
        item("PV", &t, vec![], vec![value("C", t.clone())]),
    ];
    let result = match node.execute_job(job(items)).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };

    let statuses: Vec<InvocationResult> = result.items.iter().map(|i| i.status).collect();
    assert_eq!(
        statuses,
        vec![InvocationResult::Success, InvocationResult::Exception, InvocationResult::Success]
    );
    let exception = result.items[1].execution_log.exception.clone().unwrap();
    assert_eq!(exception.class_name, "Panic");
    assert_eq!(exception.message.as_deref(), Some("index out of range"));
    assert_eq!(h.cached(&panicked), sentinel(NotCalculatedSentinel::EvaluationError));
    assert!(h.cached(&value("C", t.clone())).is_some());
    assert_eq!(blacklist.len(), 1);
    assert!(!node.is_busy());
    assert_eq!(node.status().jobs_completed, 1);
}

#[test]
fn unresolvable_target_is_an_exception() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let missing = trade("T~gone");
    let out = value("PV", missing.clone());

    let result = match h.node().execute_job(job(vec![item("PV", &missing, vec![], vec![out.clone()])])).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    assert_eq!(result.items[0].status, InvocationResult::Exception);
    assert_eq!(
        result.items[0].execution_log.exception.as_ref().unwrap().class_name,
        "InvalidTargetException"
    );
    assert_eq!(f.calls(), 0);
    assert_eq!(h.cached(&out), sentinel(NotCalculatedSentinel::EvaluationError));
}

#[test]
fn unresolvable_target_is_a_missing_input_for_tolerant_functions() {
    let h = Harness::new();
    let f = h.register_tolerant("PV", Behaviour::ProduceAll);
    let missing = trade("T~gone");

    let result = match h.node().execute_job(job(vec![item("PV", &missing, vec![], vec![value("PV", missing.clone())])])).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    assert_eq!(result.items[0].status, InvocationResult::PartialInputs);
    assert!(result.items[0]
        .missing_inputs
        .contains(&ValueSpecification::target_sourcing(&missing)));
    assert_eq!(f.calls(), 1);
    assert_eq!(f.saw_target.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[test]
fn undeclared_outputs_are_dropped() {
    let h = Harness::new();
    h.register("PV", Behaviour::ProduceExtra);
    let out = value("PV", ComputationTargetSpecification::null());

    let result = match h.node().execute_job(job(vec![item("PV", &ComputationTargetSpecification::null(), vec![], vec![out.clone()])])).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    assert_eq!(result.items[0].status, InvocationResult::Success);
    assert!(h.cached(&out).is_some());
    assert!(h.cached(&value("Extra", ComputationTargetSpecification::null())).is_none());
}

#[test]
fn later_items_read_earlier_outputs() {
    let h = Harness::new();
    h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let a = value("A", t.clone());
    let b = value("B", t.clone());

    let result = match h
        .node()
        .execute_job(job(vec![item("PV", &t, vec![], vec![a.clone()]), item("PV", &t, vec![a], vec![b.clone()])]))
        .unwrap()
    {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    assert!(result.items.iter().all(|i| i.status == InvocationResult::Success));
    assert_eq!(h.cached(&b), Some(CacheValue::Value(serde_json::json!(1))));
}

#[test]
fn private_outputs_go_to_private_section() {
    let h = Harness::new();
    h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);
    let private = value("Intermediate", t.clone());
    let shared = value("PV", t.clone());

    let job = calcnode_core::job::CalculationJob::new(
        job_spec(2),
        vec![item("PV", &t, vec![], vec![private.clone(), shared.clone()])],
        CacheSelectHint::private_values([private.clone()]),
    );
    assert!(matches!(h.node().execute_job(job).unwrap(), JobExecution::Completed(_)));
    assert!(h.store().get(CacheSection::Private, &private).is_some());
    assert!(h.store().get(CacheSection::Shared, &private).is_none());
    assert!(h.store().get(CacheSection::Shared, &shared).is_some());
}

#[test]
fn full_log_mode_keeps_function_events() {
    let h = Harness::new();
    h.functions.register(
        "Chatty",
        Arc::new(ClosureInvoker::new(|ctx, _, inputs, desired| {
            ctx.log().info("pricing");
            ctx.log().warn("stale market data");
            Ok(produce_all(inputs, desired))
        })),
    );
    let mut job_item = item("Chatty", &ComputationTargetSpecification::null(), vec![], vec![value("PV", ComputationTargetSpecification::null())]);
    job_item.log_mode = calcnode_core::log::ExecutionLogMode::Full;

    let result = match h.node().execute_job(job(vec![job_item])).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected completion"),
    };
    let events = result.items[0].execution_log.events.clone().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].message, "stale market data");
}

struct Coordinator;

impl DependentValueSpecificationQuery for Coordinator {
    fn query(
        &self,
        request: DependentValueSpecificationRequest,
    ) -> Result<DependentValueSpecificationReply, InvocationError> {
        assert_eq!(request.job.job_id, 1);
        Ok(DependentValueSpecificationReply {
            correlation_id: request.correlation_id,
            specifications: [
                value("A", ComputationTargetSpecification::null()),
                value("B", ComputationTargetSpecification::null()),
            ]
            .into_iter()
            .collect(),
        })
    }
}

#[test]
fn functions_can_query_dependent_specifications() {
    let h = Harness::new();
    h.functions.register(
        "Dependents",
        Arc::new(ClosureInvoker::new(|ctx, _, _, desired| {
            let count = ctx.dependent_value_specifications()?.len();
            Ok(desired
                .iter()
                .map(|spec| ComputedValue::new(spec.clone(), serde_json::json!(count)))
                .collect())
        })),
    );
    let node = CalculationNode::new("node-0", h.services().with_dependent_query(Arc::new(Coordinator))).unwrap();
    let out = value("Count", ComputationTargetSpecification::null());

    assert!(matches!(
        node.execute_job(job(vec![item("Dependents", &ComputationTargetSpecification::null(), vec![], vec![out.clone()])])).unwrap(),
        JobExecution::Completed(_)
    ));
    assert_eq!(h.cached(&out), Some(CacheValue::Value(serde_json::json!(2))));
}

#[test]
fn watchdog_flags_slow_items_and_disarms() {
    use calcnode_services::watchdog::{ExecutionWatchdog, OverrunItem, WatchdogAction};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Count(AtomicUsize);
    impl WatchdogAction for Count {
        fn on_timeout(&self, _overrun: &OverrunItem) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let h = Harness::new();
    h.functions.register(
        "Slow",
        Arc::new(ClosureInvoker::new(|_, _, inputs, desired| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(produce_all(inputs, desired))
        })),
    );
    let action = Arc::new(Count::default());
    let watchdog = ExecutionWatchdog::new(Duration::from_millis(1), action.clone());
    let node = CalculationNode::new("node-0", h.services().with_watchdog(watchdog.clone())).unwrap();

    let checker = {
        let watchdog = watchdog.clone();
        std::thread::spawn(move || {
            for _ in 0..40 {
                watchdog.check();
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    };
    let result = node.execute_job(job(vec![item(
        "Slow",
        &ComputationTargetSpecification::null(),
        vec![],
        vec![value("PV", ComputationTargetSpecification::null())],
    )]));
    checker.join().unwrap();

    assert!(matches!(result.unwrap(), JobExecution::Completed(_)));
    assert_eq!(action.0.load(Ordering::SeqCst), 1);
    assert_eq!(watchdog.armed_count(), 0);
}
