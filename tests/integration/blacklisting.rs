use crate::*;

use std::time::Duration;

use calcnode_core::config::{BlacklistConfig, BlacklistPolicyEntry, BlacklistScope};
use calcnode_core::result::InvocationResult;
use calcnode_core::value::NotCalculatedSentinel;
use calcnode_services::blacklist::{self, BlacklistMaintainer, BlacklistPolicy, BlacklistQuery, BlacklistRule, FunctionBlacklist};
use calcnode_services::function::ClosureInvoker;
use calcnode_services::JobExecution;

fn completed(node: &CalculationNode, job: CalculationJob) -> calcnode_core::result::CalculationJobResult {
    match node.execute_job(job).unwrap() {
        JobExecution::Completed(result) => result,
        _ => panic!("expected the job to complete synchronously"),
    }
}

#[test]
fn blacklisted_item_is_never_resolved_or_invoked() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::ProduceAll);
    let t = trade("T~1");
    h.add_target(&t);

    let suppressed = item("PV", &t, vec![], vec![value("PV", t.clone()), value("Delta", t.clone())]);
    let list = Arc::new(FunctionBlacklist::new("manual"));
    list.add_rule(
        BlacklistRule::for_item(BlacklistScope::ExecutionNode, &suppressed),
        Duration::from_secs(60),
    );
    let node = CalculationNode::new(
        "node-0",
        h.services().with_blacklist(BlacklistQuery::Enforcing(list), BlacklistMaintainer::Disabled),
    )
    .unwrap();

    let result = completed(&node, job(vec![suppressed.clone()]));
    assert_eq!(result.items[0].status, InvocationResult::Suppressed);
    assert_eq!(f.calls(), 0);
    assert_eq!(h.targets.calls.load(Ordering::SeqCst), 0);
    for spec in suppressed.output_specifications() {
        assert_eq!(
            h.cached(&spec),
            Some(CacheValue::NotCalculated(NotCalculatedSentinel::Suppressed))
        );
    }
}

#[test]
fn blacklist_during_invocation_suppresses_without_new_rule() {
    let h = Harness::new();
    let f = h.register("PV", Behaviour::Blacklisted);
    let t = trade("T~1");
    h.add_target(&t);

    let list = Arc::new(FunctionBlacklist::new("failures"));
    let maintainer = BlacklistMaintainer::Enforcing {
        blacklist: list.clone(),
        policy: BlacklistPolicy::new([(BlacklistScope::Function, Duration::from_secs(60))]),
    };
    let node = CalculationNode::new("node-0", h.services().with_blacklist(BlacklistQuery::Disabled, maintainer)).unwrap();

    let out = value("PV", t.clone());
    let result = completed(&node, job(vec![item("PV", &t, vec![], vec![out.clone()])]));
    assert_eq!(result.items[0].status, InvocationResult::Suppressed);
    assert_eq!(f.calls(), 1);
    assert!(list.is_empty());
    assert_eq!(
        h.cached(&out),
        Some(CacheValue::NotCalculated(NotCalculatedSentinel::Suppressed))
    );
}

/// A failure recorded in one job suppresses the same item in the next.
#[test]
fn failure_blacklists_item_for_later_jobs() {
    let h = Harness::new();
    let f = h.register("Broken", Behaviour::Fail);
    let t = trade("T~1");
    h.add_target(&t);

    let config = BlacklistConfig {
        enabled: true,
        policy: vec![BlacklistPolicyEntry {
            scope: BlacklistScope::PartialNode,
            activation_secs: 300,
        }],
    };
    let (query, maintainer) = blacklist::from_config(&config, "node-0");
    let node = CalculationNode::new("node-0", h.services().with_blacklist(query, maintainer)).unwrap();

    let failing = item("Broken", &t, vec![], vec![value("X", t.clone())]);
    let first = completed(&node, job(vec![failing.clone()]));
    assert_eq!(first.items[0].status, InvocationResult::Exception);

    let second = completed(&node, job(vec![failing]));
    assert_eq!(second.items[0].status, InvocationResult::Suppressed);
    assert_eq!(f.calls(), 1);

    // A different target is outside the partial-node rule.
    let other = trade("T~2");
    h.add_target(&other);
    let third = completed(&node, job(vec![item("Broken", &other, vec![], vec![value("X", other.clone())])]));
    assert_eq!(third.items[0].status, InvocationResult::Exception);
    assert_eq!(f.calls(), 2);
}

#[test]
fn disabled_blacklist_never_suppresses() {
    let h = Harness::new();
    let f = h.register("Broken", Behaviour::Fail);
    let t = trade("T~1");
    h.add_target(&t);
    let (query, maintainer) = blacklist::from_config(&BlacklistConfig::default(), "node-0");
    let node = CalculationNode::new("node-0", h.services().with_blacklist(query, maintainer)).unwrap();

    let failing = item("Broken", &t, vec![], vec![value("X", t.clone())]);
    for _ in 0..3 {
        let result = completed(&node, job(vec![failing.clone()]));
        assert_eq!(result.items[0].status, InvocationResult::Exception);
    }
    assert_eq!(f.calls(), 3);
}

/// An invoker with no result set fails its item but adds no blacklist rule.
#[test]
fn missing_result_set_is_not_blacklisted() {
    let h = Harness::new();
    h.functions.register(
        "Empty",
        Arc::new(ClosureInvoker::new(|_, _, _, _| Err(InvocationError::NoResult))),
    );
    let t = trade("T~1");
    h.add_target(&t);

    let list = Arc::new(FunctionBlacklist::new("failures"));
    let maintainer = BlacklistMaintainer::Enforcing {
        blacklist: list.clone(),
        policy: BlacklistPolicy::new([(BlacklistScope::Function, Duration::from_secs(60))]),
    };
    let node = CalculationNode::new("node-0", h.services().with_blacklist(BlacklistQuery::Disabled, maintainer)).unwrap();

    let out = value("PV", t.clone());
    let result = completed(&node, job(vec![item("Empty", &t, vec![], vec![out.clone()])]));
    assert_eq!(result.items[0].status, InvocationResult::Exception);
    assert_eq!(
        result.items[0].execution_log.exception.as_ref().unwrap().class_name,
        "InvalidInvocationException"
    );
    assert!(list.is_empty());
    assert_eq!(
        h.cached(&out),
        Some(CacheValue::NotCalculated(NotCalculatedSentinel::EvaluationError))
    );
    assert_eq!(h.statistics.invocations(CONFIG, "Empty"), 0);
}
