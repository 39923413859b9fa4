//! Gate pipeline behaviour inside a full run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use convoy::core::TaskState;
use convoy::orchestration::{
    AttemptPayload, Coordinator, FnGate, GatePipeline, GateVerdict, NonEmptyOutput,
    OutputMatches, ResourceBudget,
};

use crate::fixtures::{config, test_task, ScriptedSpawner, Step};

fn coordinator(spawner: Arc<ScriptedSpawner>, gates: GatePipeline) -> Coordinator {
    Coordinator::new(config(2), spawner).with_gates(gates)
}

/// Test: Gate failure is terminal
/// Given A succeeds but one of its two gates fails
/// When the run completes
/// Then A is Failed with no further attempts
#[tokio::test(start_paused = true)]
async fn test_gate_failure_not_retried() {
    let spawner = ScriptedSpawner::new().into_arc();
    let gates = GatePipeline::new()
        .with_gate(NonEmptyOutput)
        .with_gate(FnGate::new("review", |_: &AttemptPayload| {
            Ok(GateVerdict::fail("changes requested"))
        }));
    let mut coordinator = coordinator(spawner.clone(), gates);
    coordinator
        .add_agent(test_task("a").with_max_retries(2))
        .unwrap();
    coordinator.add_agent(test_task("b").depends_on("a")).unwrap();

    coordinator.execute(&CancellationToken::new()).await.unwrap();

    assert_eq!(spawner.calls("a"), 1);
    assert_eq!(
        coordinator.task_state(&"a".into()),
        Some(&TaskState::Failed {
            reason: "gate failure: review".into()
        })
    );
    assert_eq!(
        coordinator.task_state(&"b".into()),
        Some(&TaskState::Blocked { by: "a".into() })
    );
}

/// Test: Gate pass rates
/// Given 4 tasks with resource usage 5, 10, 20 and 40 and a budget of 15
/// Then the budget gate passes half the time and the output gate always
#[tokio::test(start_paused = true)]
async fn test_gate_pass_rates() {
    let mut spawner = ScriptedSpawner::new();
    for (id, units) in [("a", 5), ("b", 10), ("c", 20), ("d", 40)] {
        spawner = spawner.script(
            id,
            vec![Step::SucceedWith(
                AttemptPayload::new("work done").with_resource_units(units),
            )],
        );
    }
    let spawner = spawner.into_arc();
    let gates = GatePipeline::new()
        .with_gate(NonEmptyOutput)
        .with_gate(ResourceBudget::new(15));
    let mut coordinator = coordinator(spawner, gates);
    for id in ["a", "b", "c", "d"] {
        coordinator.add_agent(test_task(id)).unwrap();
    }

    coordinator.execute(&CancellationToken::new()).await.unwrap();

    let metrics = coordinator.metrics();
    assert_eq!(metrics.gate_pass_rates["non_empty_output"], 1.0);
    assert_eq!(metrics.gate_pass_rates["resource_budget"], 0.5);
    assert_eq!(metrics.success_count, 2);
    assert_eq!(metrics.failure_count, 2);
    assert_eq!(metrics.gate_failure_count, 2);
}

/// Test: Every gate runs even after one fails
#[tokio::test(start_paused = true)]
async fn test_all_gates_evaluated() {
    let evaluated = Arc::new(AtomicUsize::new(0));
    let counter = evaluated.clone();
    let spawner = ScriptedSpawner::new()
        .with_default(Step::SucceedWith(AttemptPayload::new("   ")))
        .into_arc();
    let gates = GatePipeline::new()
        .with_gate(NonEmptyOutput)
        .with_gate(FnGate::new("audit", move |_: &AttemptPayload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(GateVerdict::pass("logged"))
        }));
    let mut coordinator = coordinator(spawner, gates);
    coordinator.add_agent(test_task("a")).unwrap();

    let outcomes = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = outcomes.clone();
    coordinator.on_failure(move |outcome| {
        seen.lock().unwrap().push(outcome.clone());
        Ok(())
    });

    coordinator.execute(&CancellationToken::new()).await.unwrap();

    assert_eq!(evaluated.load(Ordering::SeqCst), 1);
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    let gates: Vec<_> = outcomes[0].gate_results().map(|g| (g.name.clone(), g.passed)).collect();
    assert_eq!(
        gates,
        vec![
            ("non_empty_output".to_string(), false),
            ("audit".to_string(), true)
        ]
    );
}

/// Test: Fail-fast gate skips the rest
#[tokio::test(start_paused = true)]
async fn test_fail_fast_gate() {
    let evaluated = Arc::new(AtomicUsize::new(0));
    let counter = evaluated.clone();
    let spawner = ScriptedSpawner::new().into_arc();
    let gates = GatePipeline::new()
        .with_gate(
            FnGate::new("build", |_: &AttemptPayload| Ok(GateVerdict::fail("does not compile")))
                .fail_fast(),
        )
        .with_gate(FnGate::new("tests", move |_: &AttemptPayload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(GateVerdict::pass("ok"))
        }));
    let mut coordinator = coordinator(spawner, gates);
    coordinator.add_agent(test_task("a")).unwrap();

    coordinator.execute(&CancellationToken::new()).await.unwrap();

    assert_eq!(evaluated.load(Ordering::SeqCst), 0);
    let metrics = coordinator.metrics();
    assert_eq!(metrics.gate_pass_rates.get("build"), Some(&0.0));
    assert!(!metrics.gate_pass_rates.contains_key("tests"));
}

/// Test: Output pattern gate
#[tokio::test(start_paused = true)]
async fn test_output_matches_gate() {
    let spawner = ScriptedSpawner::new()
        .script(
            "good",
            vec![Step::SucceedWith(AttemptPayload::new("test result: ok. 4 passed"))],
        )
        .script(
            "bad",
            vec![Step::SucceedWith(AttemptPayload::new("test result: FAILED"))],
        )
        .into_arc();
    let gates = GatePipeline::new()
        .with_gate(OutputMatches::new("tests_pass", r"test result: ok").unwrap());
    let mut coordinator = coordinator(spawner, gates);
    coordinator.add_agent(test_task("good")).unwrap();
    coordinator.add_agent(test_task("bad")).unwrap();

    coordinator.execute(&CancellationToken::new()).await.unwrap();

    assert_eq!(coordinator.task_state(&"good".into()), Some(&TaskState::Succeeded));
    assert!(matches!(
        coordinator.task_state(&"bad".into()),
        Some(TaskState::Failed { .. })
    ));
    assert_eq!(coordinator.metrics().gate_pass_rates["tests_pass"], 0.5);
}

/// Test: A panicking gate fails only its task
/// Given a gate that panics on A's output and two independent tasks
/// When the run completes
/// Then A is Failed on that gate, B still succeeds and the run returns Ok
#[tokio::test(start_paused = true)]
async fn test_panicking_gate_fails_task() {
    let spawner = ScriptedSpawner::new()
        .script("a", vec![Step::SucceedWith(AttemptPayload::new("explode"))])
        .into_arc();
    let gates = GatePipeline::new().with_gate(FnGate::new(
        "boom",
        |payload: &AttemptPayload| -> Result<GateVerdict, String> {
            if payload.output == "explode" {
                panic!("gate bug");
            }
            Ok(GateVerdict::pass("fine"))
        },
    ));
    let mut coordinator = coordinator(spawner, gates);
    coordinator.add_agent(test_task("a")).unwrap();
    coordinator.add_agent(test_task("b")).unwrap();

    coordinator.execute(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        coordinator.task_state(&"a".into()),
        Some(&TaskState::Failed {
            reason: "gate failure: boom".into()
        })
    );
    assert_eq!(coordinator.task_state(&"b".into()), Some(&TaskState::Succeeded));
    let metrics = coordinator.metrics();
    assert_eq!(metrics.success_count + metrics.failure_count, metrics.total_agents);
    assert_eq!(metrics.gate_pass_rates["boom"], 0.5);
}
