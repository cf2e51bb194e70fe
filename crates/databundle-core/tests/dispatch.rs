use databundle_core::mock::{MockBundle, RecordingLauncher};
use databundle_core::{
    CoreError, Dispatcher, FatalMode, HookContext, OperationRegistry, RunOptions, StateMachine,
};
use databundle_store::ConfigStore;
use serde_json::{json, Value};

/// Appends its argument list to `test.calls` in the bundle's session.
fn record(ctx: &mut HookContext<'_>, args: &[Value]) -> Result<(), CoreError> {
    let session = ctx.handle.session();
    let mut calls = session.get_or("test", "calls", json!([]));
    if let Value::Array(list) = &mut calls {
        list.push(Value::Array(args.to_vec()));
    }
    session.set("test", "calls", calls);
    Ok(())
}

fn setup() -> (StateMachine<MockBundle>, RecordingLauncher) {
    let launcher = RecordingLauncher::new();
    let mut registry = OperationRegistry::new();
    registry.register("record", record);
    let m = StateMachine::new(MockBundle::new("/bundles/rates"), RunOptions::default())
        .with_dispatcher(Dispatcher::new(registry, Box::new(launcher.clone())))
        .with_fatal_mode(FatalMode::Raise);
    (m, launcher)
}

fn recorded(m: &StateMachine<MockBundle>) -> Value {
    m.handle().store().get("test", "calls").unwrap_or(json!([]))
}

#[test]
fn empty_argument_list_is_a_no_op() {
    let (mut m, launcher) = setup();
    for degree in [0, 1, 4] {
        m.run_parallel("record", Vec::new(), degree).unwrap();
    }
    assert_eq!(recorded(&m), json!([]));
    assert!(launcher.requests().is_empty());
}

#[test]
fn empty_argument_list_ignores_unknown_operations() {
    let (mut m, _) = setup();
    m.run_parallel("missing", Vec::new(), 2).unwrap();
}

#[test]
fn serial_mode_runs_in_process_in_order() {
    let (mut m, launcher) = setup();
    m.run_parallel("record", vec![json!("a"), json!("b"), json!("c")], 1)
        .unwrap();
    assert_eq!(recorded(&m), json!([["a"], ["b"], ["c"]]));
    assert!(launcher.requests().is_empty());
}

#[test]
fn scalars_become_single_element_argument_lists() {
    let (mut m, launcher) = setup();
    m.run_parallel("record", vec![json!(5), json!(6)], 1).unwrap();
    assert_eq!(recorded(&m), json!([[5], [6]]));

    m.run_parallel("record", vec![json!(5), json!(6)], 3).unwrap();
    let mut args: Vec<Vec<Value>> = launcher.requests().into_iter().map(|r| r.args).collect();
    args.sort_by_key(|a| a[0].as_i64());
    assert_eq!(args, vec![vec![json!(5)], vec![json!(6)]]);
}

#[test]
fn arrays_are_passed_as_positional_arguments() {
    let (mut m, _) = setup();
    m.run_parallel("record", vec![json!(["rates", 2010])], 1)
        .unwrap();
    assert_eq!(recorded(&m), json!([["rates", 2010]]));
}

#[test]
fn parallel_requests_carry_directory_and_options() {
    let (mut m, launcher) = setup();
    m.run_parallel("record", vec![json!(1), json!(2), json!(3)], 2)
        .unwrap();

    let requests = launcher.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.operation, "record");
        assert_eq!(request.directory.to_str(), Some("/bundles/rates"));
        assert_eq!(request.options, RunOptions::default());
    }
    assert_eq!(recorded(&m), json!([]));
}

#[test]
fn failing_workers_surface_after_every_request() {
    let launcher = RecordingLauncher::failing();
    let mut registry = OperationRegistry::new();
    registry.register("record", record);
    let mut m = StateMachine::new(MockBundle::new("/bundles/rates"), RunOptions::default())
        .with_dispatcher(Dispatcher::new(registry, Box::new(launcher.clone())))
        .with_fatal_mode(FatalMode::Raise);

    let err = m
        .run_parallel("record", vec![json!(1), json!(2)], 2)
        .unwrap_err();
    assert!(matches!(err, CoreError::WorkerFailed { failed: 2, total: 2 }));
    assert_eq!(launcher.requests().len(), 2);
}

#[test]
fn unknown_operation_is_rejected() {
    let (mut m, launcher) = setup();
    let err = m.run_parallel("missing", vec![json!(1)], 1).unwrap_err();
    assert!(matches!(err, CoreError::UnknownOperation(ref id) if id == "missing"));
    assert!(launcher.requests().is_empty());
}
