//! Integration tests for the task runner.
//!
//! These cover loop fan-out and ordering, tag selection, conditionals,
//! check and diff mode, retry/until polling, result overrides, failure
//! isolation, concurrency bounds, cancellation and background jobs.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use common::*;
use converge::executor::async_jobs::AsyncJobStatus;
use converge::executor::runner::{RunnerConfig, TaskRunner};
use converge::executor::task::{Task, TaskStatus};
use converge::executor::RunContext;
use converge::inventory::Host;
use converge::modules::{Diff, ModuleOutput};
use converge::Error;

fn no_vars() -> indexmap::IndexMap<String, serde_json::Value> {
    indexmap::IndexMap::new()
}

// ============================================================================
// Loop fan-out
// ============================================================================

#[tokio::test]
async fn test_loop_results_in_host_then_item_order() {
    let runner = runner_with(&[]);
    let task = Task::new("greet", "debug")
        .arg("msg", "{{ inventory_hostname }}-{{ item }}")
        .loop_over(vec![json!("a"), json!("b"), json!("c")]);

    let results = runner
        .run(&RunContext::new(), &task, &hosts(&["h1", "h2"]), &no_vars())
        .await
        .unwrap();

    let messages: Vec<&str> = results.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(
        messages,
        vec!["h1-a", "h1-b", "h1-c", "h2-a", "h2-b", "h2-c"]
    );
    assert!(results.iter().all(|r| r.success));
    assert_eq!(results[0].data["ansible_loop"]["first"], true);
    assert_eq!(results[2].data["ansible_loop"]["last"], true);
    assert_eq!(results[4].data["item"], "b");
    assert_eq!(results[4].data["ansible_loop"]["index1"], 2);
}

#[tokio::test]
async fn test_loop_over_variable_and_custom_loop_var() {
    let runner = runner_with(&[]);
    let task = Task::new("pkgs", "debug")
        .arg("msg", "install {{ pkg }} at {{ idx }}")
        .loop_expr("{{ packages }}")
        .loop_var("pkg")
        .index_var("idx");

    let results = runner
        .run(
            &RunContext::new(),
            &task,
            &hosts(&["h1"]),
            &vars(json!({"packages": ["nginx", "redis"]})),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].message, "install nginx at 0");
    assert_eq!(results[1].message, "install redis at 1");
    assert_eq!(results[1].data["pkg"], "redis");
}

#[tokio::test]
async fn test_with_items_and_range() {
    let runner = runner_with(&[]);

    let mut task = Task::new("legacy", "debug").arg("msg", "{{ item }}");
    task.with_items = Some(json!(["x", "y"]));
    let results = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].message, "y");

    let task = Task::new("range", "debug")
        .arg("msg", "n={{ item }}")
        .loop_expr("1-3");
    let results = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();
    let messages: Vec<&str> = results.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, vec!["n=1", "n=2", "n=3"]);
}

#[tokio::test]
async fn test_empty_loop_yields_no_results() {
    let module = MockModule::new("ping");
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("nothing", "ping").loop_over(Vec::new());

    let results = runner
        .run(&RunContext::new(), &task, &hosts(&["h1", "h2"]), &no_vars())
        .await
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(module.calls(), 0);
}

#[tokio::test]
async fn test_empty_host_list() {
    let runner = runner_with(&[]);
    let task = Task::new("noop", "debug");
    let results = runner
        .run(&RunContext::new(), &task, &[], &no_vars())
        .await
        .unwrap();
    assert!(results.is_empty());
}

// ============================================================================
// Structural errors
// ============================================================================

#[tokio::test]
async fn test_undefined_loop_variable_is_structural() {
    let module = MockModule::new("ping");
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("bad loop", "ping").loop_expr("{{ missing }}");

    let err = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::LoopExpression { .. }));
    assert!(err.is_structural());
    assert_eq!(module.calls(), 0);
}

#[tokio::test]
async fn test_missing_required_argument_is_structural() {
    let module = MockModule::new("needs_path").with_required_params(vec!["path"]);
    let runner = runner_with(&[module.clone()]);

    let err = runner
        .run(
            &RunContext::new(),
            &Task::new("no path", "needs_path"),
            &hosts(&["h1"]),
            &no_vars(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ModuleArgs { .. }));
    assert_eq!(module.calls(), 0);
}

// ============================================================================
// Tags
// ============================================================================

#[tokio::test]
async fn test_tag_selection() {
    let module = MockModule::new("ping");
    let mut runner = runner_with(&[module.clone()]);
    runner.set_tags(vec!["web".to_string()]);
    let h = hosts(&["h1"]);
    let ctx = RunContext::new();

    let web = Task::new("web", "ping").tag("web");
    let db = Task::new("db", "ping").tag("db");
    let untagged = Task::new("untagged", "ping");
    let always = Task::new("always", "ping").tag("always");

    let r = runner.run(&ctx, &web, &h, &no_vars()).await.unwrap();
    assert!(!r[0].is_skipped());

    let r = runner.run(&ctx, &db, &h, &no_vars()).await.unwrap();
    assert!(r[0].is_skipped());
    assert_eq!(r[0].data["skip_reason"], "tags");

    let r = runner.run(&ctx, &untagged, &h, &no_vars()).await.unwrap();
    assert!(r[0].is_skipped());

    let r = runner.run(&ctx, &always, &h, &no_vars()).await.unwrap();
    assert!(!r[0].is_skipped());

    assert_eq!(module.calls(), 2);
}

#[tokio::test]
async fn test_never_tag_beats_always() {
    let module = MockModule::new("ping");
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("debug only", "ping").tag("always").tag("never");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();
    assert!(r[0].is_skipped());
    assert_eq!(module.calls(), 0);
}

#[tokio::test]
async fn test_skip_tags() {
    let module = MockModule::new("ping");
    let mut runner = runner_with(&[module.clone()]);
    runner.set_skip_tags(vec!["slow".to_string()]);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("slow", "ping").tag("slow"),
            &hosts(&["h1", "h2"]),
            &no_vars(),
        )
        .await
        .unwrap();
    assert_eq!(r.len(), 2);
    assert!(r.iter().all(|r| r.status() == TaskStatus::Skipped));
    assert_eq!(module.calls(), 0);
}

#[tokio::test]
async fn test_tag_skipped_task_does_not_resolve_loop() {
    let mut runner = runner_with(&[]);
    runner.set_tags(vec!["web".to_string()]);
    let task = Task::new("db", "debug")
        .tag("db")
        .loop_expr("{{ not_defined_anywhere }}");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();
    assert_eq!(r.len(), 1);
    assert!(r[0].is_skipped());
}

// ============================================================================
// Conditionals
// ============================================================================

#[tokio::test]
async fn test_when_uses_host_vars() {
    let module = MockModule::new("ping");
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("debian only", "ping").when("os_family == 'Debian'");
    let targets = vec![
        Host::new("deb").with_var("os_family", "Debian"),
        Host::new("rhel").with_var("os_family", "RedHat"),
    ];

    let r = runner
        .run(&RunContext::new(), &task, &targets, &no_vars())
        .await
        .unwrap();

    assert!(!r[0].is_skipped());
    assert!(r[1].is_skipped());
    assert_eq!(r[1].data["skip_reason"], "conditional");
    assert_eq!(module.received_hosts(), vec!["deb".to_string()]);
}

#[tokio::test]
async fn test_when_per_loop_item() {
    let runner = runner_with(&[]);
    let task = Task::new("odd", "debug")
        .arg("msg", "{{ item }}")
        .loop_over(vec![json!(1), json!(2), json!(3)])
        .when("item != 2");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    let skipped: Vec<bool> = r.iter().map(|r| r.is_skipped()).collect();
    assert_eq!(skipped, vec![false, true, false]);
}

#[tokio::test]
async fn test_strict_evaluation_error_fails_unit() {
    let config = RunnerConfig {
        strict_conditions: true,
        ..RunnerConfig::default()
    };
    let module = MockModule::new("ping");
    let runner = runner_with_config(&[module.clone()], config);
    let task = Task::new("strict", "ping").when("undefined_thing == 1");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert!(r[0].is_failed());
    assert!(r[0].error.as_deref().unwrap().contains("undefined_thing"));
    assert_eq!(module.calls(), 0);
}

// ============================================================================
// Check mode and diff mode
// ============================================================================

#[tokio::test]
async fn test_check_mode_skips_unsupported_module() {
    let module = MockModule::changed("service");
    let mut runner = runner_with(&[module.clone()]);
    runner.set_check_mode(true);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("restart", "service"),
            &hosts(&["h1"]),
            &no_vars(),
        )
        .await
        .unwrap();

    assert!(r[0].success);
    assert!(!r[0].changed);
    assert!(r[0].simulated);
    assert!(r[0].is_skipped());
    assert_eq!(r[0].data["reason"], "module_no_check_support");
    assert_eq!(module.calls(), 0);
}

#[tokio::test]
async fn test_check_mode_capable_module_reports_would_change() {
    let module = MockModule::changed("package").with_check_mode();
    let mut runner = runner_with(&[module.clone()]);
    runner.set_check_mode(true);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("install", "package").arg("name", "nginx"),
            &hosts(&["h1"]),
            &no_vars(),
        )
        .await
        .unwrap();

    assert_eq!(module.check_mode_calls(), 1);
    assert_eq!(module.received_args()[0]["_check_mode"], true);
    assert!(r[0].simulated);
    assert_eq!(r[0].data["check_mode"], true);
    assert_eq!(r[0].data["would_change"], true);
}

#[tokio::test]
async fn test_check_mode_from_variable() {
    let module = MockModule::changed("service");
    let runner = runner_with(&[module.clone()]);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("restart", "service"),
            &hosts(&["h1"]),
            &vars(json!({"ansible_check_mode": true})),
        )
        .await
        .unwrap();

    assert!(r[0].simulated);
    assert_eq!(module.calls(), 0);
}

#[tokio::test]
async fn test_diff_only_reported_in_diff_mode() {
    let output = ModuleOutput::changed("rewrote file").with_diff(Diff::new("old\n", "new\n"));
    let module = MockModule::new("file").with_result(output);
    let mut runner = runner_with(&[module.clone()]);
    let task = Task::new("write", "file");
    let h = hosts(&["h1"]);

    let r = runner.run(&RunContext::new(), &task, &h, &no_vars()).await.unwrap();
    assert!(r[0].diff.is_none());

    runner.set_diff_mode(true);
    let r = runner.run(&RunContext::new(), &task, &h, &no_vars()).await.unwrap();
    let diff = r[0].diff.as_ref().unwrap();
    assert_eq!(diff.before.as_deref(), Some("old\n"));
    assert_eq!(diff.after.as_deref(), Some("new\n"));
    assert_eq!(module.received_args()[1]["_diff_mode"], true);
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_until_retries_until_condition_holds() {
    let module = MockModule::new("poller").with_sequence(vec![
        ModuleOutput::ok("starting").with_data("ready", false),
        ModuleOutput::ok("starting").with_data("ready", false),
        ModuleOutput::ok("up").with_data("ready", true),
        ModuleOutput::ok("never reached").with_data("ready", true),
    ]);
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("wait", "poller")
        .retries(5, 0)
        .until("result.ready");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert_eq!(module.calls(), 3);
    assert_eq!(r[0].attempts, 3);
    assert_eq!(r[0].message, "up");
}

#[tokio::test]
async fn test_until_sees_register_name() {
    let module = MockModule::new("poller").with_sequence(vec![
        ModuleOutput::ok("a").with_data("count", 1),
        ModuleOutput::ok("b").with_data("count", 2),
    ]);
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("count", "poller")
        .register("counter")
        .retries(3, 0)
        .until("counter.count >= 2 and attempts == 2");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert_eq!(r[0].attempts, 2);
    assert_eq!(runner.registered_vars("h1")["counter"]["count"], 2);
}

#[tokio::test]
async fn test_retry_exhaustion_keeps_last_result() {
    let module = MockModule::new("poller").with_result(ModuleOutput::ok("still down"));
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("wait", "poller")
        .retries(3, 0)
        .until("result.ready | default(false)");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert_eq!(module.calls(), 3);
    assert_eq!(r[0].attempts, 3);
    assert!(r[0].success);
    assert_eq!(r[0].message, "still down");
}

#[tokio::test]
async fn test_retries_without_until_stop_on_success() {
    let module = MockModule::new("flaky").with_sequence(vec![
        ModuleOutput::failed("boom"),
        ModuleOutput::ok("fine"),
    ]);
    let runner = runner_with(&[module.clone()]);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("flaky", "flaky").retries(4, 0),
            &hosts(&["h1"]),
            &no_vars(),
        )
        .await
        .unwrap();

    assert_eq!(module.calls(), 2);
    assert!(r[0].success);
    assert_eq!(r[0].attempts, 2);
}

// ============================================================================
// Overrides and failures
// ============================================================================

#[tokio::test]
async fn test_changed_when_and_failed_when() {
    let output = ModuleOutput::changed("done").with_command_output(
        Some("nothing to do".to_string()),
        None,
        Some(2),
    );
    let module = MockModule::new("shell").with_result(output);
    let runner = runner_with(&[module.clone()]);
    let h = hosts(&["h1"]);

    let task = Task::new("quiet", "shell").changed_when("'changed' in stdout");
    let r = runner.run(&RunContext::new(), &task, &h, &no_vars()).await.unwrap();
    assert!(!r[0].changed);
    assert!(r[0].success);

    let task = Task::new("rc", "shell").failed_when("rc not in [0, 1]");
    let r = runner.run(&RunContext::new(), &task, &h, &no_vars()).await.unwrap();
    assert!(!r[0].success);
    assert_eq!(r[0].status(), TaskStatus::Failed);
}

#[tokio::test]
async fn test_failed_when_false_clears_failure() {
    let module = MockModule::new("grep").with_result(ModuleOutput::failed("no match"));
    let runner = runner_with(&[module]);
    let task = Task::new("grep", "grep").failed_when(false);

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();
    assert!(r[0].success);
    assert!(r[0].error.is_none());
}

#[tokio::test]
async fn test_ignore_errors() {
    let module = MockModule::new("broken").with_error("disk on fire");
    let runner = runner_with(&[module]);
    let task = Task::new("risky", "broken").ignore_errors(true);

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert!(!r[0].success);
    assert!(r[0].ignored);
    assert!(!r[0].is_failed());
    assert!(r[0].error.as_deref().unwrap().contains("disk on fire"));
}

#[tokio::test]
async fn test_module_unreachable_error() {
    let module = MockModule::new("remote").unreachable();
    let runner = runner_with(&[module]);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("ping", "remote"),
            &hosts(&["h1"]),
            &no_vars(),
        )
        .await
        .unwrap();
    assert!(r[0].is_unreachable());
    assert_eq!(r[0].status(), TaskStatus::Unreachable);
}

#[tokio::test]
async fn test_unreachable_host_does_not_affect_others() {
    let module = MockModule::new("ping");
    let runner = TaskRunner::new(registry_with(&[module.clone()])).with_connection_factory(
        Arc::new(MockConnectionFactory::new().with_unreachable("down")),
    );

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("ping", "ping"),
            &hosts(&["up1", "down", "up2"]),
            &no_vars(),
        )
        .await
        .unwrap();

    assert!(r[0].success);
    assert!(r[1].is_unreachable());
    assert!(r[2].success);
    assert_eq!(module.calls(), 2);
}

#[tokio::test]
async fn test_panicking_worker_is_isolated() {
    let module = MockModule::new("fragile").panic_on("h2");
    let runner = runner_with(&[module]);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("fragile", "fragile"),
            &hosts(&["h1", "h2", "h3"]),
            &no_vars(),
        )
        .await
        .unwrap();

    assert_eq!(r.len(), 3);
    assert!(r[0].success);
    assert!(r[1].is_failed());
    assert_eq!(r[1].host, "h2");
    assert!(r[1].error.as_deref().unwrap().contains("worker panicked"));
    assert!(r[2].success);
}

// ============================================================================
// Templating
// ============================================================================

#[tokio::test]
async fn test_native_values_survive_rendering() {
    let module = MockModule::new("sink");
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("render", "sink")
        .arg("ports", "{{ ports }}")
        .arg("greeting", "hi {{ user.name }}");

    runner
        .run(
            &RunContext::new(),
            &task,
            &hosts(&["h1"]),
            &vars(json!({"ports": [80, 443], "user": {"name": "ada"}})),
        )
        .await
        .unwrap();

    let args = &module.received_args()[0];
    assert_eq!(args["ports"], json!([80, 443]));
    assert_eq!(args["greeting"], "hi ada");
}

#[tokio::test]
async fn test_render_error_fails_unit() {
    let module = MockModule::new("sink");
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("render", "sink").arg("msg", "hello {{ nobody.name }}");

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert!(r[0].is_failed());
    assert_eq!(module.calls(), 0);
}

// ============================================================================
// Register and notify
// ============================================================================

#[tokio::test]
async fn test_register_is_visible_to_next_task() {
    let output = ModuleOutput::ok("ran").with_command_output(Some("v1.2".to_string()), None, Some(0));
    let module = MockModule::new("shell").with_result(output);
    let runner = runner_with(&[module]);
    let h = hosts(&["h1"]);

    runner
        .run(
            &RunContext::new(),
            &Task::new("version", "shell").register("version"),
            &h,
            &no_vars(),
        )
        .await
        .unwrap();

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("show", "debug")
                .arg("msg", "version is {{ version.stdout }}")
                .when("version.rc == 0"),
            &h,
            &no_vars(),
        )
        .await
        .unwrap();

    assert_eq!(r[0].message, "version is v1.2");
    assert_eq!(runner.registered_vars("h1")["version"]["stdout_lines"], json!(["v1.2"]));

    runner.clear_registered();
    assert!(runner.registered_vars("h1").is_empty());
}

#[tokio::test]
async fn test_notify_only_on_change() {
    let unchanged = MockModule::new("noop");
    let changed = MockModule::changed("edit");
    let runner = runner_with(&[unchanged, changed]);
    let handlers = runner.handler_manager();
    handlers
        .register_handler(Task::new("restart app", "debug"))
        .unwrap();
    let h = hosts(&["h1"]);

    runner
        .run(
            &RunContext::new(),
            &Task::new("noop", "noop").notify("restart app"),
            &h,
            &no_vars(),
        )
        .await
        .unwrap();
    assert!(!handlers.has_pending());

    runner
        .run(
            &RunContext::new(),
            &Task::new("edit", "edit").notify("restart app"),
            &h,
            &no_vars(),
        )
        .await
        .unwrap();
    assert!(handlers.has_pending());
}

#[tokio::test]
async fn test_failed_change_does_not_notify() {
    let mut output = ModuleOutput::failed("half applied");
    output.changed = true;
    let module = MockModule::new("edit").with_result(output);
    let runner = runner_with(&[module]);
    let handlers = runner.handler_manager();
    handlers
        .register_handler(Task::new("restart app", "debug"))
        .unwrap();
    let h = hosts(&["h1"]);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("edit", "edit").notify("restart app"),
            &h,
            &no_vars(),
        )
        .await
        .unwrap();
    assert!(r[0].changed);
    assert!(r[0].is_failed());
    assert!(!handlers.has_pending());

    runner
        .run(
            &RunContext::new(),
            &Task::new("edit", "edit")
                .notify("restart app")
                .ignore_errors(true),
            &h,
            &no_vars(),
        )
        .await
        .unwrap();
    assert!(handlers.has_pending());
}

// ============================================================================
// Concurrency and cancellation
// ============================================================================

#[tokio::test]
async fn test_forks_bound_in_flight_units() {
    let module = MockModule::new("slow").with_delay(Duration::from_millis(30));
    let config = RunnerConfig {
        forks: 2,
        ..RunnerConfig::default()
    };
    let runner = runner_with_config(&[module.clone()], config);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("slow", "slow").loop_over(vec![json!(1), json!(2), json!(3)]),
            &hosts(&["h1", "h2"]),
            &no_vars(),
        )
        .await
        .unwrap();

    assert_eq!(r.len(), 6);
    assert_eq!(module.calls(), 6);
    assert!(module.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_deadline_interrupts_module() {
    let module = MockModule::new("hang").with_delay(Duration::from_secs(10));
    let runner = runner_with(&[module]);
    let ctx = RunContext::new().with_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let r = runner
        .run(&ctx, &Task::new("hang", "hang"), &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(r[0].is_failed());
    assert!(r[0].error.as_deref().unwrap().contains("deadline exceeded"));
    assert_eq!(r[0].data["cancelled"], true);
}

#[tokio::test]
async fn test_deadline_interrupts_connect() {
    let module = MockModule::new("ping");
    let runner = TaskRunner::new(registry_with(&[module.clone()])).with_connection_factory(
        Arc::new(MockConnectionFactory::new().with_connect_delay(Duration::from_secs(30))),
    );
    let ctx = RunContext::new().with_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let r = runner
        .run(&ctx, &Task::new("ping", "ping"), &hosts(&["h1", "h2"]), &no_vars())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(module.calls(), 0);
    for result in &r {
        assert!(result.is_failed());
        assert!(!result.is_unreachable());
        assert!(result.error.as_deref().unwrap().contains("deadline exceeded"));
        assert_eq!(result.data["cancelled"], true);
    }
}

#[tokio::test]
async fn test_cancel_interrupts_retry_delay() {
    let module = MockModule::new("flaky").with_result(ModuleOutput::failed("not yet"));
    let runner = runner_with(&[module.clone()]);
    let ctx = RunContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let r = runner
        .run(
            &ctx,
            &Task::new("flaky", "flaky").retries(5, 30),
            &hosts(&["h1"]),
            &no_vars(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(module.calls(), 1);
    assert!(r[0].error.as_deref().unwrap().contains("run cancelled"));
}

#[tokio::test]
async fn test_task_timeout_marks_timed_out() {
    let module = MockModule::new("hang").with_delay(Duration::from_secs(10));
    let config = RunnerConfig {
        task_timeout: Some(Duration::from_millis(50)),
        ..RunnerConfig::default()
    };
    let runner = runner_with_config(&[module], config);

    let r = runner
        .run(
            &RunContext::new(),
            &Task::new("hang", "hang"),
            &hosts(&["h1"]),
            &no_vars(),
        )
        .await
        .unwrap();
    assert!(r[0].is_failed());
    assert_eq!(r[0].data["timed_out"], true);
}

// ============================================================================
// Background jobs
// ============================================================================

#[tokio::test]
async fn test_fire_and_forget_returns_job_id() {
    let module = MockModule::changed("long").with_delay(Duration::from_millis(50));
    let runner = runner_with(&[module.clone()]);
    let task = Task::new("long", "long").async_poll(10, 0);

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();

    assert!(r[0].changed);
    assert_eq!(r[0].data["started"], 1);
    assert_eq!(r[0].data["finished"], 0);
    let jid = r[0].data["ansible_job_id"].as_str().unwrap().to_string();

    let jobs = runner.async_jobs();
    let info = jobs.wait(&jid).await.unwrap();
    assert_eq!(info.status, AsyncJobStatus::Finished);
    assert!(info.result.unwrap().changed);
    assert_eq!(module.calls(), 1);
}

#[tokio::test]
async fn test_background_job_times_out() {
    let module = MockModule::new("hang").with_delay(Duration::from_secs(10));
    let runner = runner_with(&[module]);
    let task = Task::new("hang", "hang").async_poll(1, 0);

    let r = runner
        .run(&RunContext::new(), &task, &hosts(&["h1"]), &no_vars())
        .await
        .unwrap();
    let jid = r[0].data["ansible_job_id"].as_str().unwrap().to_string();

    let info = runner.async_jobs().wait(&jid).await.unwrap();
    assert!(info.is_finished());
    let result = info.result.unwrap();
    assert!(!result.success);
    assert_eq!(result.data["timed_out"], true);
}
