//! End-to-end scenarios against a real isolate installation.
//!
//! Needs root, cgroups v2 and gcc inside the box:
//! `cargo test --test isolate -- --ignored --test-threads=1`

use std::sync::Arc;

use judge_engine::{
    CellState, Engine, EngineConfig, LanguageRegistry, LanguageSpec, ResourcePolicy, RunStatus,
    COMPILE_TIMEOUT_MESSAGE,
};

fn engine() -> Engine {
    let config = match std::env::var("ENGINE_CONFIG") {
        Ok(path) => EngineConfig::load(path).unwrap(),
        Err(_) => EngineConfig {
            box_id_start: 900,
            box_id_count: 4,
            ..EngineConfig::default()
        },
    };
    Engine::new(config)
}

fn c_language() -> Arc<LanguageSpec> {
    Arc::new(LanguageSpec {
        id: "c".to_string(),
        name: "C".to_string(),
        source_file: "main.c".to_string(),
        compile_command: Some("gcc %s -o main main.c".to_string()),
        run_command: "./main".to_string(),
    })
}

#[tokio::test]
#[ignore]
async fn hello_world_in_c() {
    let engine = engine();
    let mut cell = engine.cell();
    let source = "#include <stdio.h>\nint main(void) { printf(\"Hello, World!\\n\"); return 0; }\n";

    cell.init(&ResourcePolicy::default(), c_language(), source, "")
        .await
        .unwrap();
    let compiled = cell.compile("-Wall -O2").await.unwrap();
    assert!(compiled.succeeded, "{}", compiled.output);

    let outcome = cell.run("").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Ok);
    assert_eq!(outcome.stdout, "Hello, World!\n");
    assert!(outcome.memory_used > 0);

    cell.cleanup().await.unwrap();
    assert_eq!(cell.state(), CellState::Cleaned);
}

#[tokio::test]
#[ignore]
async fn null_dereference_is_signaled() {
    let engine = engine();
    let policy = ResourcePolicy {
        enable_per_process_and_thread_time_limit: true,
        enable_per_process_and_thread_memory_limit: true,
        ..ResourcePolicy::default()
    };
    let mut cell = engine.cell();
    let source = "int main(void) { int *p = 0; *p = 1; return 0; }\n";

    cell.init(&policy, c_language(), source, "").await.unwrap();
    assert_eq!(cell.cgroups_enabled(), Some(false));
    assert!(cell.compile("").await.unwrap().succeeded);

    let outcome = cell.run("").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Signaled);
    assert_eq!(outcome.exit_signal, 11);

    cell.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn compile_timeout_reports_sentinel() {
    let mut config = EngineConfig {
        box_id_start: 910,
        box_id_count: 1,
        ..EngineConfig::default()
    };
    config.ceilings.max_cpu_time_limit = 1.0;
    config.ceilings.max_wall_time_limit = 2.0;
    config.defaults.cpu_time_limit = 1.0;
    config.defaults.wall_time_limit = 2.0;
    let engine = Engine::new(config);

    let sleepy = Arc::new(LanguageSpec {
        compile_command: Some("sleep 30 %s".to_string()),
        ..(*c_language()).clone()
    });
    let mut cell = engine.cell();
    cell.init(&engine.config().defaults, sleepy, "", "")
        .await
        .unwrap();

    let compiled = cell.compile("").await.unwrap();
    assert!(!compiled.succeeded);
    assert!(compiled.timed_out);
    assert_eq!(compiled.output, COMPILE_TIMEOUT_MESSAGE);

    cell.cleanup().await.unwrap();
    assert_eq!(engine.pool().available(), 1);
}

#[tokio::test]
#[ignore]
async fn builtin_python_echo() {
    let registry = LanguageRegistry::builtin().unwrap();
    let engine = engine();
    let mut cell = engine.cell();

    cell.init(
        &ResourcePolicy::default(),
        registry.get("python").unwrap(),
        "print(input()[::-1])\n",
        "",
    )
    .await
    .unwrap();
    assert!(cell.compile("").await.unwrap().succeeded);

    let outcome = cell.run("abc\n").await.unwrap();
    assert_eq!(outcome.stdout, "cba\n");
    cell.cleanup().await.unwrap();
}
