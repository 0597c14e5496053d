//! Loads, executes, and tears down one plugin unit at a time.
//!
//! Every run gets a disposable arena: a fresh engine, store, and linker that
//! are dropped wholesale once the unit finishes. Two plugins defining
//! same-named exports can never collide, and nothing a unit defines survives
//! into the next load.

use std::sync::mpsc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info};
use wasmtime::{Config, Engine, Linker, Module, Store, Trap};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::{self, WasiP1Ctx};
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};

use super::checkin::SERVER_TIME_FORMAT;
use super::error::PluginError;
use super::history::ExecutionRecord;
use super::plan::PluginSpec;
use super::scheduler;

/// Execution bound applied when the server does not supply one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Captured stdio is bounded so a chatty unit cannot exhaust memory.
const OUTPUT_CAP: usize = 1 << 20;

/// Normalized plugin output. Singular and plural forms from the unit are
/// already merged; `memory` of `None` means "leave the stored blob alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginData {
    pub reports: Vec<Value>,
    pub alerts: Vec<Value>,
    pub errors: Vec<Value>,
    pub summaries: Vec<Value>,
    pub memory: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not due yet; no state change.
    Skipped,
    Failed(PluginError),
    Completed(PluginData),
}

pub struct PluginRunner;

impl PluginRunner {
    /// Runs one plugin against its persisted record and reports what
    /// happened. Record updates are the caller's job; the asymmetry between
    /// timeouts (record untouched) and faults (record advanced) lives there.
    pub async fn run(spec: &PluginSpec, record: &ExecutionRecord) -> Outcome {
        if !scheduler::should_run_plugin(record.last_run, spec.interval) {
            debug!(
                "Plugin {} does not need to be run at this time.",
                spec.label()
            );
            return Outcome::Skipped;
        }
        let timeout_secs = spec
            .timeout
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let input = match serde_json::to_vec(&json!({
            "last_run": record
                .last_run
                .map(|t| t.format(SERVER_TIME_FORMAT).to_string()),
            "memory": record.memory.clone().unwrap_or_else(|| json!({})),
            "options": Value::Object(spec.options.clone()),
        })) {
            Ok(bytes) => bytes,
            Err(e) => {
                return Outcome::Failed(PluginError::RunFailed(format!(
                    "could not encode plugin input: {}",
                    e
                )));
            }
        };

        debug!("Compiling and running plugin {}...", spec.label());
        let code = spec.code.clone().into_bytes();
        let label = spec.label().to_string();
        let joined =
            tokio::task::spawn_blocking(move || execute_unit(&code, input, timeout_secs, &label))
                .await;

        let executed = match joined {
            Ok(result) => result,
            Err(e) => {
                return Outcome::Failed(PluginError::RunFailed(format!(
                    "plugin execution thread failed: {}",
                    e
                )));
            }
        };
        match executed {
            Ok(stdout) => match parse_output(&stdout) {
                Ok(data) => {
                    info!("Plugin {} completed its run.", spec.label());
                    Outcome::Completed(data)
                }
                Err(message) => Outcome::Failed(PluginError::RunFailed(message)),
            },
            Err(err) => Outcome::Failed(err),
        }
    }
}

/// Compile, instantiate, execute, discard. The watchdog fires the engine's
/// epoch once the deadline passes; the running unit traps cooperatively at
/// its next interruption point.
fn execute_unit(
    code: &[u8],
    input: Vec<u8>,
    timeout_secs: u64,
    label: &str,
) -> Result<Vec<u8>, PluginError> {
    let mut config = Config::new();
    config.epoch_interruption(true);
    let engine =
        Engine::new(&config).map_err(|e| PluginError::LoadFailed(e.to_string()))?;
    let module =
        Module::new(&engine, code).map_err(|e| PluginError::LoadFailed(e.to_string()))?;

    let stdout = MemoryOutputPipe::new(OUTPUT_CAP);
    let stderr = MemoryOutputPipe::new(OUTPUT_CAP);
    let mut wasi_builder = WasiCtxBuilder::new();
    wasi_builder.stdin(MemoryInputPipe::new(input));
    wasi_builder.stdout(stdout.clone());
    wasi_builder.stderr(stderr.clone());
    let wasi = wasi_builder.build_p1();

    let mut linker: Linker<WasiP1Ctx> = Linker::new(&engine);
    p1::add_to_linker_sync(&mut linker, |cx: &mut WasiP1Ctx| cx)
        .map_err(|e| PluginError::LoadFailed(e.to_string()))?;

    let mut store = Store::new(&engine, wasi);
    store.set_epoch_deadline(1);

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let watchdog = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            if done_rx
                .recv_timeout(Duration::from_secs(timeout_secs))
                .is_err()
            {
                engine.increment_epoch();
            }
        })
    };

    let result = (|| {
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| PluginError::LoadFailed(e.to_string()))?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| PluginError::LoadFailed(e.to_string()))?;
        match start.call(&mut store, ()) {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt)) {
                    Err(PluginError::TimedOut(timeout_secs))
                } else if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    if exit.0 == 0 {
                        Ok(())
                    } else {
                        Err(PluginError::RunFailed(format!(
                            "plugin exited with code {}",
                            exit.0
                        )))
                    }
                } else {
                    Err(PluginError::RunFailed(format!("{:?}", e)))
                }
            }
        }
    })();

    let _ = done_tx.send(());
    let _ = watchdog.join();

    let diagnostics = stderr.contents();
    if !diagnostics.is_empty() {
        debug!(
            "Plugin {} stderr: {}",
            label,
            String::from_utf8_lossy(&diagnostics)
        );
    }

    // store, instance, and linker drop here; the arena dies with them
    result.map(|()| stdout.contents().to_vec())
}

/// Decodes the unit's stdout into normalized data. Silence counts as a run
/// that produced nothing; non-JSON chatter is a plugin fault.
fn parse_output(stdout: &[u8]) -> Result<PluginData, String> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(PluginData::default());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(output)) => Ok(normalize(output)),
        Ok(other) => Err(format!("plugin output was not a JSON object: {}", other)),
        Err(e) => Err(format!("plugin output was not valid JSON: {}", e)),
    }
}

fn normalize(mut output: Map<String, Value>) -> PluginData {
    PluginData {
        reports: take_kind(&mut output, "report", "reports"),
        alerts: take_kind(&mut output, "alert", "alerts"),
        errors: take_kind(&mut output, "error", "errors"),
        summaries: take_kind(&mut output, "summary", "summaries"),
        memory: output.remove("memory"),
    }
}

/// A plugin may emit one or many of each kind; both spellings merge into one
/// sequence, singular entries first.
fn take_kind(output: &mut Map<String, Value>, singular: &str, plural: &str) -> Vec<Value> {
    let mut entries = Vec::new();
    if let Some(one) = output.remove(singular)
        && !one.is_null()
    {
        entries.push(one);
    }
    match output.remove(plural) {
        Some(Value::Array(many)) => entries.extend(many),
        Some(Value::Null) | None => {}
        Some(one) => entries.push(one),
    }
    entries
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    /// A unit that writes `stdout_json` to stdout and exits cleanly.
    fn emitting_unit(stdout_json: &str) -> String {
        let escaped = stdout_json.replace('\\', "\\\\").replace('"', "\\\"");
        format!(
            r#"(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "{escaped}")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const {len}))
    (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 16))
    drop))"#,
            len = stdout_json.len()
        )
    }

    fn spec_with(code: &str) -> PluginSpec {
        PluginSpec {
            id: Some(1),
            name: "unit-under-test".to_string(),
            code: code.to_string(),
            options: Map::new(),
            interval: 5,
            timeout: None,
            path: None,
        }
    }

    #[tokio::test]
    async fn completed_run_yields_reports() {
        let spec = spec_with(&emitting_unit(r#"{"report":{"load":42}}"#));
        let outcome = PluginRunner::run(&spec, &ExecutionRecord::default()).await;
        match outcome {
            Outcome::Completed(data) => {
                assert_eq!(data.reports, vec![json!({"load": 42})]);
                assert!(data.memory.is_none());
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn emitted_memory_is_surfaced() {
        let spec = spec_with(&emitting_unit(r#"{"memory":{"count":3}}"#));
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Completed(data) => assert_eq!(data.memory, Some(json!({"count": 3}))),
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_run_completes_with_nothing() {
        let spec = spec_with("(module (func (export \"_start\")))");
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Completed(data) => assert_eq!(data, PluginData::default()),
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn not_due_plugin_is_skipped() {
        let spec = spec_with(&emitting_unit(r#"{"report":{"n":1}}"#));
        let record = ExecutionRecord {
            last_run: Some(Utc::now()),
            memory: None,
        };
        assert_eq!(PluginRunner::run(&spec, &record).await, Outcome::Skipped);
    }

    #[tokio::test]
    async fn garbage_code_is_a_load_failure() {
        let spec = spec_with("this is not a plugin unit");
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Failed(PluginError::LoadFailed(_)) => {}
            other => panic!("expected LoadFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unit_without_an_entrypoint_is_a_load_failure() {
        let spec = spec_with("(module)");
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Failed(PluginError::LoadFailed(_)) => {}
            other => panic!("expected LoadFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn spinning_unit_times_out() {
        let mut spec = spec_with("(module (func (export \"_start\") (loop $l (br $l))))");
        spec.timeout = Some(1);
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Failed(PluginError::TimedOut(1)) => {}
            other => panic!("expected TimedOut, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn trapping_unit_is_a_run_failure() {
        let spec = spec_with("(module (func (export \"_start\") unreachable))");
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Failed(PluginError::RunFailed(_)) => {}
            other => panic!("expected RunFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_run_failure() {
        let spec = spec_with(
            r#"(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (func (export "_start") (call $proc_exit (i32.const 3))))"#,
        );
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Failed(PluginError::RunFailed(message)) => {
                assert!(message.contains("code 3"), "unexpected message: {}", message);
            }
            other => panic!("expected RunFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_json_chatter_is_a_run_failure() {
        let spec = spec_with(&emitting_unit("checking disks... done"));
        match PluginRunner::run(&spec, &ExecutionRecord::default()).await {
            Outcome::Failed(PluginError::RunFailed(message)) => {
                assert!(message.contains("valid JSON"), "unexpected message: {}", message);
            }
            other => panic!("expected RunFailed, got {:?}", other),
        }
    }

    #[test]
    fn normalize_merges_singular_and_plural() {
        let output = serde_json::from_str::<Value>(
            r#"{
                "report": {"a": 1},
                "reports": [{"b": 2}, {"c": 3}],
                "alert": {"subject": "s"},
                "summaries": {"lone": true},
                "memory": {"kept": 1}
            }"#,
        )
        .unwrap();
        let Value::Object(output) = output else { unreachable!() };
        let data = normalize(output);
        assert_eq!(
            data.reports,
            vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]
        );
        assert_eq!(data.alerts, vec![json!({"subject": "s"})]);
        assert!(data.errors.is_empty());
        assert_eq!(data.summaries, vec![json!({"lone": true})]);
        assert_eq!(data.memory, Some(json!({"kept": 1})));
    }
}
