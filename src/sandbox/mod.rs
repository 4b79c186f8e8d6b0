//! Isolated execution of operator-authored JavaScript.
//!
//! Every invocation gets a brand new QuickJS runtime and context with heap
//! and stack ceilings installed before any user code runs. Nothing is pooled
//! between invocations. Scripts run on the blocking pool; a timer task flips
//! an `expired` flag that the engine's interrupt hook polls, which aborts the
//! script cooperatively.

pub mod bridge;

use rquickjs::context::intrinsic::{Date, Eval, MapSet, Promise, RegExp, RegExpCompiler};
use rquickjs::{Context, Ctx, Runtime, Value};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub use bridge::Binding;

use crate::error::SandboxError;

pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_STACK_SIZE: usize = 256 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Process-wide ceilings applied to every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_bytes: usize,
    pub stack_bytes: usize,
    pub timeout: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_LIMIT,
            stack_bytes: DEFAULT_MAX_STACK_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Runtime+context lifecycle counters.
#[derive(Debug, Default)]
pub struct SandboxStats {
    created: AtomicU64,
    disposed: AtomicU64,
}

impl SandboxStats {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> u64 {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.disposed())
    }
}

/// A single script call: operator source, the data it may read, and the
/// entry expression evaluated after the source.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub label: &'static str,
    pub code: String,
    pub bindings: Vec<Binding>,
    pub entry: String,
}

#[derive(Clone)]
pub struct Sandbox {
    limits: SandboxLimits,
    stats: Arc<SandboxStats>,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            stats: Arc::new(SandboxStats::default()),
        }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn stats(&self) -> Arc<SandboxStats> {
        self.stats.clone()
    }

    /// Run one invocation to completion. The runtime and context are gone by
    /// the time this returns, whatever the outcome.
    pub async fn run(&self, invocation: Invocation) -> Result<Option<JsonValue>, SandboxError> {
        let label = invocation.label;
        let limits = self.limits.clone();
        let stats = self.stats.clone();
        let handle = Handle::current();
        let started = Instant::now();

        let joined =
            tokio::task::spawn_blocking(move || execute(&invocation, &limits, &stats, &handle))
                .await;

        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(SandboxError::Runtime(format!("sandbox worker failed: {e}"))),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(value) => tracing::debug!(stage = label, elapsed_ms, result = ?value, "script finished"),
            Err(e) => tracing::debug!(stage = label, elapsed_ms, error = %e, "script failed"),
        }
        result
    }
}

/// Owns one runtime+context pair. Field order matters: the context drops
/// before the runtime, and the lease records disposal after both.
struct Isolate {
    context: Context,
    _runtime: Runtime,
    _lease: Lease,
}

impl Isolate {
    fn create(
        limits: &SandboxLimits,
        stats: &Arc<SandboxStats>,
        expired: Arc<AtomicBool>,
    ) -> Result<Self, SandboxError> {
        let runtime = Runtime::new().map_err(|e| SandboxError::Setup(e.to_string()))?;
        runtime.set_memory_limit(limits.memory_bytes);
        runtime.set_max_stack_size(limits.stack_bytes);
        runtime.set_interrupt_handler(Some(Box::new(move || expired.load(Ordering::Relaxed))));

        // No `Json` intrinsic: the shim is the only encoder in scope.
        let context =
            Context::custom::<(Eval, RegExpCompiler, RegExp, Date, MapSet, Promise)>(&runtime)
                .map_err(|e| SandboxError::Setup(e.to_string()))?;

        Ok(Self {
            context,
            _runtime: runtime,
            _lease: Lease::acquire(stats),
        })
    }
}

struct Lease(Arc<SandboxStats>);

impl Lease {
    fn acquire(stats: &Arc<SandboxStats>) -> Self {
        stats.created.fetch_add(1, Ordering::SeqCst);
        Lease(stats.clone())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Host timer that flips `expired` after the timeout. Disarmed on drop.
struct Deadline(JoinHandle<()>);

impl Deadline {
    fn arm(handle: &Handle, timeout: Duration, expired: Arc<AtomicBool>) -> Self {
        Deadline(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            expired.store(true, Ordering::SeqCst);
        }))
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prelude,
    Code,
    Entry,
}

fn execute(
    invocation: &Invocation,
    limits: &SandboxLimits,
    stats: &Arc<SandboxStats>,
    handle: &Handle,
) -> Result<Option<JsonValue>, SandboxError> {
    let expired = Arc::new(AtomicBool::new(false));
    let isolate = Isolate::create(limits, stats, expired.clone())?;
    let _deadline = Deadline::arm(handle, limits.timeout, expired.clone());

    isolate.context.with(|ctx| {
        let fail = |err: rquickjs::Error, phase: Phase| {
            classify(&ctx, err, phase, &expired, limits.timeout)
        };

        let prelude = bridge::install(&ctx, &invocation.bindings)?;
        ctx.eval::<(), _>(prelude)
            .map_err(|e| fail(e, Phase::Prelude))?;
        ctx.eval::<(), _>(invocation.code.as_str())
            .map_err(|e| fail(e, Phase::Code))?;

        let result: Value = ctx
            .eval(bridge::encode_entry(&invocation.entry))
            .map_err(|e| fail(e, Phase::Entry))?;

        let encoded = if result.is_undefined() {
            None
        } else if let Some(text) = result.as_string() {
            Some(text.to_string().map_err(|e| SandboxError::Decode(e.to_string()))?)
        } else {
            return Err(SandboxError::Decode(format!(
                "encoder returned a {:?}",
                result.type_of()
            )));
        };
        bridge::decode(encoded)
    })
}

fn classify(
    ctx: &Ctx<'_>,
    err: rquickjs::Error,
    phase: Phase,
    expired: &AtomicBool,
    timeout: Duration,
) -> SandboxError {
    let (name, message) = match err {
        rquickjs::Error::Exception => {
            let thrown = ctx.catch();
            // QuickJS throws a bare null when it cannot even allocate the
            // error object, which happens on heap or stack exhaustion.
            if thrown.is_null() || thrown.is_undefined() {
                if expired.load(Ordering::SeqCst) {
                    return SandboxError::Timeout(timeout);
                }
                return SandboxError::ResourceExceeded(
                    "engine raised an empty exception (out of memory or stack)".into(),
                );
            }
            describe_exception(&thrown)
        }
        rquickjs::Error::Allocation => {
            return SandboxError::ResourceExceeded("allocation failed".into())
        }
        other => (None, other.to_string()),
    };

    if expired.load(Ordering::SeqCst) {
        return SandboxError::Timeout(timeout);
    }
    if is_resource_exhaustion(&message) {
        return SandboxError::ResourceExceeded(message);
    }
    match (phase, name.as_deref()) {
        (Phase::Code, Some("SyntaxError")) => SandboxError::Compile(message),
        (Phase::Prelude, _) => SandboxError::Setup(message),
        _ => SandboxError::Runtime(message),
    }
}

fn describe_exception(value: &Value<'_>) -> (Option<String>, String) {
    if let Some(obj) = value.as_object() {
        let name: Option<String> = obj.get("name").ok().flatten();
        let message: Option<String> = obj.get("message").ok().flatten();
        let text = match (&name, message) {
            (Some(n), Some(m)) => format!("{n}: {m}"),
            (None, Some(m)) => m,
            (Some(n), None) => n.clone(),
            (None, None) => "uncaught exception object".to_string(),
        };
        return (name, text);
    }
    if let Some(s) = value.as_string() {
        return (None, s.to_string().unwrap_or_default());
    }
    (None, format!("uncaught {:?}", value.type_of()))
}

fn is_resource_exhaustion(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory")
        || lower.contains("stack overflow")
        || lower.contains("maximum call stack size exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sandbox(timeout_ms: u64) -> Sandbox {
        Sandbox::new(SandboxLimits {
            timeout: Duration::from_millis(timeout_ms),
            ..SandboxLimits::default()
        })
    }

    fn invocation(code: &str, entry: &str) -> Invocation {
        let mut headers = BTreeMap::new();
        headers.insert("x-token".to_string(), "abc".to_string());
        Invocation {
            label: "test",
            code: code.to_string(),
            bindings: vec![
                Binding::strings("headers", headers),
                Binding::json("body", json!({ "messageId": "m1", "tags": ["a", "b"] })),
            ],
            entry: entry.to_string(),
        }
    }

    #[tokio::test]
    async fn reads_bound_values_and_returns_decoded_result() {
        let sb = sandbox(1000);
        let out = sb
            .run(invocation(
                "function check(h, b) { return h['x-token'] === 'abc' && b.tags.length === 2; }",
                "check(headers, body)",
            ))
            .await
            .unwrap();
        assert_eq!(out, Some(json!(true)));
        assert_eq!(sb.stats().created(), 1);
        assert_eq!(sb.stats().disposed(), 1);
    }

    #[tokio::test]
    async fn undefined_result_decodes_to_none() {
        let out = sandbox(1000)
            .run(invocation("function nothing() {}", "nothing()"))
            .await
            .unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn syntax_error_is_a_compile_error() {
        let err = sandbox(1000)
            .run(invocation("function broken( {", "broken()"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Compile(_)), "{err:?}");
    }

    #[tokio::test]
    async fn thrown_error_is_a_runtime_error() {
        let err = sandbox(1000)
            .run(invocation(
                "function boom() { throw new Error('nope'); }",
                "boom()",
            ))
            .await
            .unwrap_err();
        match err {
            SandboxError::Runtime(msg) => assert!(msg.contains("nope"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn spinning_script_is_aborted_by_timeout() {
        let sb = sandbox(100);
        let started = Instant::now();
        let err = sb
            .run(invocation("function spin() { while (true) {} }", "spin()"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)), "{err:?}");
        assert!(err.to_string().contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sb.stats().live(), 0);
    }

    #[tokio::test]
    async fn unbounded_recursion_hits_stack_ceiling() {
        let err = sandbox(2000)
            .run(invocation("function dive(n) { return dive(n + 1) + 1; }", "dive(0)"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded(_)), "{err:?}");
    }

    #[tokio::test]
    async fn heap_hog_never_takes_down_the_host() {
        let sb = sandbox(2000);
        let result = sb
            .run(invocation(
                "function hog() { const a = []; while (true) { a.push('x'.repeat(1 << 20)); } }",
                "hog()",
            ))
            .await;
        assert!(
            matches!(result, Err(SandboxError::ResourceExceeded(_))),
            "{result:?}"
        );
        assert_eq!(sb.stats().created(), 1);
        assert_eq!(sb.stats().disposed(), 1);
    }

    #[tokio::test]
    async fn many_small_allocations_hit_the_heap_ceiling() {
        let sb = Sandbox::new(SandboxLimits {
            memory_bytes: 4 * 1024 * 1024,
            timeout: Duration::from_millis(5000),
            ..SandboxLimits::default()
        });
        let result = sb
            .run(invocation(
                "function hog() { const a = []; for (;;) { a.push({ k: a.length }); } }",
                "hog()",
            ))
            .await;
        assert!(
            matches!(result, Err(SandboxError::ResourceExceeded(_))),
            "{result:?}"
        );
        assert_eq!(sb.stats().live(), 0);
    }

    #[tokio::test]
    async fn deeply_nested_result_hits_the_stack_ceiling() {
        let result = sandbox(5000)
            .run(invocation(
                "function nest() { let a = []; for (let i = 0; i < 200000; i++) { a = [a]; } return a; }",
                "nest()",
            ))
            .await;
        assert!(
            matches!(result, Err(SandboxError::ResourceExceeded(_))),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn no_host_surface_is_reachable() {
        let out = sandbox(1000)
            .run(invocation(
                "function globalsSeen() { return [typeof require, typeof process, typeof fetch, typeof std, typeof os]; }",
                "globalsSeen()",
            ))
            .await
            .unwrap();
        assert_eq!(
            out,
            Some(json!(["undefined", "undefined", "undefined", "undefined", "undefined"]))
        );
    }

    #[tokio::test]
    async fn shim_leaves_quotes_unescaped() {
        let err = sandbox(1000)
            .run(invocation("function q() { return 'say \"hi\"'; }", "q()"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Decode(_)), "{err:?}");
    }

    #[tokio::test]
    async fn concurrent_invocations_never_leak_isolates() {
        let sb = sandbox(150);
        let scripts = [
            ("function ok() { return 1; }", "ok()"),
            ("function bad() { throw 'x'; }", "bad()"),
            ("function spin() { for (;;) {} }", "spin()"),
            ("function broken( {", "broken()"),
        ];
        let mut tasks = Vec::new();
        for i in 0..12 {
            let sb = sb.clone();
            let (code, entry) = scripts[i % scripts.len()];
            tasks.push(tokio::spawn(async move {
                sb.run(invocation(code, entry)).await
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }
        assert_eq!(sb.stats().created(), 12);
        assert_eq!(sb.stats().disposed(), 12);
    }
}
