// # Graceful Shutdown
//
// Process-wide teardown orchestrator. Components register cleanup hooks
// with a priority; on shutdown the hooks run in ascending priority order
// (HTTP server drains first, caches flush last), each awaited independently
// so one failing hook never skips the rest. The whole sequence races a
// timeout, and the process exits with the recorded code either way.
// Uncaught errors classified as recoverable do not trigger shutdown.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ShutdownConfig;
use crate::error::Result;

/// Well-known hook priorities, ordered the way teardown drains.
pub mod priorities {
    pub const HTTP_SERVER: i32 = 10;
    pub const INSTANCE_COORDINATOR: i32 = 20;
    pub const CHAT_CLIENT: i32 = 30;
    pub const TASK_REPOSITORY: i32 = 40;
    pub const CACHE: i32 = 50;
}

/// Error-message fragments that mark a failure as recoverable. A
/// recoverable uncaught error is logged and survived, never fatal.
const RECOVERABLE_FRAGMENTS: &[&str] = &[
    "TIMEOUT",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ECONNRESET",
    "EPIPE",
    "AUTH_KEY_DUPLICATED",
    "FLOOD",
    "Network error",
    "Connection lost",
    "Connection timeout",
    "Not connected",
];

pub fn is_recoverable_error(message: &str) -> bool {
    RECOVERABLE_FRAGMENTS
        .iter()
        .any(|fragment| message.contains(fragment))
}

type HookFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type HookFn = Box<dyn Fn() -> HookFuture + Send + Sync>;
type TaskCounter = Arc<dyn Fn() -> usize + Send + Sync>;

struct RegisteredHook {
    name: String,
    priority: i32,
    hook: HookFn,
}

pub struct GracefulShutdown {
    config: ShutdownConfig,
    hooks: Mutex<Vec<RegisteredHook>>,
    task_counter: Mutex<Option<TaskCounter>>,
    shutting_down: AtomicBool,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            hooks: Mutex::new(Vec::new()),
            task_counter: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register a cleanup hook. Lower priorities drain first.
    pub fn register<F, Fut>(&self, name: impl Into<String>, priority: i32, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.hooks.lock().push(RegisteredHook {
            name,
            priority,
            hook: Box::new(move || Box::pin(hook())),
        });
    }

    /// Register the counter polled by `drain_tasks`.
    pub fn register_task_counter<F>(&self, counter: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        *self.task_counter.lock() = Some(Arc::new(counter));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait for SIGTERM or SIGINT.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("SIGTERM handler install failed: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("Received SIGINT");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    /// Classify an uncaught error and shut down only when fatal. Returns
    /// the exit code when a shutdown ran, `None` when the error was
    /// survivable.
    pub async fn handle_uncaught(&self, source: &str, message: &str) -> Option<i32> {
        if is_recoverable_error(message) {
            warn!("Recoverable error from {}: {}", source, message);
            return None;
        }
        Some(self.shutdown(source, Some(message)).await)
    }

    /// Run the full teardown once and return the process exit code. A
    /// second call while a shutdown is in flight is a no-op returning the
    /// same code semantics.
    pub async fn shutdown(&self, source: &str, error: Option<&str>) -> i32 {
        let exit_code = if error.is_some() { 1 } else { 0 };
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return exit_code;
        }

        match error {
            Some(error) => error!("Shutting down from {}: {}", source, error),
            None => info!("Shutting down from {}", source),
        }

        let sequence = async {
            self.drain_tasks().await;
            self.execute_cleanup_hooks().await;
        };
        if tokio::time::timeout(self.config.shutdown_timeout, sequence)
            .await
            .is_err()
        {
            error!(
                "Shutdown exceeded {:?}; exiting anyway",
                self.config.shutdown_timeout
            );
        }

        exit_code
    }

    /// Run every registered hook in ascending priority order. Each hook is
    /// awaited independently; failures are logged and later hooks still run.
    pub async fn execute_cleanup_hooks(&self) {
        let hooks = {
            let mut hooks = self.hooks.lock();
            hooks.sort_by_key(|hook| hook.priority);
            hooks
                .iter()
                .map(|hook| (hook.name.clone(), hook.priority, (hook.hook)()))
                .collect::<Vec<_>>()
        };

        for (name, priority, future) in hooks {
            info!("Running cleanup hook {} (priority {})", name, priority);
            if let Err(e) = future.await {
                warn!("Cleanup hook {} failed: {}", name, e);
            }
        }
    }

    /// Poll the registered task counter until it reaches zero or the drain
    /// timeout expires. Without a counter this resolves immediately.
    pub async fn drain_tasks(&self) {
        let counter = self.task_counter.lock().clone();
        let Some(counter) = counter else {
            return;
        };

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            let remaining = counter();
            if remaining == 0 {
                info!("All in-flight tasks drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Drain timeout with {} tasks still in flight", remaining);
                return;
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }
    }

    /// Immediate exit with the given code. Does not run hooks.
    pub fn force_exit(&self, code: i32) -> ! {
        error!("Force exit with code {}", code);
        std::process::exit(code);
    }
}
