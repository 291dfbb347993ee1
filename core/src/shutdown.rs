use crate::utils::lock;
use std::{
	fmt::{self, Debug, Display},
	future::Future,
	sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, Instrument};

struct ControllerInner<T> {
	/// The reason why shutdown is happening.
	reason: Mutex<Option<T>>,
	cancellation_token: CancellationToken,
	/// Registry of connection and background tasks, joined on shutdown.
	tasks: TaskTracker,
}

/// Shutdown controller for graceful shutdowns in async code.
///
/// Futures can be wrapped to stop when the shutdown is triggered, and tasks
/// spawned through the controller are tracked so the shutdown completes only
/// after all of them have finished.
///
/// The controller can be cloned and is thread-safe.
#[derive(Clone)]
pub struct Controller<T: Clone> {
	inner: Arc<ControllerInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Controller<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(ControllerInner {
				reason: Mutex::new(None),
				cancellation_token: CancellationToken::new(),
				tasks: TaskTracker::new(),
			}),
		}
	}

	pub fn is_shutdown_triggered(&self) -> bool {
		lock(&self.inner.reason).is_some()
	}

	/// Gets the shutdown reason, for the triggered shutdown.
	///
	/// Returns [`None`] if the shutdown has not been triggered yet.
	pub fn shutdown_reason(&self) -> Option<T> {
		lock(&self.inner.reason).clone()
	}

	/// Triggers the shutdown to begin, resolving every [`Controller::triggered_shutdown`]
	/// and cancelling every future wrapped with [`Controller::with_cancel`].
	///
	/// If the shutdown has already been started, this function returns an error.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		let mut current = lock(&self.inner.reason);
		if let Some(original) = current.as_ref() {
			return Err(ShutdownHasStarted::new(original.clone(), reason));
		}
		*current = Some(reason);
		drop(current);
		self.inner.cancellation_token.cancel();
		Ok(())
	}

	/// Resolves with the shutdown reason once the shutdown is triggered.
	pub async fn triggered_shutdown(&self) -> T {
		loop {
			if let Some(reason) = self.shutdown_reason() {
				return reason;
			}
			self.inner.cancellation_token.cancelled().await;
		}
	}

	/// Wraps a future to cancel it upon a triggered shutdown.
	///
	/// The returned future owns a clone of the controller, so it can be spawned on its own.
	/// It completes with `Err(reason)` if the shutdown is triggered before the wrapped future.
	pub fn with_cancel<F: Future>(&self, future: F) -> impl Future<Output = Result<F::Output, T>> {
		let controller = self.clone();
		async move {
			tokio::select! {
				biased;
				reason = controller.triggered_shutdown() => Err(reason),
				output = future => Ok(output),
			}
		}
	}

	/// Spawns a tracked task which is cancelled on shutdown.
	///
	/// The shutdown does not complete until the task has finished.
	pub fn spawn<F>(&self, future: F) -> JoinHandle<Option<F::Output>>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		let controller = self.clone();
		self.inner.tasks.spawn(
			async move { controller.with_cancel(future).await.ok() }.in_current_span(),
		)
	}

	/// Spawns a tracked task which is left running on shutdown.
	///
	/// The task has to watch [`Controller::triggered_shutdown`] itself, so it can clean up before exiting.
	pub fn track<F>(&self, future: F) -> JoinHandle<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		self.inner.tasks.spawn(future.in_current_span())
	}

	/// Number of tracked tasks still running.
	pub fn active_tasks(&self) -> usize {
		self.inner.tasks.len()
	}

	/// Waits for a triggered shutdown and for every tracked task to finish.
	pub async fn completed_shutdown(&self) -> T {
		let reason = self.triggered_shutdown().await;
		self.inner.tasks.close();
		debug!(tasks = self.inner.tasks.len(), "Waiting for tracked tasks");
		self.inner.tasks.wait().await;
		reason
	}

	/// Triggers the shutdown when the user signals termination.
	pub fn on_user_signal(&self, reason: T) -> impl Future<Output = ()> {
		let controller = self.clone();
		async move {
			if controller.with_cancel(user_signal()).await.is_ok() {
				_ = controller.trigger_shutdown(reason);
			}
		}
	}
}

impl<T: Clone + Send + Sync + 'static> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

/// Returned when the shutdown is triggered more than once on the same controller.
#[derive(Debug, Clone)]
pub struct ShutdownHasStarted<T> {
	/// The shutdown reason of the already started shutdown.
	pub reason: T,

	/// The provided reason that was ignored because the shutdown was already started.
	pub ignored: T,
}

impl<T> ShutdownHasStarted<T> {
	pub const fn new(reason: T, ignored: T) -> Self {
		Self { reason, ignored }
	}
}

impl<T: Debug> std::error::Error for ShutdownHasStarted<T> {}

impl<T> Display for ShutdownHasStarted<T> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "shutdown has already commenced")
	}
}

/// Completes on Ctrl-C, and on SIGTERM on Unix.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let terminate = async {
			let mut signal =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			signal.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = terminate => {},
		}
	}

	#[cfg(not(unix))]
	{
		_ = ctrl_c.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{
		future::{self, Future},
		time::Duration,
	};
	use tokio::{
		runtime,
		sync::oneshot,
		time::{sleep, timeout},
	};

	// custom runtime with a timeout so a hanging shutdown fails the test instead of blocking it
	#[track_caller]
	fn test_runtime(test: impl Future<Output = ()>) {
		let runtime = runtime::Runtime::new().unwrap();
		runtime.block_on(async move {
			let test_with_timeout = timeout(Duration::from_millis(100), test);
			assert!(test_with_timeout.await.is_ok());
		});
	}

	#[test]
	fn shutdown_trigger() {
		test_runtime(async {
			let controller = Controller::new();
			assert!(!controller.is_shutdown_triggered());
			assert!(controller.trigger_shutdown(1).is_ok());
			assert!(controller.is_shutdown_triggered());
			assert_eq!(controller.triggered_shutdown().await, 1);
			assert_eq!(controller.completed_shutdown().await, 1);
		});
	}

	#[test]
	fn shutdown_trigger_after_sleep() {
		test_runtime(async {
			let controller = Controller::new();

			tokio::spawn({
				let controller = controller.clone();
				async move {
					sleep(Duration::from_millis(20)).await;
					assert!(controller.trigger_shutdown(22).is_ok());
				}
			});

			assert_eq!(controller.triggered_shutdown().await, 22);
			assert_eq!(controller.completed_shutdown().await, 22);
		});
	}

	#[test]
	fn shutdown_only_once() {
		let controller = Controller::new();
		assert!(controller.trigger_shutdown("socket closed").is_ok());

		let Err(ShutdownHasStarted { reason, ignored }) = controller.trigger_shutdown("bind failed")
		else {
			panic!("Expected ShutdownHasStarted error");
		};
		assert_eq!(reason, "socket closed");
		assert_eq!(ignored, "bind failed");
		assert_eq!(controller.shutdown_reason(), Some("socket closed"));
	}

	#[test]
	fn future_with_cancel() {
		test_runtime(async {
			let controller = Controller::new();
			let task = tokio::spawn({
				let controller = controller.clone();
				async move { controller.with_cancel(future::pending::<()>()).await }
			});

			sleep(Duration::from_millis(5)).await;
			assert!(controller.trigger_shutdown("oi").is_ok());
			assert_eq!(task.await.unwrap(), Err("oi"));
		})
	}

	#[test]
	fn future_with_cancel_finishes_without_shutdown() {
		test_runtime(async {
			let controller = Controller::<()>::new();
			let output = controller.with_cancel(async {
				sleep(Duration::from_millis(10)).await;
				"relayed"
			});
			assert_eq!(output.await, Ok("relayed"));
		})
	}

	fn spawnable<F: Future + Send + 'static>(_: &F) {}

	#[test]
	fn cancellable_future_outlives_controller_borrow() {
		test_runtime(async {
			let controller = Controller::new();
			let handle = {
				let scoped = controller.clone();
				tokio::spawn(scoped.with_cancel(future::pending::<()>()))
			};
			// not polled, only checked to be spawnable
			let user_signal = controller.on_user_signal("user");
			spawnable(&user_signal);

			assert!(controller.trigger_shutdown("done").is_ok());
			assert_eq!(handle.await.unwrap(), Err("done"));
			assert_eq!(controller.shutdown_reason(), Some("done"));
		})
	}

	#[test]
	fn completed_shutdown_waits_for_tracked_tasks() {
		test_runtime(async {
			let controller = Controller::new();
			let (sender, receiver) = oneshot::channel();

			controller.spawn(async move {
				// cancelled by the shutdown, sender dropped with the future
				future::pending::<()>().await;
				_ = sender.send(());
			});
			assert_eq!(controller.active_tasks(), 1);

			assert!(controller.trigger_shutdown("done").is_ok());
			assert_eq!(controller.completed_shutdown().await, "done");
			assert_eq!(controller.active_tasks(), 0);
			assert!(receiver.await.is_err());
		})
	}

	#[test]
	fn completed_shutdown_waits_for_task_cleanup() {
		test_runtime(async {
			let controller = Controller::new();
			let (sender, receiver) = oneshot::channel();

			controller.track({
				let controller = controller.clone();
				async move {
					controller.triggered_shutdown().await;
					_ = sender.send("cleaned up");
				}
			});

			assert!(controller.trigger_shutdown("done").is_ok());
			assert_eq!(controller.completed_shutdown().await, "done");
			assert_eq!(receiver.await, Ok("cleaned up"));
		})
	}

	#[test]
	fn finished_tasks_leave_registry() {
		test_runtime(async {
			let controller = Controller::<()>::new();
			let handle = controller.spawn(async { 7 });
			assert_eq!(handle.await.unwrap(), Some(7));
			assert_eq!(controller.active_tasks(), 0);
		})
	}
}
