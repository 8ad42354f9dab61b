use super::{
    executor::ComponentExecutor,
    scheduler::Scheduler,
    types::{Component, ComponentHandle, ComponentSender, ConsumableJoinHandle},
    ComponentContext, Handler, Message,
};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// `System` is the runtime that owns the components started within it. It is
/// cheap to clone: every clone refers to the same underlying runtime, so a
/// `System` handle can be handed to every component it starts. The
/// `TaskTracker` lets `join()` be awaited independently of (and even after)
/// each component's own `ComponentHandle::join()`.
#[derive(Clone, Default)]
pub struct System {
    tracker: TaskTracker,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System").finish()
    }
}

impl System {
    pub fn new() -> Self {
        System {
            tracker: TaskTracker::new(),
        }
    }

    /// Starts a component: allocates its mailbox, spawns the task that drains
    /// it, and returns a handle the caller uses to send messages or stop it.
    pub fn start_component<C>(&self, component: C) -> ComponentHandle<C>
    where
        C: Component + Send + 'static,
    {
        let queue_size = component.queue_size();
        let (tx, rx) = tokio::sync::mpsc::channel(queue_size.max(1));
        let cancellation_token = CancellationToken::new();
        let sender = ComponentSender::new(tx);
        let scheduler = Scheduler::new();

        let mut executor = ComponentExecutor::new(
            sender.clone(),
            cancellation_token.clone(),
            component,
            self.clone(),
            scheduler,
        );

        let join_handle = self.tracker.spawn(async move {
            executor.run(rx).await;
        });

        ComponentHandle::new(
            cancellation_token,
            Some(ConsumableJoinHandle::from_tokio_task_handle(join_handle)),
            sender,
        )
    }

    /// Waits for every component started on this system to finish. Safe to
    /// call even if some components' own handles were already joined.
    pub async fn join(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Registers a foreign `Stream` as a source of messages for `ctx`'s
    /// component, forwarding each item until the stream ends or the
    /// component is cancelled. Cache maintainers use this to turn a broker's
    /// change-notification stream into component messages.
    pub(crate) fn register_stream<C, S, M>(&self, mut stream: S, ctx: &ComponentContext<C>)
    where
        C: Component + Handler<M>,
        M: Message,
        S: Stream + Send + Unpin + Stream<Item = M> + 'static,
    {
        use futures::StreamExt;

        let sender = ctx.sender.clone();
        let cancellation_token = ctx.cancellation_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    item = stream.next() => {
                        match item {
                            Some(message) => {
                                if sender.wrap_and_send(message, None).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }
}
