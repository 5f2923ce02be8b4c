//! Panic isolation around subscription callbacks.
//!
//! Every callback runs inside an [`Invocation`]. The invocation starts out
//! "not completed" and is only marked completed once the callback future
//! resolved normally. Anything else (a panic, a panic with a payload that
//! cannot be rendered, or the future being dropped half way) is reported to
//! the [`Handler`] exactly once and the delivery is naked unless the callback
//! already acknowledged it.
//!
//! The stack passed to the handler is recorded at the panic site by a panic
//! hook installed on first use. The previous hook still runs. Cancelled
//! callbacks have no panic site and get the stack of the guard instead.

use crate::context::Context;
use crate::handler::Handler;
use crate::message::Delivery;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::Once;
use tracing::warn;

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records the stack at the panic site while a
/// supervised callback is being polled on the current thread.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let stack = Backtrace::force_capture().to_string();
                PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
            }
            previous(info);
        }));
    });
}

fn take_panic_stack() -> Option<String> {
    PANIC_STACK.with(|slot| slot.borrow_mut().take())
}

/// Marks the current thread as polling a supervised callback until dropped.
struct CaptureScope {
    previous: bool,
}

impl CaptureScope {
    fn enter() -> Self {
        Self {
            previous: CAPTURING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        CAPTURING.with(|flag| flag.set(self.previous));
    }
}

/// How a supervised callback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The callback returned normally.
    Completed,
    /// The callback panicked; `value` is the rendered panic payload.
    Panicked { value: Option<String> },
}

impl Outcome {
    /// Whether the callback returned normally.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

pub(crate) struct Invocation<'a> {
    handler: &'a dyn Handler,
    ctx: &'a Context,
    topic: &'a str,
    delivery: &'a Delivery,
    completed: bool,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        handler: &'a dyn Handler,
        ctx: &'a Context,
        topic: &'a str,
        delivery: &'a Delivery,
    ) -> Self {
        Self {
            handler,
            ctx,
            topic,
            delivery,
            completed: false,
        }
    }

    /// Drive `callback` to completion, converting a panic into an [`Outcome`].
    pub(crate) async fn run<F>(mut self, callback: F) -> Outcome
    where
        F: Future<Output = ()> + Send,
    {
        install_panic_hook();

        let mut callback = pin!(callback);
        let supervised = futures::future::poll_fn(|cx| {
            let _scope = CaptureScope::enter();
            callback.as_mut().poll(cx)
        });

        let (outcome, stack) = match AssertUnwindSafe(supervised).catch_unwind().await {
            Ok(()) => (Outcome::Completed, None),
            Err(panic) => (
                Outcome::Panicked {
                    value: panic_message(panic.as_ref()),
                },
                take_panic_stack(),
            ),
        };
        self.completed = true;

        if let Outcome::Panicked { value } = &outcome {
            self.report(value.as_deref(), stack);
            // Ignored when the callback already acked or naked.
            let _ = self.delivery.nak().await;
        }
        outcome
    }

    fn report(&self, value: Option<&str>, stack: Option<String>) {
        let stack = stack.unwrap_or_else(|| Backtrace::force_capture().to_string());
        self.handler.on_subscribe_panic(
            self.ctx,
            self.topic,
            self.delivery.payload(),
            value,
            &stack,
        );
    }
}

impl Drop for Invocation<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        self.report(None, None);
        if self.delivery.is_acknowledged() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let delivery = self.delivery.clone();
                runtime.spawn(async move {
                    let _ = delivery.nak().await;
                });
            }
            Err(_) => warn!(
                topic = %self.topic,
                "Callback abandoned outside a runtime, leaving redelivery to the broker"
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> Option<String> {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        Some((*message).to_string())
    } else {
        panic.downcast_ref::<String>().cloned()
    }
}
