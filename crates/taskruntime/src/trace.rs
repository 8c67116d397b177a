use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
    static TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chain a panic hook that records a backtrace at the panic site, but only
/// while a [`TracePanics`] future is being polled on this thread.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

/// Take the backtrace recorded by the last panic inside a [`TracePanics`]
/// poll on this thread.
///
/// Must be called on the thread that caught the panic, before the worker
/// yields again.
pub(crate) fn take() -> Option<String> {
    TRACE.with(|slot| slot.borrow_mut().take())
}

/// Polls `inner` with the panic hook armed.
pub(crate) struct TracePanics<F> {
    inner: F,
}

impl<F> TracePanics<F> {
    pub(crate) fn new(inner: F) -> Self {
        install_hook();
        Self { inner }
    }
}

/// Disarms on drop, including while unwinding.
struct Armed {
    previous: bool,
}

impl Armed {
    fn arm() -> Self {
        TRACE.with(|slot| slot.borrow_mut().take());
        Self {
            previous: ARMED.with(|armed| armed.replace(true)),
        }
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(self.previous));
    }
}

impl<F: Future + Unpin> Future for TracePanics<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _armed = Armed::arm();
        Pin::new(&mut self.inner).poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    #[inline(never)]
    fn trace_site() -> u32 {
        panic!("traced")
    }

    #[tokio::test]
    async fn records_the_panicking_frame() {
        let body: Pin<Box<dyn Future<Output = u32> + Send>> = Box::pin(async { trace_site() });
        let result = AssertUnwindSafe(TracePanics::new(body)).catch_unwind().await;
        assert!(result.is_err());

        let trace = take().expect("no backtrace recorded");
        assert!(trace.contains("trace_site"), "{trace}");
        assert!(take().is_none());
    }

    #[test]
    fn panics_outside_a_traced_poll_record_nothing() {
        install_hook();
        let result = std::panic::catch_unwind(|| panic!("untraced"));
        assert!(result.is_err());
        assert!(take().is_none());
    }
}
