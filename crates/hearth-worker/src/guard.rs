//! Runs handlers so that a panic becomes an error frame instead of a crash.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures::FutureExt;
use hearth_proto::ErrorCode;
use tracing::{debug, error};

use crate::handlers::EventHandlers;
use crate::request::Request;
use crate::response::Response;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Installs a panic hook that remembers the backtrace of the most recent
/// panic on each thread, then defers to the previous hook.
pub(crate) fn capture_backtraces() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Runs the handler for `event` and guarantees the response ends with
/// exactly one choke, whatever the handler did.
pub(crate) async fn run_handler(
    handlers: Arc<EventHandlers>,
    event: String,
    request: Request,
    response: Response,
    debug: bool,
) {
    let guard = response.handle();
    let outcome = AssertUnwindSafe(async {
        handlers.call(&event, request, response).await;
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(()) => {
            if guard.close().is_ok() {
                debug!(event = %event, session = guard.session(), "handler returned, response closed");
            }
        }
        Err(payload) => {
            let recovered = panic_message(payload.as_ref());
            error!(event = %event, session = guard.session(), panic = %recovered, "handler panicked");

            let mut message = format!("Event: '{event}', recover: {recovered}");
            let backtrace = take_backtrace();
            if debug {
                if let Some(backtrace) = backtrace {
                    message.push_str(", stack: \n");
                    message.push_str(&backtrace);
                }
            }
            let _ = guard.error_code(ErrorCode::PanicInHandler, &message);
        }
    }
}
