//! Containment of errors thrown by interceptors.
//!
//! Every trampoline catches `Throwable` and hands it to
//! `InterceptorInvokerHelper.handleException`, whose native end lands here.
//! Nothing in this module may panic or report failure back to the caller.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use super::InterceptorId;

/// Callback notified for every contained error on the current thread.
pub type ExceptionObserver = Arc<dyn Fn(Option<InterceptorId>, &str) + Send + Sync>;

thread_local! {
    static CURRENT_INTERCEPTOR: Cell<Option<InterceptorId>> = const { Cell::new(None) };
    static OBSERVER: RefCell<Option<ExceptionObserver>> = const { RefCell::new(None) };
}

pub struct InvokerHelper;

impl InvokerHelper {
    /// Records the interceptor a trampoline on this thread is about to call.
    pub fn set_current(id: Option<InterceptorId>) {
        CURRENT_INTERCEPTOR.with(|c| c.set(id));
    }

    pub fn current() -> Option<InterceptorId> {
        CURRENT_INTERCEPTOR.with(Cell::get)
    }

    pub fn handle_exception(description: &str) {
        let id = Self::current();
        match id {
            Some(id) => log::warn!("interceptor {id} threw, ignoring: {description}"),
            None => log::warn!("interceptor threw, ignoring: {description}"),
        }
        let observer = OBSERVER.try_with(|o| o.borrow().clone()).ok().flatten();
        if let Some(observer) = observer {
            observer(id, description);
        }
    }

    /// Installs an observer for the current thread, returning the previous one.
    pub fn set_observer(observer: Option<ExceptionObserver>) -> Option<ExceptionObserver> {
        OBSERVER.with(|o| o.replace(observer))
    }
}
