//! Completion events.
//!
//! After a backend has emitted a response it dispatches one
//! [`RequestHandled`] event carrying the request and the response exactly as
//! emitted. Listeners receive shared references, so nothing they do can alter
//! what was written to the client.

use std::{fmt, sync::Arc};

use crate::http::{Request, Response};

/// A request and the response that was emitted for it.
#[derive(Debug, Clone)]
pub struct RequestHandled {
    pub request: Request,
    pub response: Response,
}

/// Receives completion events.
///
/// Listeners run on the worker that served the request, after emission, in
/// registration order. Long-running work should be spawned rather than done
/// inline.
pub trait Listener: Send + Sync {
    fn handle(&self, event: &RequestHandled);
}

impl<F> Listener for F
where
    F: Fn(&RequestHandled) + Send + Sync,
{
    fn handle(&self, event: &RequestHandled) {
        (self)(event)
    }
}

/// Ordered set of listeners notified once per handled request.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn Listener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: impl Listener + 'static) -> &mut Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Notifies every listener in registration order.
    pub fn dispatch(&self, event: &RequestHandled) {
        for listener in &self.listeners {
            listener.handle(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use std::sync::Mutex;

    #[test]
    fn listeners_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut events = EventDispatcher::new();
        for label in ["first", "second"] {
            let seen = seen.clone();
            events.add_listener(move |event: &RequestHandled| {
                seen.lock()
                    .unwrap()
                    .push((label, event.response.status().as_u16()));
            });
        }

        let event = RequestHandled {
            request: Request::builder().build(),
            response: Response::new(StatusCode::Accepted),
        };
        events.dispatch(&event);

        assert_eq!(events.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 202), ("second", 202)]);
    }
}
