//! Event handlers invoked in-line with every store mutation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use kmirror_core::{kind_of, ChangeEvent, DynamicObject};
use tracing::{debug, warn};

/// Callbacks for observed changes. Failures are logged by the dispatcher and
/// never roll back the mutation that produced the event.
#[allow(unused_variables)]
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: &DynamicObject) -> Result<()> {
        Ok(())
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) -> Result<()> {
        Ok(())
    }

    fn on_delete(&self, obj: &DynamicObject) -> Result<()> {
        Ok(())
    }
}

/// Handler that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

/// Logs `<Kind> <ns>/<name> <event>` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl LoggingHandler {
    fn log(event: &str, obj: &DynamicObject) {
        let Some(name) = obj.metadata.name.as_deref() else {
            warn!(event, "unknown object metadata");
            return;
        };
        let kind = kind_of(obj).unwrap_or("<unknown>");
        let ns = obj.metadata.namespace.as_deref().unwrap_or("");
        debug!("{} {}/{} {}", kind, ns, name, event);
    }
}

impl EventHandler for LoggingHandler {
    fn on_add(&self, obj: &DynamicObject) -> Result<()> {
        Self::log("added", obj);
        Ok(())
    }

    fn on_update(&self, _old: &DynamicObject, new: &DynamicObject) -> Result<()> {
        Self::log("updated", new);
        Ok(())
    }

    fn on_delete(&self, obj: &DynamicObject) -> Result<()> {
        Self::log("deleted", obj);
        Ok(())
    }
}

type ObjFn = Box<dyn Fn(&DynamicObject) -> Result<()> + Send + Sync>;
type Obj2Fn = Box<dyn Fn(&DynamicObject, &DynamicObject) -> Result<()> + Send + Sync>;

/// Closure-backed handler; unset callbacks do nothing.
#[derive(Default)]
pub struct HandlerFns {
    add: Option<ObjFn>,
    update: Option<Obj2Fn>,
    delete: Option<ObjFn>,
}

impl HandlerFns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&DynamicObject) -> Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(
        mut self,
        f: impl Fn(&DynamicObject, &DynamicObject) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&DynamicObject) -> Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl EventHandler for HandlerFns {
    fn on_add(&self, obj: &DynamicObject) -> Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) -> Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &DynamicObject) -> Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}

/// Routes change events of one kind to its handler, containing errors and panics.
#[derive(Clone)]
pub struct Dispatcher {
    kind: String,
    handler: Arc<dyn EventHandler>,
}

impl Dispatcher {
    pub fn new(kind: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self { kind: kind.into(), handler }
    }

    pub fn dispatch(&self, ev: &ChangeEvent) {
        metrics::counter!("mirror_events_total", 1u64, "kind" => self.kind.clone(), "event" => ev.label());
        let handler = &self.handler;
        let res = catch_unwind(AssertUnwindSafe(|| match ev {
            ChangeEvent::Added(o) => handler.on_add(o),
            ChangeEvent::Updated { old, new } => handler.on_update(old, new),
            ChangeEvent::Deleted(o) => handler.on_delete(o),
        }));
        let err = match res {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string()),
        };
        metrics::counter!("mirror_handler_errors_total", 1u64, "kind" => self.kind.clone());
        warn!(kind = %self.kind, event = ev.label(), error = %err, "event handler failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kube::core::ObjectMeta;

    fn obj(name: &str) -> Arc<DynamicObject> {
        Arc::new(DynamicObject {
            types: None,
            metadata: ObjectMeta { namespace: Some("a".into()), name: Some(name.into()), ..Default::default() },
            data: serde_json::Value::Null,
        })
    }

    #[test]
    fn handler_fns_route_by_event() {
        let adds = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));
        let h = HandlerFns::new()
            .on_add({
                let adds = adds.clone();
                move |_| {
                    adds.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_update({
                let updates = updates.clone();
                move |_, _| {
                    updates.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        let d = Dispatcher::new("widget", Arc::new(h));
        d.dispatch(&ChangeEvent::Added(obj("x")));
        d.dispatch(&ChangeEvent::Updated { old: obj("x"), new: obj("x") });
        d.dispatch(&ChangeEvent::Deleted(obj("x")));
        assert_eq!(adds.load(Ordering::SeqCst), 1);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_and_panics_are_contained() {
        let h = HandlerFns::new()
            .on_add(|_| Err(anyhow::anyhow!("malformed metadata")))
            .on_delete(|_| panic!("boom"));
        let d = Dispatcher::new("widget", Arc::new(h));
        d.dispatch(&ChangeEvent::Added(obj("x")));
        d.dispatch(&ChangeEvent::Deleted(obj("x")));
    }

    #[test]
    fn logging_handler_tolerates_missing_name() {
        let nameless = DynamicObject { types: None, metadata: ObjectMeta::default(), data: serde_json::Value::Null };
        assert!(LoggingHandler.on_add(&nameless).is_ok());
        assert!(LoggingHandler.on_delete(&obj("x")).is_ok());
    }
}
