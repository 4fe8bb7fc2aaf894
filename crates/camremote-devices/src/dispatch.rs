/*!
 * Event dispatch from backend threads.
 *
 * The backend calls [`EventDispatcher::notify`] on a thread it owns. The
 * dispatcher logs the notification, queues it for the connection state
 * machine, publishes it on the event bus and, for the four notifications
 * that have one, invokes the registered callback. None of these steps
 * blocks or calls back into the connection.
 */
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use camremote_core::event::SharedEventBus;

use crate::backend::{Notification, NotificationSink};
use crate::codes::{PropertyCode, VendorCode};
use crate::device::CameraEvent;

/// Called when the backend reports the link up
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
/// Called with the reason code when the backend reports the link down
pub type DisconnectCallback = Arc<dyn Fn(VendorCode) + Send + Sync>;
/// Called with the changed codes; an empty slice means "unknown set"
pub type PropertyChangedCallback = Arc<dyn Fn(&[PropertyCode]) + Send + Sync>;
/// Called with the code of a backend error
pub type ErrorCallback = Arc<dyn Fn(VendorCode) + Send + Sync>;

/// A single-slot callback; registering replaces the previous one
struct Slot<T: ?Sized>(RwLock<Option<Arc<T>>>);

impl<T: ?Sized> Slot<T> {
    fn new() -> Self {
        Self(RwLock::new(None))
    }

    fn set(&self, callback: Option<Arc<T>>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    // cloned out so the lock is not held while the callback runs
    fn get(&self) -> Option<Arc<T>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn is_set(&self) -> bool {
        self.0.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Receiving end of the notification queue, owned by the connection
#[derive(Debug)]
pub struct NotificationQueue(mpsc::UnboundedReceiver<Notification>);

impl NotificationQueue {
    /// Take everything queued so far, in arrival order, without waiting
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.0.try_recv() {
            drained.push(notification);
        }
        drained
    }

    /// Wait for the next notification
    pub async fn recv(&mut self) -> Option<Notification> {
        self.0.recv().await
    }
}

/// Fan-out point for backend notifications
pub struct EventDispatcher {
    on_connect: Slot<dyn Fn() + Send + Sync>,
    on_disconnect: Slot<dyn Fn(VendorCode) + Send + Sync>,
    on_property_changed: Slot<dyn Fn(&[PropertyCode]) + Send + Sync>,
    on_error: Slot<dyn Fn(VendorCode) + Send + Sync>,
    queue: mpsc::UnboundedSender<Notification>,
    events: SharedEventBus,
}

impl EventDispatcher {
    /// Create a dispatcher and the queue it feeds
    pub fn new(events: SharedEventBus) -> (Arc<Self>, NotificationQueue) {
        let (queue, receiver) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            on_connect: Slot::new(),
            on_disconnect: Slot::new(),
            on_property_changed: Slot::new(),
            on_error: Slot::new(),
            queue,
            events,
        });
        (dispatcher, NotificationQueue(receiver))
    }

    /// Register the connect callback
    pub fn set_connect_callback(&self, callback: Option<ConnectCallback>) {
        self.on_connect.set(callback);
    }

    /// Register the disconnect callback
    pub fn set_disconnect_callback(&self, callback: Option<DisconnectCallback>) {
        self.on_disconnect.set(callback);
    }

    /// Register the property-changed callback
    pub fn set_property_changed_callback(&self, callback: Option<PropertyChangedCallback>) {
        self.on_property_changed.set(callback);
    }

    /// Register the error callback
    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.on_error.set(callback);
    }

    /// The event bus notifications are published on
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    fn log(notification: &Notification) {
        match notification {
            Notification::Connected { version } => info!("Camera connected (version {})", version),
            Notification::Disconnected { reason } => warn!("Camera disconnected ({})", reason),
            Notification::PropertyChanged => debug!("Properties changed"),
            Notification::PropertyChangedCodes(codes) => {
                debug!("{} properties changed", codes.len())
            }
            Notification::LiveViewPropertyChanged
            | Notification::LiveViewPropertyChangedCodes(_) => {
                trace!("Live view properties changed")
            }
            Notification::DownloadComplete { filename, kind } => {
                info!("Download complete: {} (type {})", filename, kind)
            }
            Notification::ContentsTransfer {
                notify,
                handle,
                filename,
            } => debug!(
                "Contents transfer {} for content {}: {:?}",
                notify, handle, filename
            ),
            Notification::Warning(code) => warn!("Camera warning {}", code),
            Notification::Error(code) => error!("Camera error {}", code),
        }
    }

    fn event(notification: &Notification) -> Option<CameraEvent> {
        let event = match notification {
            Notification::Connected { version } => CameraEvent::Connected { version: *version },
            Notification::Disconnected { reason } => CameraEvent::Disconnected { reason: *reason },
            Notification::PropertyChanged => CameraEvent::PropertiesChanged { codes: Vec::new() },
            Notification::PropertyChangedCodes(codes) => CameraEvent::PropertiesChanged {
                codes: codes.clone(),
            },
            Notification::DownloadComplete { filename, .. } => CameraEvent::DownloadComplete {
                filename: filename.clone(),
            },
            Notification::Warning(code) => CameraEvent::Warning { code: *code },
            Notification::Error(code) => CameraEvent::Error { code: *code },
            Notification::LiveViewPropertyChanged
            | Notification::LiveViewPropertyChangedCodes(_)
            | Notification::ContentsTransfer { .. } => return None,
        };
        Some(event)
    }

    fn invoke(&self, notification: &Notification) {
        let kind = notification.kind();
        let call = |f: &dyn Fn()| {
            // a panicking callback must not unwind into the backend's thread
            if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                error!("The {} callback panicked", kind);
            }
        };

        match notification {
            Notification::Connected { .. } => {
                if let Some(cb) = self.on_connect.get() {
                    call(&|| cb());
                }
            }
            Notification::Disconnected { reason } => {
                if let Some(cb) = self.on_disconnect.get() {
                    call(&|| cb(*reason));
                }
            }
            Notification::PropertyChanged => {
                if let Some(cb) = self.on_property_changed.get() {
                    let unknown: &[PropertyCode] = &[];
                    call(&|| cb(unknown));
                }
            }
            Notification::PropertyChangedCodes(codes) => {
                if let Some(cb) = self.on_property_changed.get() {
                    call(&|| cb(codes.as_slice()));
                }
            }
            Notification::Error(code) => {
                if let Some(cb) = self.on_error.get() {
                    call(&|| cb(*code));
                }
            }
            _ => {}
        }
    }
}

impl NotificationSink for EventDispatcher {
    fn notify(&self, notification: Notification) {
        Self::log(&notification);

        if let Some(event) = Self::event(&notification) {
            if let Err(e) = self.events.publish(event) {
                warn!("Failed to publish camera event: {}", e);
            }
        }

        self.invoke(&notification);

        if self.queue.send(notification).is_err() {
            trace!("Notification queue closed; dropping notification");
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("on_connect", &self.on_connect.is_set())
            .field("on_disconnect", &self.on_disconnect.is_set())
            .field("on_property_changed", &self.on_property_changed.is_set())
            .field("on_error", &self.on_error.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_queue_preserves_arrival_order() {
        let (dispatcher, mut queue) = EventDispatcher::new(SharedEventBus::new());
        dispatcher.notify(Notification::Connected { version: 3 });
        dispatcher.notify(Notification::PropertyChanged);
        dispatcher.notify(Notification::Disconnected {
            reason: VendorCode::CONNECT_DISCONNECTED,
        });

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], Notification::Connected { version: 3 });
        assert_eq!(drained[1], Notification::PropertyChanged);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_callbacks_fire_on_foreign_thread() {
        let (dispatcher, _queue) = EventDispatcher::new(SharedEventBus::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let reason = Arc::new(AtomicU32::new(0));
        let changed = Arc::new(Mutex::new(Vec::new()));

        let c = connects.clone();
        dispatcher.set_connect_callback(Some(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        let r = reason.clone();
        dispatcher.set_disconnect_callback(Some(Arc::new(move |code: VendorCode| {
            r.store(code.0, Ordering::SeqCst);
        })));
        let ch = changed.clone();
        dispatcher.set_property_changed_callback(Some(Arc::new(move |codes: &[PropertyCode]| {
            ch.lock().unwrap().push(codes.to_vec());
        })));

        let backend_thread = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                dispatcher.notify(Notification::Connected { version: 1 });
                dispatcher.notify(Notification::PropertyChanged);
                dispatcher.notify(Notification::PropertyChangedCodes(vec![PropertyCode::F_NUMBER]));
                dispatcher.notify(Notification::Disconnected {
                    reason: VendorCode::CONNECT_DISCONNECTED,
                });
            })
        };
        backend_thread.join().unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(reason.load(Ordering::SeqCst), VendorCode::CONNECT_DISCONNECTED.0);
        assert_eq!(
            *changed.lock().unwrap(),
            vec![vec![], vec![PropertyCode::F_NUMBER]]
        );
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (dispatcher, mut queue) = EventDispatcher::new(SharedEventBus::new());
        dispatcher.set_error_callback(Some(Arc::new(|code: VendorCode| {
            assert_eq!(code, VendorCode::NONE, "boom")
        })));

        dispatcher.notify(Notification::Error(VendorCode::DEVICE_UNKNOWN));
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn test_unforwarded_notifications_do_not_fail() {
        let (dispatcher, mut queue) = EventDispatcher::new(SharedEventBus::new());
        dispatcher.notify(Notification::LiveViewPropertyChanged);
        dispatcher.notify(Notification::ContentsTransfer {
            notify: 1,
            handle: 42,
            filename: None,
        });
        assert_eq!(queue.drain().len(), 2);

        drop(queue);
        // closed queue: dropped quietly
        dispatcher.notify(Notification::Warning(VendorCode::GENERIC_UNKNOWN));
    }

    #[tokio::test]
    async fn test_events_published() {
        let events = SharedEventBus::new();
        let mut rx = events.subscribe::<CameraEvent>().unwrap();
        let (dispatcher, _queue) = EventDispatcher::new(events);

        dispatcher.notify(Notification::PropertyChangedCodes(vec![PropertyCode::ISO_SENSITIVITY]));
        dispatcher.notify(Notification::LiveViewPropertyChanged);
        dispatcher.notify(Notification::Error(VendorCode::DEVICE_UNKNOWN));

        match rx.recv().await.unwrap() {
            CameraEvent::PropertiesChanged { codes } => {
                assert_eq!(codes, vec![PropertyCode::ISO_SENSITIVITY])
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), CameraEvent::Error { .. }));
    }
}
