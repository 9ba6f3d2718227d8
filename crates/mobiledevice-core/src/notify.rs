//! Device and restorable-device notifications.
//!
//! The native layer calls back on a thread of its choosing with an opaque
//! context. Here that context is the subscription id, looked up in a
//! process-wide registry on every callback. An id that is no longer
//! registered means the callback arrived late; it is dropped.
//!
//! Each subscription has a delivery gate held while its observer runs.
//! `unsubscribe` closes the subscription and then takes the gate, so once it
//! returns no observer call for that id is running or will start.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_int, c_void};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::device::{
    DeviceCalls, NativeSubscription, NotificationContext, RestorableDeviceState,
    RestorableRegistration,
};
use crate::error::{BindingError, Result};
use crate::ffi::{AmDeviceNotification, AmRestorableDeviceRef, notification};
use crate::handle::{DeviceHandle, RestorableDeviceHandle};
use crate::sync::IgnorePoison;

/// Which notification stream a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Device,
    Restorable,
}

/// A notification, already translated from its native status code.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceConnected(DeviceHandle),
    DeviceDisconnected(DeviceHandle),
    DeviceUnsubscribed(DeviceHandle),
    DevicePaired(DeviceHandle),
    RestorableConnected {
        device: RestorableDeviceHandle,
        state: RestorableDeviceState,
    },
    RestorableDisconnected {
        device: RestorableDeviceHandle,
        state: RestorableDeviceState,
    },
}

impl Event {
    pub fn category(&self) -> Category {
        match self {
            Event::DeviceConnected(_)
            | Event::DeviceDisconnected(_)
            | Event::DeviceUnsubscribed(_)
            | Event::DevicePaired(_) => Category::Device,
            Event::RestorableConnected { .. } | Event::RestorableDisconnected { .. } => {
                Category::Restorable
            }
        }
    }
}

/// Observer trait for receiving notifications.
///
/// Called on the native library's thread. Must not block for long.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl EventObserver for NullObserver {
    fn on_event(&self, _event: &Event) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, event: &Event) {
        match event {
            Event::DeviceConnected(device) => info!(device = %device, "Device connected"),
            Event::DeviceDisconnected(device) => warn!(device = %device, "Device disconnected"),
            Event::DeviceUnsubscribed(device) => {
                debug!(device = %device, "Device notifications unsubscribed")
            }
            Event::DevicePaired(device) => info!(device = %device, "Device paired"),
            Event::RestorableConnected { device, state } => {
                info!(device = %device, state = %state, "Restorable device connected")
            }
            Event::RestorableDisconnected { device, state } => {
                warn!(device = %device, state = %state, "Restorable device disconnected")
            }
        }
    }
}

/// Observer that forwards events into a channel without blocking.
pub struct ChannelObserver {
    sender: Sender<Event>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<Event>) -> Self {
        Self { sender }
    }
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &Event) {
        if self.sender.try_send(event.clone()).is_err() {
            trace!("Event receiver gone; dropping event");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    Unsubscribing,
    Failed,
}

/// Per-subscription delivery state shared with the trampolines.
struct Slot {
    category: Category,
    observer: Arc<dyn EventObserver>,
    calls: Arc<dyn DeviceCalls>,
    gate: Mutex<()>,
    closed: AtomicBool,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Failed subscriptions remembered for `state`, oldest evicted first.
const FAILED_HISTORY: usize = 32;

static REGISTRY: LazyLock<Mutex<HashMap<u64, Arc<Slot>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

thread_local! {
    /// Subscriptions whose observer is running on this thread.
    static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy)]
enum NativeToken {
    Device(NativeSubscription),
    Restorable(RestorableRegistration),
}

struct Subscription {
    slot: Arc<Slot>,
    state: SubscriptionState,
    token: Option<NativeToken>,
}

/// Owns native notification subscriptions and routes their callbacks to
/// observers.
///
/// Dropping the dispatcher unsubscribes everything still active.
pub struct NotificationDispatcher {
    calls: Arc<dyn DeviceCalls>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    failed: Mutex<VecDeque<u64>>,
}

impl NotificationDispatcher {
    pub fn new(calls: Arc<dyn DeviceCalls>) -> Self {
        Self {
            calls,
            subscriptions: Mutex::new(HashMap::new()),
            failed: Mutex::new(VecDeque::new()),
        }
    }

    /// A native failure comes back as [`BindingError::SubscribeFailed`]
    /// carrying the id, whose [`state`](Self::state) then reads `Failed`.
    #[instrument(level = "debug", skip(self, observer))]
    pub fn subscribe(
        &self,
        category: Category,
        observer: Arc<dyn EventObserver>,
    ) -> Result<SubscriptionId> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            category,
            observer,
            calls: Arc::clone(&self.calls),
            gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        // Registered first: the native layer may report already-attached
        // devices before subscribe returns.
        REGISTRY.lock_ignore_poison().insert(id, Arc::clone(&slot));
        self.subscriptions.lock_ignore_poison().insert(
            id,
            Subscription {
                slot,
                state: SubscriptionState::Subscribing,
                token: None,
            },
        );

        let context = NotificationContext::new(id as usize);
        let token = match category {
            Category::Device => self
                .calls
                .notification_subscribe(device_trampoline, context)
                .map(NativeToken::Device),
            Category::Restorable => self
                .calls
                .restorable_register(restorable_trampoline, context)
                .map(NativeToken::Restorable),
        };

        let mut subscriptions = self.subscriptions.lock_ignore_poison();
        let Some(entry) = subscriptions.get_mut(&id) else {
            return Err(BindingError::NotSubscribed(id));
        };
        match token {
            Ok(token) => {
                entry.state = SubscriptionState::Active;
                entry.token = Some(token);
                info!(id, ?category, "Subscribed to notifications");
                Ok(SubscriptionId(id))
            }
            Err(e) => {
                entry.slot.closed.store(true, Ordering::Release);
                subscriptions.remove(&id);
                drop(subscriptions);
                REGISTRY.lock_ignore_poison().remove(&id);

                let mut failed = self.failed.lock_ignore_poison();
                if failed.len() == FAILED_HISTORY {
                    failed.pop_front();
                }
                failed.push_back(id);
                warn!(id, ?category, error = %e, "Notification subscribe failed");
                Err(BindingError::SubscribeFailed {
                    id,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Subscribe with a channel as the observer.
    pub fn subscribe_channel(
        &self,
        category: Category,
    ) -> Result<(SubscriptionId, Receiver<Event>)> {
        let (sender, receiver) = unbounded();
        let id = self.subscribe(category, Arc::new(ChannelObserver::new(sender)))?;
        Ok((id, receiver))
    }

    /// Stop delivery for `id`.
    ///
    /// When this returns, no observer call for `id` is in progress, except
    /// the one this call is made from, if any.
    #[instrument(level = "debug", skip(self))]
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let (slot, token) = {
            let mut subscriptions = self.subscriptions.lock_ignore_poison();
            match subscriptions.get_mut(&id.0) {
                Some(entry) if entry.state == SubscriptionState::Active => {
                    entry.state = SubscriptionState::Unsubscribing;
                    (Arc::clone(&entry.slot), entry.token.take())
                }
                _ => return Err(BindingError::NotSubscribed(id.0)),
            }
        };

        let native = match token {
            Some(NativeToken::Device(subscription)) => {
                self.calls.notification_unsubscribe(subscription)
            }
            Some(NativeToken::Restorable(registration)) => {
                self.calls.restorable_unregister(registration)
            }
            None => Ok(()),
        };
        if let Err(e) = &native {
            warn!(id = id.0, error = %e, "Native unsubscribe failed; dropping late callbacks");
        }

        REGISTRY.lock_ignore_poison().remove(&id.0);
        slot.closed.store(true, Ordering::Release);
        let reentrant = DELIVERING.with(|d| d.borrow().contains(&id.0));
        if !reentrant {
            drop(slot.gate.lock_ignore_poison());
        }

        self.subscriptions.lock_ignore_poison().remove(&id.0);
        debug!(id = id.0, "Unsubscribed");
        native
    }

    pub fn state(&self, id: SubscriptionId) -> SubscriptionState {
        if let Some(entry) = self.subscriptions.lock_ignore_poison().get(&id.0) {
            return entry.state;
        }
        if self.failed.lock_ignore_poison().contains(&id.0) {
            SubscriptionState::Failed
        } else {
            SubscriptionState::Unsubscribed
        }
    }

    /// Ids currently delivering events.
    pub fn active(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self
            .subscriptions
            .lock_ignore_poison()
            .iter()
            .filter(|(_, entry)| entry.state == SubscriptionState::Active)
            .map(|(id, _)| SubscriptionId(*id))
            .collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("active", &self.active())
            .finish()
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        for id in self.active() {
            if let Err(e) = self.unsubscribe(id) {
                warn!(id = id.0, error = %e, "Unsubscribe on drop failed");
            }
        }
    }
}

/// Route one callback to the observer registered under `id`.
fn deliver(id: u64, build: impl FnOnce(&Slot) -> Option<Event>) {
    let slot = REGISTRY.lock_ignore_poison().get(&id).cloned();
    let Some(slot) = slot else {
        trace!(id, "Callback for inactive subscription dropped");
        return;
    };

    let _gate = slot.gate.lock_ignore_poison();
    if slot.closed.load(Ordering::Acquire) {
        trace!(id, "Callback raced with unsubscribe; dropped");
        return;
    }
    let Some(event) = build(&slot) else {
        return;
    };
    if event.category() != slot.category {
        warn!(id, ?event, "Event does not match subscription category");
        return;
    }

    DELIVERING.with(|d| d.borrow_mut().push(id));
    let outcome = catch_unwind(AssertUnwindSafe(|| slot.observer.on_event(&event)));
    DELIVERING.with(|d| {
        d.borrow_mut().pop();
    });
    if outcome.is_err() {
        error!(id, "Notification observer panicked");
    }
}

fn context_id(context: *mut c_void) -> u64 {
    NotificationContext::from_ptr(context).value() as u64
}

unsafe extern "C" fn device_trampoline(info: *const AmDeviceNotification, context: *mut c_void) {
    if info.is_null() {
        return;
    }
    // SAFETY: the native layer passes a valid notification for the duration of the call.
    let info = unsafe { *info };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        deliver(context_id(context), |_| {
            // SAFETY: the device reference comes from the native layer.
            let device = unsafe { DeviceHandle::from_raw(info.device) }?;
            match info.status {
                notification::CONNECTED => Some(Event::DeviceConnected(device)),
                notification::DISCONNECTED => Some(Event::DeviceDisconnected(device)),
                notification::UNSUBSCRIBED => Some(Event::DeviceUnsubscribed(device)),
                notification::PAIRED => Some(Event::DevicePaired(device)),
                other => {
                    debug!(status = other, "Unhandled device notification");
                    None
                }
            }
        })
    }));
}

unsafe extern "C" fn restorable_trampoline(
    device: AmRestorableDeviceRef,
    status: c_int,
    context: *mut c_void,
) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        deliver(context_id(context), |slot| {
            // SAFETY: the device reference comes from the native layer.
            let device = unsafe { RestorableDeviceHandle::from_raw(device) }?;
            let state = slot.calls.restorable_state(device);
            match status {
                notification::RESTORABLE_CONNECTED => {
                    Some(Event::RestorableConnected { device, state })
                }
                notification::RESTORABLE_DISCONNECTED => {
                    Some(Event::RestorableDisconnected { device, state })
                }
                other => {
                    debug!(status = other, "Unhandled restorable notification");
                    None
                }
            }
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDeviceCalls, MockRestorable};
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl EventObserver for Recorder {
        fn on_event(&self, event: &Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn dispatcher() -> (MockDeviceCalls, Arc<NotificationDispatcher>) {
        let mock = MockDeviceCalls::new();
        let dispatcher = Arc::new(NotificationDispatcher::new(Arc::new(mock.clone())));
        (mock, dispatcher)
    }

    #[test]
    fn test_device_events_are_translated() {
        let (mock, dispatcher) = dispatcher();
        let device = mock.add_device("udid-1");
        let recorder = Arc::new(Recorder::default());
        let id = dispatcher.subscribe(Category::Device, recorder.clone()).unwrap();
        assert_eq!(dispatcher.state(id), SubscriptionState::Active);

        mock.fire_device_event(device, notification::CONNECTED);
        mock.fire_device_event(device, notification::PAIRED);
        mock.fire_device_event(device, notification::DISCONNECTED);
        mock.fire_device_event(device, 99);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                Event::DeviceConnected(device),
                Event::DevicePaired(device),
                Event::DeviceDisconnected(device),
            ]
        );
    }

    #[test]
    fn test_restorable_events_carry_state() {
        let (mock, dispatcher) = dispatcher();
        let device = mock.add_restorable_device(MockRestorable {
            state: RestorableDeviceState::Dfu.to_raw(),
            ..Default::default()
        });
        let (id, events) = dispatcher.subscribe_channel(Category::Restorable).unwrap();
        mock.fire_restorable_event(device, notification::RESTORABLE_CONNECTED);
        assert_eq!(
            events.try_recv().unwrap(),
            Event::RestorableConnected {
                device,
                state: RestorableDeviceState::Dfu
            }
        );
        dispatcher.unsubscribe(id).unwrap();
        assert_eq!(mock.active_subscriptions(), 0);
    }

    #[test]
    fn test_late_callback_is_dropped() {
        let (mock, dispatcher) = dispatcher();
        let device = mock.add_device("udid-1");
        let recorder = Arc::new(Recorder::default());
        let id = dispatcher.subscribe(Category::Device, recorder.clone()).unwrap();
        dispatcher.unsubscribe(id).unwrap();
        assert_eq!(dispatcher.state(id), SubscriptionState::Unsubscribed);

        mock.fire_stale_device_event(device, notification::CONNECTED);
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_twice_is_an_error() {
        let (_mock, dispatcher) = dispatcher();
        let id = dispatcher.subscribe(Category::Device, Arc::new(NullObserver)).unwrap();
        dispatcher.unsubscribe(id).unwrap();
        assert!(matches!(
            dispatcher.unsubscribe(id),
            Err(BindingError::NotSubscribed(n)) if n == id.value()
        ));
    }

    #[test]
    fn test_failed_subscribe_is_terminal() {
        let (mock, dispatcher) = dispatcher();
        mock.fail_next("AMDeviceNotificationSubscribe", crate::error::codes::AMD_PERMISSION);
        let err = dispatcher
            .subscribe(Category::Device, Arc::new(NullObserver))
            .unwrap_err();
        assert!(err.status().is_some());
        assert!(dispatcher.active().is_empty());
        let BindingError::SubscribeFailed { id, .. } = err else {
            panic!("expected a failed subscription, got {err}");
        };
        assert_eq!(dispatcher.state(SubscriptionId(id)), SubscriptionState::Failed);
    }

    #[test]
    fn test_failed_subscribes_are_not_retained() {
        let (mock, dispatcher) = dispatcher();
        let mut ids = Vec::new();
        for _ in 0..100 {
            mock.fail_next("AMDeviceNotificationSubscribe", crate::error::codes::AMD_PERMISSION);
            match dispatcher.subscribe(Category::Device, Arc::new(NullObserver)) {
                Err(BindingError::SubscribeFailed { id, .. }) => ids.push(id),
                other => panic!("unexpected subscribe result: {other:?}"),
            }
        }

        assert!(dispatcher.subscriptions.lock_ignore_poison().is_empty());
        assert_eq!(dispatcher.failed.lock_ignore_poison().len(), FAILED_HISTORY);
        assert!(ids.iter().all(|id| !REGISTRY.lock_ignore_poison().contains_key(id)));
        assert_eq!(
            dispatcher.state(SubscriptionId(ids[99])),
            SubscriptionState::Failed
        );
        assert_eq!(
            dispatcher.state(SubscriptionId(ids[0])),
            SubscriptionState::Unsubscribed
        );
    }

    #[test]
    fn test_no_delivery_after_unsubscribe_returns() {
        struct Watch {
            unsubscribed: AtomicBool,
            late: AtomicUsize,
            seen: AtomicUsize,
        }
        impl EventObserver for Watch {
            fn on_event(&self, _event: &Event) {
                self.seen.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
                if self.unsubscribed.load(Ordering::SeqCst) {
                    self.late.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let (mock, dispatcher) = dispatcher();
        let device = mock.add_device("udid-1");
        let watch = Arc::new(Watch {
            unsubscribed: AtomicBool::new(false),
            late: AtomicUsize::new(0),
            seen: AtomicUsize::new(0),
        });
        let id = dispatcher.subscribe(Category::Device, watch.clone()).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let firers: Vec<_> = (0..4)
            .map(|_| {
                let mock = mock.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        mock.fire_stale_device_event(device, notification::CONNECTED);
                    }
                })
            })
            .collect();

        while watch.seen.load(Ordering::SeqCst) < 20 {
            thread::yield_now();
        }
        dispatcher.unsubscribe(id).unwrap();
        watch.unsubscribed.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::SeqCst);
        for firer in firers {
            firer.join().unwrap();
        }

        assert_eq!(watch.late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_from_inside_observer() {
        struct SelfRemoving {
            dispatcher: Arc<NotificationDispatcher>,
            id: OnceLock<SubscriptionId>,
            calls: AtomicUsize,
        }
        impl EventObserver for SelfRemoving {
            fn on_event(&self, _event: &Event) {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = self.id.get() {
                    self.dispatcher.unsubscribe(*id).unwrap();
                }
            }
        }

        let (mock, dispatcher) = dispatcher();
        let device = mock.add_device("udid-1");
        let observer = Arc::new(SelfRemoving {
            dispatcher: dispatcher.clone(),
            id: OnceLock::new(),
            calls: AtomicUsize::new(0),
        });
        let id = dispatcher.subscribe(Category::Device, observer.clone()).unwrap();
        observer.id.set(id).unwrap();

        mock.fire_device_event(device, notification::CONNECTED);
        mock.fire_stale_device_event(device, notification::CONNECTED);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.state(id), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn test_observer_panic_is_contained() {
        struct Panics;
        impl EventObserver for Panics {
            fn on_event(&self, _event: &Event) {
                panic!("observer failure");
            }
        }

        let (mock, dispatcher) = dispatcher();
        let device = mock.add_device("udid-1");
        let recorder = Arc::new(Recorder::default());
        dispatcher.subscribe(Category::Device, Arc::new(Panics)).unwrap();
        dispatcher.subscribe(Category::Device, recorder.clone()).unwrap();

        mock.fire_device_event(device, notification::CONNECTED);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_drop_unsubscribes_everything() {
        let (mock, dispatcher) = dispatcher();
        dispatcher.subscribe(Category::Device, Arc::new(NullObserver)).unwrap();
        dispatcher.subscribe(Category::Restorable, Arc::new(NullObserver)).unwrap();
        assert_eq!(mock.active_subscriptions(), 2);
        drop(dispatcher);
        assert_eq!(mock.active_subscriptions(), 0);
    }
}
