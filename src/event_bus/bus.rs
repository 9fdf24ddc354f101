use std::sync::{Arc, Mutex};
use tokio::{sync::oneshot, task};

use super::event::Event;
use super::sink::{EventSink, StdOutSink};

/// Receives events from pipeline components and broadcasts them to sinks.
///
/// Producers hold a cheap [`flume::Sender`] obtained from
/// [`get_sender`](Self::get_sender) and never wait on sink I/O; a background
/// listener task drains the channel and fans out to every registered sink.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    event_channel: (flume::Sender<Event>, flume::Receiver<Event>),
    listener: Arc<Mutex<Option<ListenerState>>>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    /// Bus with a single sink.
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    /// Bus with multiple sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            event_channel: flume::unbounded(),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// Dynamically add a sink (e.g. a per-request stream).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.sinks.lock().unwrap().push(Box::new(sink));
    }

    /// Sender handle for producers.
    pub fn get_sender(&self) -> flume::Sender<Event> {
        self.event_channel.0.clone()
    }

    /// Spawn the background listener that fans events out to sinks.
    /// Idempotent: calling again has no effect.
    pub fn listen_for_events(&self) {
        let mut guard = self.listener.lock().expect("listener poisoned");
        if guard.is_some() {
            return;
        }

        let receiver = self.event_channel.1.clone();
        let sinks = self.sinks.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break, // all senders dropped
                        Ok(event) => {
                            let mut sinks_guard = sinks.lock().unwrap();
                            for sink in sinks_guard.iter_mut() {
                                if let Err(e) = sink.handle(&event) {
                                    tracing::warn!(error = %e, "event sink failed");
                                }
                            }
                        }
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the background listener, waiting for it to drain.
    pub async fn stop_listener(&self) {
        let state = {
            let mut guard = self.listener.lock().expect("listener poisoned");
            guard.take()
        };
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Abort rather than signal: Drop cannot await the listener task.
        if let Ok(mut guard) = self.listener.lock()
            && let Some(state) = guard.take()
        {
            state.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::MemorySink;

    #[tokio::test]
    async fn events_reach_registered_sinks() {
        let sink = MemorySink::new();
        let bus = EventBus::with_sink(sink.clone());
        bus.listen_for_events();

        let tx = bus.get_sender();
        tx.send(Event::diagnostic("test", "first")).unwrap();
        tx.send(Event::diagnostic("test", "second")).unwrap();
        drop(tx);

        tokio::task::yield_now().await;
        bus.stop_listener().await;

        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].scope_label(), "test");
    }

    #[tokio::test]
    async fn listener_start_is_idempotent() {
        let bus = EventBus::with_sink(MemorySink::new());
        bus.listen_for_events();
        bus.listen_for_events();
        bus.stop_listener().await;
    }
}
