//! Generic tracer runtime
//!
//! [`TracerRuntime`] owns the backend, the hook attachments and the event
//! reader of one instrumentation session. Program-specific knowledge (hooks,
//! globals, record layout) comes from an [`EventDecoder`].

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{HookPoint, LinkId, ProbeBackend, ProgramSpec};
use super::event::{BootClock, CommonData, Enricher, EventKind};
use super::reader::{EventReader, ReadError, ReaderCloser, Record};
use super::{Gadget, TracerError, TracerState};
use crate::metrics;

/// Raw record did not match the program's layout
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record too short: {got} bytes, expected {expected}")]
    Short { got: usize, expected: usize },
}

/// An event type a decoder produces
pub trait TracerEvent: Serialize + Send + 'static {
    /// Build a payload-less status event around `common`
    fn from_status(common: CommonData) -> Self;

    fn common(&self) -> &CommonData;

    fn common_mut(&mut self) -> &mut CommonData;
}

/// Program-specific half of a runtime
pub trait EventDecoder: Send + Sync + 'static {
    type Event: TracerEvent;

    fn name(&self) -> &'static str;

    /// Object to load, with globals derived from the decoder's config
    fn program(&self) -> ProgramSpec;

    /// Hook points for the configured mode, in attach order
    fn hooks(&self) -> Vec<HookPoint>;

    fn decode(&self, raw: &[u8], clock: &BootClock) -> Result<Self::Event, DecodeError>;
}

/// Callback receiving every event of one runtime
pub type EventHandler<E> = Box<dyn FnMut(E) + Send>;

/// One instrumentation session on one node
pub struct TracerRuntime<D: EventDecoder> {
    decoder: Arc<D>,
    backend: Box<dyn ProbeBackend>,
    enricher: Option<Arc<dyn Enricher>>,
    handler: Option<EventHandler<D::Event>>,
    links: Vec<LinkId>,
    reader: Option<EventReader>,
    closer: Option<ReaderCloser>,
    consumer: Option<JoinHandle<()>>,
    state: TracerState,
}

impl<D: EventDecoder> TracerRuntime<D> {
    pub fn new(
        decoder: D,
        backend: Box<dyn ProbeBackend>,
        enricher: Option<Arc<dyn Enricher>>,
        handler: EventHandler<D::Event>,
    ) -> Self {
        Self {
            decoder: Arc::new(decoder),
            backend,
            enricher,
            handler: Some(handler),
            links: Vec::new(),
            reader: None,
            closer: None,
            consumer: None,
            state: TracerState::Uninstalled,
        }
    }

    /// Detach in reverse order, logging failures; used on every release path.
    fn release_links(&mut self, links: Vec<LinkId>) {
        for link in links.into_iter().rev() {
            if let Err(e) = self.backend.detach(link) {
                warn!(gadget = self.decoder.name(), error = %e, "failed to detach link");
            }
            metrics::ACTIVE_ATTACHMENTS.dec();
        }
    }

    fn rollback(&mut self, attached: Vec<LinkId>) {
        self.release_links(attached);
        self.backend.unload();
    }
}

impl<D: EventDecoder> Gadget for TracerRuntime<D> {
    fn name(&self) -> &'static str {
        self.decoder.name()
    }

    fn state(&self) -> TracerState {
        self.state
    }

    fn install(&mut self) -> Result<(), TracerError> {
        if self.state != TracerState::Uninstalled {
            return Err(TracerError::InvalidState {
                operation: "install",
                state: self.state,
            });
        }

        let spec = self.decoder.program();
        if let Err(e) = self.backend.load(&spec) {
            self.backend.unload();
            return Err(e);
        }

        let mut attached = Vec::new();
        for hook in self.decoder.hooks() {
            match self.backend.attach(&hook) {
                Ok(link) => {
                    debug!(gadget = self.decoder.name(), hook = %hook, "attached");
                    metrics::ACTIVE_ATTACHMENTS.inc();
                    attached.push(link);
                }
                Err(e) => {
                    warn!(gadget = self.decoder.name(), hook = %hook, error = %e,
                        "attach failed, rolling back {} attachment(s)", attached.len());
                    self.rollback(attached);
                    return Err(e);
                }
            }
        }

        match self.backend.open_reader(spec.events_map) {
            Ok((reader, closer)) => {
                self.reader = Some(reader);
                self.closer = Some(closer);
            }
            Err(e) => {
                self.rollback(attached);
                return Err(e);
            }
        }

        info!(gadget = self.decoder.name(), hooks = attached.len(), "tracer installed");
        self.links = attached;
        self.state = TracerState::Installed;
        Ok(())
    }

    fn run(&mut self) -> Result<(), TracerError> {
        if self.state != TracerState::Installed {
            return Err(TracerError::InvalidState {
                operation: "run",
                state: self.state,
            });
        }
        let (Some(reader), Some(handler)) = (self.reader.take(), self.handler.take()) else {
            return Err(TracerError::Reader("reader already consumed".into()));
        };

        let decoder = Arc::clone(&self.decoder);
        let enricher = self.enricher.clone();
        self.consumer = Some(tokio::spawn(consume(reader, decoder, enricher, handler)));
        self.state = TracerState::Running;
        Ok(())
    }

    fn close(&mut self) {
        if self.state == TracerState::Closed {
            return;
        }
        if let Some(closer) = self.closer.take() {
            closer.close();
        }
        self.reader = None;
        let links = std::mem::take(&mut self.links);
        self.release_links(links);
        self.backend.unload();
        debug!(gadget = self.decoder.name(), from = ?self.state, "tracer closed");
        self.state = TracerState::Closed;
    }

    fn closer(&self) -> Option<ReaderCloser> {
        self.closer.clone()
    }

    fn take_consumer(&mut self) -> Option<JoinHandle<()>> {
        self.consumer.take()
    }
}

impl<D: EventDecoder> Drop for TracerRuntime<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumption loop; the only reader of the channel.
async fn consume<D: EventDecoder>(
    mut reader: EventReader,
    decoder: Arc<D>,
    enricher: Option<Arc<dyn Enricher>>,
    mut handler: EventHandler<D::Event>,
) {
    let gadget = decoder.name();
    let clock = BootClock::now();
    let mut emit = |event: D::Event| {
        metrics::EVENTS_EMITTED
            .with_label_values(&[gadget, event.common().kind.as_str()])
            .inc();
        handler(event);
    };

    loop {
        let record = match reader.read().await {
            Ok(record) => record,
            Err(ReadError::Closed) => {
                debug!(gadget, "event reader closed, stopping");
                return;
            }
            Err(e) => {
                metrics::READ_ERRORS.with_label_values(&[gadget]).inc();
                let message = format!("Error reading perf ring buffer: {}", e);
                emit(D::Event::from_status(CommonData::status(EventKind::Error, message)));
                return;
            }
        };

        match record {
            Record::Lost(count) => {
                metrics::LOST_SAMPLES.with_label_values(&[gadget]).inc_by(count as f64);
                let message = format!("lost {} samples", count);
                emit(D::Event::from_status(CommonData::status(EventKind::Warning, message)));
            }
            Record::Sample(raw) => match decoder.decode(&raw, &clock) {
                Ok(mut event) => {
                    if let Some(enricher) = &enricher {
                        let common = event.common_mut();
                        let mount_ns_id = common.mount_ns_id;
                        enricher.enrich_by_mnt_ns(&mut common.k8s, mount_ns_id);
                    }
                    emit(event);
                }
                Err(e) => {
                    let message = format!("dropping malformed record: {}", e);
                    emit(D::Event::from_status(CommonData::status(EventKind::Warning, message)));
                }
            },
        }
    }
}
