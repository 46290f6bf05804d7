//! Program name → constructor
//!
//! Constructors adapt a program's typed events into JSON lines for the
//! registry's callers, which only know programs by name.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use super::backend::ProbeBackend;
use super::event::Enricher;
use super::gadgets::{
    CapabilitiesConfig, CapabilitiesDecoder, TcpConnectConfig, TcpConnectDecoder,
};
use super::runtime::{EventHandler, TracerRuntime};
use super::{Gadget, TracerError};

/// Receives each event as one JSON line
pub type LineHandler = Box<dyn FnMut(String) + Send>;

/// Generic knobs understood by the built-in programs
#[derive(Debug, Clone, Default)]
pub struct GadgetParams {
    pub calculate_latency: bool,
    pub min_latency: Duration,
    pub audit_only: bool,
    pub mount_ns_filter: Option<Vec<u64>>,
}

impl GadgetParams {
    /// Parse `key=value` pairs as carried by a trace's parameters.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, TracerError> {
        let mut params = Self::default();
        for (key, value) in pairs {
            match key {
                "latency" => params.calculate_latency = parse_bool(key, value)?,
                "min-latency-ms" => {
                    let ms = value.parse::<u64>().map_err(|_| {
                        TracerError::InvalidParameter(format!("{}={}", key, value))
                    })?;
                    params.min_latency = Duration::from_millis(ms);
                }
                "audit-only" => params.audit_only = parse_bool(key, value)?,
                other => {
                    return Err(TracerError::InvalidParameter(format!(
                        "unknown parameter {:?}",
                        other
                    )))
                }
            }
        }
        Ok(params)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, TracerError> {
    value
        .parse()
        .map_err(|_| TracerError::InvalidParameter(format!("{}={}", key, value)))
}

/// Everything a constructor needs
pub struct GadgetContext {
    pub params: GadgetParams,
    pub backend: Box<dyn ProbeBackend>,
    pub enricher: Option<Arc<dyn Enricher>>,
    pub output: LineHandler,
}

type Constructor = fn(GadgetContext) -> Box<dyn Gadget>;

struct GadgetDesc {
    description: &'static str,
    constructor: Constructor,
}

/// Registry of instrumentation programs
#[derive(Default)]
pub struct GadgetRegistry {
    gadgets: BTreeMap<&'static str, GadgetDesc>,
}

impl GadgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every program shipped with this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "tcpconnect",
            "Trace outgoing TCP connections",
            new_tcpconnect,
        );
        registry.register(
            "capabilities",
            "Trace security capability checks",
            new_capabilities,
        );
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        constructor: Constructor,
    ) {
        self.gadgets.insert(
            name,
            GadgetDesc {
                description,
                constructor,
            },
        );
    }

    /// `(name, description)` pairs in name order
    pub fn list(&self) -> Vec<(&'static str, &'static str)> {
        self.gadgets
            .iter()
            .map(|(name, desc)| (*name, desc.description))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gadgets.contains_key(name)
    }

    pub fn instantiate(
        &self,
        name: &str,
        ctx: GadgetContext,
    ) -> Result<Box<dyn Gadget>, TracerError> {
        let desc = self
            .gadgets
            .get(name)
            .ok_or_else(|| TracerError::UnknownGadget(name.to_string()))?;
        Ok((desc.constructor)(ctx))
    }
}

/// Serialize typed events into the line handler.
fn json_lines<E: Serialize>(mut output: LineHandler) -> EventHandler<E> {
    Box::new(move |event: E| match serde_json::to_string(&event) {
        Ok(line) => output(line),
        Err(e) => warn!(error = %e, "failed to serialize event"),
    })
}

fn new_tcpconnect(ctx: GadgetContext) -> Box<dyn Gadget> {
    let decoder = TcpConnectDecoder::new(TcpConnectConfig {
        calculate_latency: ctx.params.calculate_latency,
        min_latency: ctx.params.min_latency,
        mount_ns_filter: ctx.params.mount_ns_filter,
    });
    Box::new(TracerRuntime::new(
        decoder,
        ctx.backend,
        ctx.enricher,
        json_lines(ctx.output),
    ))
}

fn new_capabilities(ctx: GadgetContext) -> Box<dyn Gadget> {
    let decoder = CapabilitiesDecoder::new(CapabilitiesConfig {
        audit_only: ctx.params.audit_only,
        mount_ns_filter: ctx.params.mount_ns_filter,
    });
    Box::new(TracerRuntime::new(
        decoder,
        ctx.backend,
        ctx.enricher,
        json_lines(ctx.output),
    ))
}
