//! Kernel backend built on aya
//!
//! Loads `<object>.o` from the configured BPF directory, attaches programs by
//! name and keeps every link owned so that dropping it detaches the hook.
//! One pump task per online CPU moves perf buffer records into the reader.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use aya::maps::{AsyncPerfEventArray, HashMap as BpfHashMap};
use aya::programs::kprobe::KProbeLink;
use aya::programs::trace_point::TracePointLink;
use aya::programs::{KProbe, ProgramError, TracePoint};
use aya::util::online_cpus;
use aya::{Bpf, BpfLoader};
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::backend::{GlobalValue, HookPoint, LinkId, ProbeBackend, ProgramSpec, MOUNT_NS_FILTER_MAP};
use super::reader::{self, EventReader, ReadError, ReaderCloser, Record};
use super::TracerError;
use crate::config::NodeConfig;

/// Records buffered between the pumps and the consumption task
const READER_CAPACITY: usize = 4096;

/// Perf records fetched per pump iteration
const BATCH: usize = 16;

enum OwnedLink {
    KProbe(KProbeLink),
    TracePoint(TracePointLink),
}

pub struct AyaBackend {
    object_dir: PathBuf,
    perf_pages: usize,
    bpf: Option<Bpf>,
    loaded: HashSet<&'static str>,
    links: HashMap<LinkId, OwnedLink>,
    next_link: u64,
    pumps: Vec<JoinHandle<()>>,
}

fn attach_error(hook: &HookPoint, e: impl std::fmt::Display) -> TracerError {
    TracerError::Attach {
        hook: hook.to_string(),
        reason: e.to_string(),
    }
}

impl AyaBackend {
    pub fn new(config: &NodeConfig) -> Result<Self, TracerError> {
        if !config.bpf_object_dir.is_dir() {
            return Err(TracerError::Load(format!(
                "BPF object directory {} does not exist",
                config.bpf_object_dir.display()
            )));
        }
        Ok(Self {
            object_dir: config.bpf_object_dir.clone(),
            perf_pages: config.perf_buffer_pages,
            bpf: None,
            loaded: HashSet::new(),
            links: HashMap::new(),
            next_link: 0,
            pumps: Vec::new(),
        })
    }

    fn bpf_mut(&mut self) -> Result<&mut Bpf, TracerError> {
        self.bpf
            .as_mut()
            .ok_or_else(|| TracerError::Load("no program object loaded".into()))
    }

    fn attach_kprobe(&mut self, hook: &HookPoint, program: &'static str, function: &str) -> Result<OwnedLink, TracerError> {
        let first_use = !self.loaded.contains(program);
        let bpf = self.bpf_mut()?;
        let probe: &mut KProbe = bpf
            .program_mut(program)
            .ok_or_else(|| attach_error(hook, format!("program {} not found", program)))?
            .try_into()
            .map_err(|e: ProgramError| attach_error(hook, e))?;
        if first_use {
            probe.load().map_err(|e| attach_error(hook, e))?;
        }
        let id = probe.attach(function, 0).map_err(|e| attach_error(hook, e))?;
        let link = probe.take_link(id).map_err(|e| attach_error(hook, e))?;
        self.loaded.insert(program);
        Ok(OwnedLink::KProbe(link))
    }

    fn attach_tracepoint(
        &mut self,
        hook: &HookPoint,
        program: &'static str,
        category: &str,
        name: &str,
    ) -> Result<OwnedLink, TracerError> {
        let first_use = !self.loaded.contains(program);
        let bpf = self.bpf_mut()?;
        let tp: &mut TracePoint = bpf
            .program_mut(program)
            .ok_or_else(|| attach_error(hook, format!("program {} not found", program)))?
            .try_into()
            .map_err(|e: ProgramError| attach_error(hook, e))?;
        if first_use {
            tp.load().map_err(|e| attach_error(hook, e))?;
        }
        let id = tp.attach(category, name).map_err(|e| attach_error(hook, e))?;
        let link = tp.take_link(id).map_err(|e| attach_error(hook, e))?;
        self.loaded.insert(program);
        Ok(OwnedLink::TracePoint(link))
    }
}

impl ProbeBackend for AyaBackend {
    fn load(&mut self, spec: &ProgramSpec) -> Result<(), TracerError> {
        if self.bpf.is_some() {
            return Err(TracerError::Load("program object already loaded".into()));
        }
        let path = self.object_dir.join(format!("{}.o", spec.object));

        // Globals borrow their values for the whole loader lifetime
        let values: Vec<(&str, u64, bool)> = spec
            .globals
            .iter()
            .map(|(name, value)| match value {
                GlobalValue::Bool(b) => (*name, *b as u64, true),
                GlobalValue::U64(v) => (*name, *v, false),
            })
            .collect();
        let bytes: Vec<u8> = values.iter().map(|(_, v, _)| *v as u8).collect();

        let mut loader = BpfLoader::new();
        for (i, (name, value, is_bool)) in values.iter().enumerate() {
            if *is_bool {
                loader.set_global(name, &bytes[i], false);
            } else {
                loader.set_global(name, value, false);
            }
        }
        let mut bpf = loader
            .load_file(&path)
            .map_err(|e| TracerError::Load(format!("{}: {}", path.display(), e)))?;

        if let Some(ids) = &spec.mount_ns_filter {
            let mut filter: BpfHashMap<_, u64, u8> = BpfHashMap::try_from(
                bpf.map_mut(MOUNT_NS_FILTER_MAP)
                    .ok_or_else(|| TracerError::Map(format!("{} map not found", MOUNT_NS_FILTER_MAP)))?,
            )
            .map_err(|e| TracerError::Map(e.to_string()))?;
            for id in ids {
                filter
                    .insert(id, 1u8, 0)
                    .map_err(|e| TracerError::Map(e.to_string()))?;
            }
        }

        debug!(object = %path.display(), "program object loaded");
        self.bpf = Some(bpf);
        Ok(())
    }

    fn attach(&mut self, hook: &HookPoint) -> Result<LinkId, TracerError> {
        let link = match *hook {
            HookPoint::KProbe { program, function } | HookPoint::KRetProbe { program, function } => {
                self.attach_kprobe(hook, program, function)?
            }
            HookPoint::TracePoint {
                program,
                category,
                name,
            } => self.attach_tracepoint(hook, program, category, name)?,
        };
        let id = LinkId(self.next_link);
        self.next_link += 1;
        self.links.insert(id, link);
        Ok(id)
    }

    fn detach(&mut self, link: LinkId) -> Result<(), TracerError> {
        // Owned links detach on drop
        match self.links.remove(&link) {
            Some(OwnedLink::KProbe(l)) => drop(l),
            Some(OwnedLink::TracePoint(l)) => drop(l),
            None => {
                return Err(TracerError::Attach {
                    hook: format!("{:?}", link),
                    reason: "unknown link".into(),
                })
            }
        }
        Ok(())
    }

    fn open_reader(&mut self, map: &str) -> Result<(EventReader, ReaderCloser), TracerError> {
        let pages = self.perf_pages;
        let bpf = self.bpf_mut()?;
        let mut perf_array = AsyncPerfEventArray::try_from(
            bpf.take_map(map)
                .ok_or_else(|| TracerError::Reader(format!("{} map not found", map)))?,
        )
        .map_err(|e| TracerError::Reader(e.to_string()))?;

        let cpus = online_cpus().map_err(|e| TracerError::Reader(format!("online cpus: {}", e)))?;
        let (tx, reader, closer) = reader::channel(READER_CAPACITY);

        for cpu in cpus {
            let mut buf = perf_array
                .open(cpu, Some(pages))
                .map_err(|e| TracerError::Reader(format!("perf buffer on cpu {}: {}", cpu, e)))?;
            let tx = tx.clone();

            self.pumps.push(tokio::spawn(async move {
                let mut buffers = (0..BATCH)
                    .map(|_| BytesMut::with_capacity(256))
                    .collect::<Vec<_>>();

                loop {
                    for b in buffers.iter_mut() {
                        b.clear();
                    }
                    let events = tokio::select! {
                        _ = tx.closed() => return,
                        res = buf.read_events(&mut buffers) => res,
                    };
                    let events = match events {
                        Ok(events) => events,
                        Err(e) => {
                            let _ = tx.send(Err(ReadError::Io(e.to_string()))).await;
                            return;
                        }
                    };
                    if events.lost > 0 && tx.send(Ok(Record::Lost(events.lost as u64))).await.is_err() {
                        return;
                    }
                    for b in buffers.iter().take(events.read) {
                        if tx.send(Ok(Record::Sample(b.to_vec()))).await.is_err() {
                            return;
                        }
                    }
                }
            }));
        }

        Ok((reader, closer))
    }

    fn unload(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        if !self.links.is_empty() {
            warn!(links = self.links.len(), "unloading with links still attached");
        }
        self.links.clear();
        self.loaded.clear();
        self.bpf = None;
    }
}

impl Drop for AyaBackend {
    fn drop(&mut self) {
        self.unload();
    }
}
