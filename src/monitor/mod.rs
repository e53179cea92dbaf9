//! Asynchronous device monitor.
//!
//! [`DeviceMonitor`] follows an external object registry (a PipeWire-style
//! audio server) that reports devices and audio nodes from its own event
//! thread. Devices are stored as soon as they appear. Nodes are only
//! published once their audio format has been negotiated through a
//! [`FormatRequester`]. Bursts of registry activity are coalesced by a
//! [`Debouncer`](debounce::Debouncer) into a single recomputation, which
//! publishes a sorted snapshot and notifies subscribers only when the list
//! actually changed.
//!
//! Three independent locks guard the monitor:
//! - the object table: id/serial maps, stored devices and removal observers;
//! - the pending accumulator: unresolved nodes, removals and default changes;
//! - the published state: resolved nodes and the snapshot lists.
//!
//! The published lock briefly takes the object table lock to drop nodes
//! removed during a pass. No other pair is ever held at the same time, and
//! none is held while calling into the requester or an observer.

pub mod debounce;
pub mod node_format;
pub mod pending;

pub use node_format::{Iec958Codec, NodeAudioFormat, NodeFormatPayload, PropValue};
pub use pending::{FormatFuture, FormatPromise, FormatRequester, format_channel};

use crate::config::MonitorDesc;
use crate::device::{AudioDevice, AudioDevices, DeviceEnumerator, DeviceMode, FormatCapabilities};
use crate::error::Result;
use crate::events::{EventHub, SonicPortEvent};
use crate::format::SampleFormat;
use crossbeam_channel::Receiver;
use debounce::{DebounceHandle, Debouncer};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// Registry object id. Ids are reused by the registry after removal.
pub type ObjectId = u32;

/// Reuse-proof identity of a registry object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectSerial(pub u64);

impl fmt::Display for ObjectSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Property keys read from registry objects.
pub mod keys {
    pub const NODE_NAME: &str = "node.name";
    pub const NODE_DESCRIPTION: &str = "node.description";
    pub const DEVICE_ID: &str = "device.id";
    pub const DEVICE_SYSFS_PATH: &str = "device.sysfs.path";
}

/// Name of the server's placeholder sink.
const DUMMY_NODE_NAME: &str = "auto_null";

pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Device,
    Sink,
    Source,
}

impl MediaClass {
    pub fn parse(media_class: &str) -> Option<Self> {
        match media_class {
            "Audio/Device" => Some(Self::Device),
            "Audio/Sink" | "Audio/Sink/Virtual" => Some(Self::Sink),
            "Audio/Source" | "Audio/Source/Virtual" => Some(Self::Source),
            _ => None,
        }
    }

    fn mode(self) -> Option<DeviceMode> {
        match self {
            Self::Device => None,
            Self::Sink => Some(DeviceMode::Output),
            Self::Source => Some(DeviceMode::Input),
        }
    }
}

/// A message captured on the registry thread.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    ObjectAdded {
        id: ObjectId,
        serial: ObjectSerial,
        media_class: String,
        props: Properties,
    },
    ObjectRemoved {
        id: ObjectId,
    },
    DefaultSinkChanged(Option<String>),
    DefaultSourceChanged(Option<String>),
}

/// Notified once when a tracked object disappears.
pub trait RemovalObserver: Send + Sync {
    fn object_removed(&self, serial: ObjectSerial);
}

impl<F: Fn(ObjectSerial) + Send + Sync> RemovalObserver for F {
    fn object_removed(&self, serial: ObjectSerial) {
        self(serial)
    }
}

/// Published input and output snapshots.
#[derive(Debug, Clone)]
pub struct DeviceLists {
    pub sources: Arc<[AudioDevice]>,
    pub sinks: Arc<[AudioDevice]>,
}

#[derive(Default)]
struct ObjectTable {
    id_to_serial: HashMap<ObjectId, ObjectSerial>,
    serial_to_id: HashMap<ObjectSerial, ObjectId>,
    devices: HashMap<ObjectSerial, Properties>,
    observers: HashMap<ObjectSerial, Vec<Arc<dyn RemovalObserver>>>,
}

struct PendingNode {
    serial: ObjectSerial,
    device_serial: Option<ObjectSerial>,
    mode: DeviceMode,
    name: String,
    description: String,
    format: FormatFuture,
}

#[derive(Default)]
struct PendingState {
    nodes: Vec<PendingNode>,
    removals: Vec<ObjectSerial>,
    default_sink: Option<Option<String>>,
    default_source: Option<Option<String>>,
}

struct ResolvedNode {
    device_serial: Option<ObjectSerial>,
    mode: DeviceMode,
    name: String,
    description: String,
    format: NodeAudioFormat,
}

struct PublishedState {
    nodes: BTreeMap<ObjectSerial, ResolvedNode>,
    default_sink: Option<String>,
    default_source: Option<String>,
    sinks: Arc<[AudioDevice]>,
    sources: Arc<[AudioDevice]>,
}

impl Default for PublishedState {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            default_sink: None,
            default_source: None,
            sinks: Arc::from(Vec::new()),
            sources: Arc::from(Vec::new()),
        }
    }
}

struct MonitorInner {
    requester: Arc<dyn FormatRequester>,
    desc: MonitorDesc,
    objects: Mutex<ObjectTable>,
    pending: Mutex<PendingState>,
    published: Mutex<PublishedState>,
    events: EventHub,
    publish_cycles: AtomicU64,
}

/// Follows an external registry and publishes audio device lists.
pub struct DeviceMonitor {
    // Dropped first so the worker is joined before the state goes away.
    debouncer: Debouncer,
    kick: DebounceHandle,
    inner: Arc<MonitorInner>,
}

impl DeviceMonitor {
    /// Creates a monitor that resolves node formats through `requester`.
    ///
    /// # Errors
    ///
    /// Returns an error if the debounce worker thread cannot be spawned.
    pub fn new(requester: Arc<dyn FormatRequester>, desc: MonitorDesc) -> Result<Self> {
        let inner = Arc::new(MonitorInner {
            requester,
            desc: desc.clone(),
            objects: Mutex::new(ObjectTable::default()),
            pending: Mutex::new(PendingState::default()),
            published: Mutex::new(PublishedState::default()),
            events: EventHub::new(),
            publish_cycles: AtomicU64::new(0),
        });

        let weak: Weak<MonitorInner> = Arc::downgrade(&inner);
        let debouncer = Debouncer::spawn("sonicport-monitor", desc.compression_delay, move || {
            if let Some(inner) = weak.upgrade() {
                inner.recompute();
            }
        })?;
        let kick = debouncer.handle();

        log::info!(
            "Device monitor started (compression delay {:?})",
            desc.compression_delay
        );
        Ok(Self {
            debouncer,
            kick,
            inner,
        })
    }

    /// Applies one registry event. Callable from any thread.
    pub fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::ObjectAdded {
                id,
                serial,
                media_class,
                props,
            } => self.object_added(id, serial, &media_class, props),
            RegistryEvent::ObjectRemoved { id } => self.object_removed(id),
            RegistryEvent::DefaultSinkChanged(name) => {
                log::debug!("Default sink changed to {:?}", name);
                self.inner.pending.lock().default_sink = Some(name);
                self.debouncer.kick();
            }
            RegistryEvent::DefaultSourceChanged(name) => {
                log::debug!("Default source changed to {:?}", name);
                self.inner.pending.lock().default_source = Some(name);
                self.debouncer.kick();
            }
        }
    }

    fn object_added(
        &self,
        id: ObjectId,
        serial: ObjectSerial,
        media_class: &str,
        props: Properties,
    ) {
        let Some(class) = MediaClass::parse(media_class) else {
            return;
        };

        let Some(mode) = class.mode() else {
            log::debug!("Device {} added with id {}", serial, id);
            let mut objects = self.inner.objects.lock();
            objects.track(id, serial);
            objects.devices.insert(serial, props);
            return;
        };

        let Some(name) = props.get(keys::NODE_NAME).cloned() else {
            log::debug!("Ignoring unnamed node {}", id);
            return;
        };
        if name == DUMMY_NODE_NAME {
            return;
        }

        let device_serial = {
            let mut objects = self.inner.objects.lock();
            let device_serial = match props.get(keys::DEVICE_ID) {
                Some(device_id) => match device_id
                    .parse::<ObjectId>()
                    .ok()
                    .and_then(|device_id| objects.id_to_serial.get(&device_id).copied())
                {
                    Some(device_serial) => Some(device_serial),
                    None => {
                        log::debug!("Ignoring node {} of untracked device {}", name, device_id);
                        return;
                    }
                },
                None => None,
            };
            objects.track(id, serial);
            device_serial
        };

        let description = props
            .get(keys::NODE_DESCRIPTION)
            .cloned()
            .unwrap_or_else(|| name.clone());

        log::debug!("{} node {} ({}) added, resolving format", mode, name, serial);

        let kick = self.kick.clone();
        let (promise, future) = format_channel(move || kick.kick());
        self.inner.pending.lock().nodes.push(PendingNode {
            serial,
            device_serial,
            mode,
            name,
            description,
            format: future,
        });
        self.inner.requester.enumerate_formats(id, promise);
    }

    fn object_removed(&self, id: ObjectId) {
        let (serial, observers) = {
            let mut objects = self.inner.objects.lock();
            let Some(serial) = objects.id_to_serial.remove(&id) else {
                return;
            };
            objects.serial_to_id.remove(&serial);
            objects.devices.remove(&serial);
            (serial, objects.observers.remove(&serial).unwrap_or_default())
        };

        log::debug!("Object {} ({}) removed", id, serial);

        {
            let mut pending = self.inner.pending.lock();
            pending
                .nodes
                .retain(|node| node.serial != serial && node.device_serial != Some(serial));
            pending.removals.push(serial);
        }

        for observer in observers {
            observer.object_removed(serial);
        }
        self.debouncer.kick();
    }

    /// Cached source list. Never blocks on format resolution.
    pub fn audio_sources(&self) -> Arc<[AudioDevice]> {
        self.inner.published.lock().sources.clone()
    }

    /// Cached sink list. Never blocks on format resolution.
    pub fn audio_sinks(&self) -> Arc<[AudioDevice]> {
        self.inner.published.lock().sinks.clone()
    }

    /// Waits for every outstanding format request, then republishes.
    ///
    /// This blocks the calling thread while pumping the requester's `sync()`.
    /// It must not be called from an audio callback or from the registry's
    /// own event thread, where it would never make progress.
    pub fn device_lists(&self) -> DeviceLists {
        loop {
            let all_finished = self
                .inner
                .pending
                .lock()
                .nodes
                .iter()
                .all(|node| node.format.is_finished());
            if all_finished {
                break;
            }
            self.inner.requester.sync();
            thread::sleep(self.inner.desc.sync_poll_interval);
        }

        self.inner.recompute();

        let published = self.inner.published.lock();
        DeviceLists {
            sources: published.sources.clone(),
            sinks: published.sinks.clone(),
        }
    }

    /// Registers `observer` for the removal of `serial`.
    ///
    /// Returns `false` if the object is already gone, in which case the
    /// observer will never be called.
    pub fn register_observer(&self, serial: ObjectSerial, observer: Arc<dyn RemovalObserver>) -> bool {
        let mut objects = self.inner.objects.lock();
        if !objects.serial_to_id.contains_key(&serial) {
            return false;
        }
        objects.observers.entry(serial).or_default().push(observer);
        true
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn RemovalObserver>) {
        let target = Arc::as_ptr(observer) as *const ();
        let mut objects = self.inner.objects.lock();
        for observers in objects.observers.values_mut() {
            observers.retain(|o| Arc::as_ptr(o) as *const () != target);
        }
        objects.observers.retain(|_, observers| !observers.is_empty());
    }

    pub fn find_object_serial(&self, id: ObjectId) -> Option<ObjectSerial> {
        self.inner.objects.lock().id_to_serial.get(&id).copied()
    }

    pub fn find_object_id(&self, serial: ObjectSerial) -> Option<ObjectId> {
        self.inner.objects.lock().serial_to_id.get(&serial).copied()
    }

    /// Number of recomputation passes run so far.
    pub fn publish_cycles(&self) -> u64 {
        self.inner.publish_cycles.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> Receiver<SonicPortEvent> {
        self.inner.events.subscribe()
    }

    /// A device registry over this monitor's snapshots. Every list or
    /// default change the monitor publishes invalidates the registry cache
    /// and is relayed to the registry's subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay thread cannot be spawned.
    pub fn device_registry(self: &Arc<Self>) -> Result<Arc<AudioDevices>> {
        let registry = Arc::new(AudioDevices::new(self.clone()));
        registry.follow(self.subscribe())?;
        Ok(registry)
    }
}

impl DeviceEnumerator for DeviceMonitor {
    fn enumerate(&self, mode: DeviceMode) -> Result<Vec<AudioDevice>> {
        let devices = match mode {
            DeviceMode::Input => self.audio_sources(),
            DeviceMode::Output => self.audio_sinks(),
        };
        Ok(devices.to_vec())
    }
}

impl ObjectTable {
    fn track(&mut self, id: ObjectId, serial: ObjectSerial) {
        if let Some(stale) = self.id_to_serial.insert(id, serial) {
            if stale != serial {
                log::warn!("Object id {} reused by {} before {} was removed", id, serial, stale);
                self.serial_to_id.remove(&stale);
            }
        }
        self.serial_to_id.insert(serial, id);
    }
}

/// Everything one recomputation pass takes out of the pending accumulator.
struct PendingBatch {
    resolved: Vec<(ObjectSerial, ResolvedNode)>,
    removals: Vec<ObjectSerial>,
    default_sink: Option<Option<String>>,
    default_source: Option<Option<String>>,
}

impl MonitorInner {
    fn recompute(&self) {
        let batch = self.drain_pending();
        self.publish(batch);
    }

    fn drain_pending(&self) -> PendingBatch {
        let (finished, removals, default_sink, default_source) = {
            let mut pending = self.pending.lock();
            let (finished, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut pending.nodes)
                .into_iter()
                .partition(|node| node.format.is_finished());
            pending.nodes = waiting;
            (
                finished,
                std::mem::take(&mut pending.removals),
                pending.default_sink.take(),
                pending.default_source.take(),
            )
        };

        let resolved = finished
            .into_iter()
            .filter_map(|node| match node.format.resolve() {
                Some(format) => {
                    log::debug!("Node {} resolved to {:?}", node.name, format);
                    Some((
                        node.serial,
                        ResolvedNode {
                            device_serial: node.device_serial,
                            mode: node.mode,
                            name: node.name,
                            description: node.description,
                            format,
                        },
                    ))
                }
                None => {
                    log::debug!("Node {} has no usable format", node.name);
                    None
                }
            })
            .collect();

        PendingBatch {
            resolved,
            removals,
            default_sink,
            default_source,
        }
    }

    fn publish(&self, batch: PendingBatch) {
        let PendingBatch {
            resolved,
            removals,
            default_sink,
            default_source,
        } = batch;

        let (sinks_changed, sources_changed, default_sink_changed, default_source_changed) = {
            let mut published = self.published.lock();
            for serial in &removals {
                published.nodes.remove(serial);
            }
            {
                // A removal may have landed after the batch was drained.
                let objects = self.objects.lock();
                published.nodes.extend(resolved.into_iter().filter(|(serial, node)| {
                    let live = objects.serial_to_id.contains_key(serial);
                    if !live {
                        log::debug!("Dropping node {} removed while resolving", node.name);
                    }
                    live
                }));
            }

            let default_sink_changed = match default_sink {
                Some(name) if name != published.default_sink => {
                    published.default_sink = name;
                    true
                }
                _ => false,
            };
            let default_source_changed = match default_source {
                Some(name) if name != published.default_source => {
                    published.default_source = name;
                    true
                }
                _ => false,
            };

            let parents: HashSet<ObjectSerial> = published
                .nodes
                .values()
                .filter_map(|node| node.device_serial)
                .collect();
            drop(published);
            let sysfs_paths = self.sysfs_paths(&parents);
            let mut published = self.published.lock();

            let sinks = published.build_list(DeviceMode::Output, &sysfs_paths);
            let sources = published.build_list(DeviceMode::Input, &sysfs_paths);
            let sinks_changed = !same_devices(&published.sinks, &sinks);
            let sources_changed = !same_devices(&published.sources, &sources);
            published.sinks = sinks.into();
            published.sources = sources.into();
            (
                sinks_changed,
                sources_changed,
                default_sink_changed,
                default_source_changed,
            )
        };

        let cycle = self.publish_cycles.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("Publish cycle {} complete", cycle);

        if sinks_changed {
            log::info!("Audio sinks changed");
            self.events.emit(SonicPortEvent::AudioOutputsChanged);
        }
        if sources_changed {
            log::info!("Audio sources changed");
            self.events.emit(SonicPortEvent::AudioInputsChanged);
        }
        if default_sink_changed {
            self.events.emit(SonicPortEvent::DefaultOutputChanged);
        }
        if default_source_changed {
            self.events.emit(SonicPortEvent::DefaultInputChanged);
        }
    }

    fn sysfs_paths(&self, devices: &HashSet<ObjectSerial>) -> HashMap<ObjectSerial, String> {
        let objects = self.objects.lock();
        devices
            .iter()
            .filter_map(|serial| {
                let path = objects.devices.get(serial)?.get(keys::DEVICE_SYSFS_PATH)?;
                Some((*serial, path.clone()))
            })
            .collect()
    }
}

impl PublishedState {
    fn build_list(
        &self,
        mode: DeviceMode,
        sysfs_paths: &HashMap<ObjectSerial, String>,
    ) -> Vec<AudioDevice> {
        let default_name = match mode {
            DeviceMode::Output => self.default_sink.as_deref(),
            DeviceMode::Input => self.default_source.as_deref(),
        };

        let mut devices: Vec<AudioDevice> = self
            .nodes
            .values()
            .filter(|node| node.mode == mode)
            .map(|node| {
                let sysfs_path = node
                    .device_serial
                    .and_then(|serial| sysfs_paths.get(&serial).cloned());
                node_device(node, default_name == Some(node.name.as_str()), sysfs_path)
            })
            .collect();
        devices.sort_by(|a, b| a.description().cmp(b.description()));
        devices
    }
}

/// Capabilities published for a node: every sample format, up to the
/// negotiated channel count, over the common rate range.
fn node_device(node: &ResolvedNode, is_default: bool, sysfs_path: Option<String>) -> AudioDevice {
    const MIN_RATE: u32 = 8000;
    const MAX_RATE: u32 = 192000;

    let format = node.format.to_audio_format();
    let capabilities = FormatCapabilities {
        supported_formats: SampleFormat::ALL.to_vec(),
        min_channels: 1,
        max_channels: format.channel_count(),
        min_sample_rate: MIN_RATE.min(format.sample_rate()),
        max_sample_rate: MAX_RATE.max(format.sample_rate()),
        channel_config: format.channel_config(),
    };

    AudioDevice::new(node.name.clone(), node.description.clone(), node.mode)
        .with_capabilities(capabilities)
        .with_preferred_format(format)
        .with_default(is_default)
        .with_sysfs_path(sysfs_path)
}

/// Lists match when ids and default flags match in order.
fn same_devices(old: &[AudioDevice], new: &[AudioDevice]) -> bool {
    old.len() == new.len()
        && old
            .iter()
            .zip(new)
            .all(|(a, b)| a.id() == b.id() && a.is_default() == b.is_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Answers every request with a fixed payload, either immediately or
    /// when `sync()` is pumped.
    #[derive(Default)]
    struct ScriptedRequester {
        deferred: bool,
        formats: Mutex<HashMap<ObjectId, Vec<NodeFormatPayload>>>,
        queued: Mutex<Vec<(ObjectId, FormatPromise)>>,
        syncs: AtomicUsize,
    }

    impl ScriptedRequester {
        fn immediate() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn deferred() -> Arc<Self> {
            Arc::new(Self {
                deferred: true,
                ..Default::default()
            })
        }

        fn answer(&self, node_id: ObjectId, promise: FormatPromise) {
            let payloads = self
                .formats
                .lock()
                .get(&node_id)
                .cloned()
                .unwrap_or_else(|| vec![NodeFormatPayload::raw("S16LE", 48000, 2)]);
            for payload in &payloads {
                promise.push(payload);
            }
            promise.finish();
        }
    }

    impl FormatRequester for ScriptedRequester {
        fn enumerate_formats(&self, node_id: ObjectId, promise: FormatPromise) {
            if self.deferred {
                self.queued.lock().push((node_id, promise));
            } else {
                self.answer(node_id, promise);
            }
        }

        fn sync(&self) {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            let queued = std::mem::take(&mut *self.queued.lock());
            for (node_id, promise) in queued {
                self.answer(node_id, promise);
            }
        }
    }

    fn monitor(requester: Arc<ScriptedRequester>, delay_ms: u64) -> DeviceMonitor {
        monitor_with(requester, delay_ms)
    }

    fn monitor_with(requester: Arc<dyn FormatRequester>, delay_ms: u64) -> DeviceMonitor {
        let _ = env_logger::builder().is_test(true).try_init();
        let desc = MonitorDesc::new().compression_delay(Duration::from_millis(delay_ms));
        DeviceMonitor::new(requester, desc).unwrap()
    }

    fn node(id: ObjectId, serial: u64, class: &str, name: &str, description: &str) -> RegistryEvent {
        let mut props = Properties::new();
        props.insert(keys::NODE_NAME.into(), name.into());
        props.insert(keys::NODE_DESCRIPTION.into(), description.into());
        RegistryEvent::ObjectAdded {
            id,
            serial: ObjectSerial(serial),
            media_class: class.into(),
            props,
        }
    }

    fn names(devices: &[AudioDevice]) -> Vec<&str> {
        devices.iter().map(|d| d.id()).collect()
    }

    #[test]
    fn test_nodes_are_filtered_and_sorted() {
        let monitor = monitor(ScriptedRequester::immediate(), 1000);
        monitor.handle_event(node(1, 10, "Audio/Sink", "speakers", "Speakers"));
        monitor.handle_event(node(2, 11, "Audio/Sink/Virtual", "combined", "Combined"));
        monitor.handle_event(node(3, 12, "Audio/Sink", DUMMY_NODE_NAME, "Dummy"));
        monitor.handle_event(node(4, 13, "Video/Source", "camera", "Camera"));
        monitor.handle_event(node(5, 14, "Audio/Source", "mic", "Microphone"));
        monitor.handle_event(RegistryEvent::ObjectAdded {
            id: 6,
            serial: ObjectSerial(15),
            media_class: "Audio/Sink".into(),
            props: Properties::new(),
        });

        let lists = monitor.device_lists();
        assert_eq!(names(&lists.sinks), vec!["combined", "speakers"]);
        assert_eq!(names(&lists.sources), vec!["mic"]);
        assert_eq!(lists.sinks[1].preferred_format().sample_rate(), 48000);
    }

    #[test]
    fn test_node_of_untracked_device_is_ignored() {
        let monitor = monitor(ScriptedRequester::immediate(), 1000);
        let mut device_props = Properties::new();
        device_props.insert(keys::DEVICE_SYSFS_PATH.into(), "/devices/pci0000:00/sound".into());
        monitor.handle_event(RegistryEvent::ObjectAdded {
            id: 40,
            serial: ObjectSerial(400),
            media_class: "Audio/Device".into(),
            props: device_props,
        });

        let RegistryEvent::ObjectAdded { props, .. } = node(41, 401, "Audio/Sink", "hdmi", "HDMI")
        else {
            unreachable!()
        };
        let mut props_tracked = props.clone();
        props_tracked.insert(keys::DEVICE_ID.into(), "40".into());
        let mut props_untracked = props;
        props_untracked.insert(keys::NODE_NAME.into(), "orphan".into());
        props_untracked.insert(keys::DEVICE_ID.into(), "99".into());

        for (id, serial, props) in [(41, 401, props_tracked), (42, 402, props_untracked)] {
            monitor.handle_event(RegistryEvent::ObjectAdded {
                id,
                serial: ObjectSerial(serial),
                media_class: "Audio/Sink".into(),
                props,
            });
        }

        let lists = monitor.device_lists();
        assert_eq!(names(&lists.sinks), vec!["hdmi"]);
        assert_eq!(lists.sinks[0].sysfs_path(), Some("/devices/pci0000:00/sound"));
        assert_eq!(monitor.find_object_serial(42), None);
    }

    #[test]
    fn test_blocking_get_pumps_sync_until_resolved() {
        let requester = ScriptedRequester::deferred();
        let monitor = monitor(requester.clone(), 1000);
        monitor.handle_event(node(1, 10, "Audio/Source", "mic", "Mic"));

        assert!(monitor.audio_sources().is_empty());
        let lists = monitor.device_lists();
        assert_eq!(names(&lists.sources), vec!["mic"]);
        assert!(requester.syncs.load(Ordering::SeqCst) >= 1);
        assert_eq!(names(&monitor.audio_sources()), vec!["mic"]);
    }

    #[test]
    fn test_encoded_only_node_is_not_published() {
        let requester = ScriptedRequester::immediate();
        requester
            .formats
            .lock()
            .insert(1, vec![NodeFormatPayload::iec958("AC3", 48000)]);
        requester.formats.lock().insert(
            2,
            vec![
                NodeFormatPayload::iec958("PCM", 48000),
                NodeFormatPayload::raw("F32LE", 44100, 2),
            ],
        );
        let monitor = monitor(requester, 1000);
        monitor.handle_event(node(1, 10, "Audio/Sink", "spdif", "S/PDIF"));
        monitor.handle_event(node(2, 11, "Audio/Sink", "hdmi", "HDMI"));

        let lists = monitor.device_lists();
        assert_eq!(names(&lists.sinks), vec!["hdmi"]);
        assert_eq!(
            lists.sinks[0].preferred_format().sample_format(),
            SampleFormat::Float
        );
    }

    #[test]
    fn test_republish_without_change_is_silent() {
        let monitor = monitor(ScriptedRequester::immediate(), 1000);
        let events = monitor.subscribe();
        monitor.handle_event(node(1, 10, "Audio/Sink", "speakers", "Speakers"));
        monitor.handle_event(RegistryEvent::DefaultSinkChanged(Some("speakers".into())));

        let lists = monitor.device_lists();
        assert!(lists.sinks[0].is_default());
        let first: Vec<_> = events.try_iter().collect();
        assert!(first.contains(&SonicPortEvent::AudioOutputsChanged));
        assert!(first.contains(&SonicPortEvent::DefaultOutputChanged));

        monitor.handle_event(RegistryEvent::DefaultSinkChanged(Some("speakers".into())));
        monitor.device_lists();
        monitor.device_lists();
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn test_default_flag_change_is_published() {
        let monitor = monitor(ScriptedRequester::immediate(), 1000);
        monitor.handle_event(node(1, 10, "Audio/Sink", "a", "A"));
        monitor.handle_event(node(2, 11, "Audio/Sink", "b", "B"));
        monitor.handle_event(RegistryEvent::DefaultSinkChanged(Some("a".into())));
        monitor.device_lists();

        let events = monitor.subscribe();
        monitor.handle_event(RegistryEvent::DefaultSinkChanged(Some("b".into())));
        let lists = monitor.device_lists();
        assert!(!lists.sinks[0].is_default());
        assert!(lists.sinks[1].is_default());
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![
                SonicPortEvent::AudioOutputsChanged,
                SonicPortEvent::DefaultOutputChanged
            ]
        );
    }

    #[test]
    fn test_serial_survives_id_reuse() {
        let monitor = monitor(ScriptedRequester::immediate(), 1000);
        let removed = Arc::new(Mutex::new(Vec::new()));

        monitor.handle_event(node(5, 100, "Audio/Sink", "first", "First"));
        let sink = removed.clone();
        let observer: Arc<dyn RemovalObserver> =
            Arc::new(move |serial: ObjectSerial| sink.lock().push(serial));
        assert!(monitor.register_observer(ObjectSerial(100), observer.clone()));

        monitor.handle_event(RegistryEvent::ObjectRemoved { id: 5 });
        assert!(!monitor.register_observer(ObjectSerial(100), observer.clone()));

        monitor.handle_event(node(5, 101, "Audio/Sink", "second", "Second"));
        assert_eq!(monitor.find_object_serial(5), Some(ObjectSerial(101)));
        assert_eq!(monitor.find_object_id(ObjectSerial(100)), None);
        monitor.handle_event(RegistryEvent::ObjectRemoved { id: 5 });

        assert_eq!(*removed.lock(), vec![ObjectSerial(100)]);
        assert!(monitor.device_lists().sinks.is_empty());
    }

    #[test]
    fn test_unregistered_observer_is_not_called() {
        let monitor = monitor(ScriptedRequester::immediate(), 1000);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let observer: Arc<dyn RemovalObserver> = Arc::new(move |_: ObjectSerial| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.handle_event(node(1, 10, "Audio/Sink", "a", "A"));
        assert!(monitor.register_observer(ObjectSerial(10), observer.clone()));
        monitor.unregister_observer(&observer);
        monitor.handle_event(RegistryEvent::ObjectRemoved { id: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removal_cancels_pending_resolution() {
        let requester = ScriptedRequester::deferred();
        let monitor = monitor(requester.clone(), 1000);
        monitor.handle_event(node(1, 10, "Audio/Sink", "gone", "Gone"));
        monitor.handle_event(RegistryEvent::ObjectRemoved { id: 1 });

        requester.sync();
        assert!(monitor.device_lists().sinks.is_empty());
    }

    #[test]
    fn test_removal_during_pass_is_not_published() {
        let monitor = monitor(ScriptedRequester::immediate(), 1000);
        let events = monitor.subscribe();
        monitor.handle_event(node(1, 10, "Audio/Sink", "kept", "Kept"));
        monitor.handle_event(node(2, 11, "Audio/Sink", "gone", "Gone"));

        let batch = monitor.inner.drain_pending();
        assert_eq!(batch.resolved.len(), 2);
        monitor.handle_event(RegistryEvent::ObjectRemoved { id: 2 });
        monitor.inner.publish(batch);

        assert_eq!(names(&monitor.audio_sinks()), vec!["kept"]);
        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![SonicPortEvent::AudioOutputsChanged]);

        monitor.device_lists();
        assert_eq!(names(&monitor.audio_sinks()), vec!["kept"]);
        assert!(events.try_iter().next().is_none());
    }

    /// Records which thread each requester call arrives on.
    #[derive(Default)]
    struct ThreadRecorder {
        requested_on: Mutex<Vec<thread::ThreadId>>,
        synced_on: Mutex<Vec<thread::ThreadId>>,
        queued: Mutex<Vec<FormatPromise>>,
    }

    impl FormatRequester for ThreadRecorder {
        fn enumerate_formats(&self, _node_id: ObjectId, promise: FormatPromise) {
            self.requested_on.lock().push(thread::current().id());
            self.queued.lock().push(promise);
        }

        fn sync(&self) {
            self.synced_on.lock().push(thread::current().id());
            for promise in std::mem::take(&mut *self.queued.lock()) {
                promise.push(&NodeFormatPayload::raw("S16LE", 48000, 2));
                promise.finish();
            }
        }
    }

    #[test]
    fn test_requests_run_on_delivering_thread() {
        let recorder = Arc::new(ThreadRecorder::default());
        let monitor = Arc::new(monitor_with(recorder.clone(), 1000));

        let delivering = monitor.clone();
        let registry_thread = thread::spawn(move || {
            delivering.handle_event(node(1, 10, "Audio/Sink", "speakers", "Speakers"));
            thread::current().id()
        });
        let registry_id = registry_thread.join().unwrap();

        assert_eq!(names(&monitor.device_lists().sinks), vec!["speakers"]);
        assert_eq!(*recorder.requested_on.lock(), vec![registry_id]);
        let synced = recorder.synced_on.lock();
        assert!(!synced.is_empty());
        assert!(synced.iter().all(|id| *id == thread::current().id()));
    }

    #[test]
    fn test_burst_is_coalesced_into_one_publish() {
        let monitor = monitor(ScriptedRequester::immediate(), 50);
        for i in 0..10 {
            monitor.handle_event(node(i, 100 + u64::from(i), "Audio/Sink", &format!("n{i}"), "N"));
        }
        assert_eq!(monitor.publish_cycles(), 0);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(monitor.publish_cycles(), 1);
        assert_eq!(monitor.audio_sinks().len(), 10);
    }

    #[test]
    fn test_monitor_feeds_device_registry() {
        let monitor = Arc::new(monitor(ScriptedRequester::immediate(), 1000));
        monitor.handle_event(node(1, 10, "Audio/Sink", "speakers", "Speakers"));
        monitor.device_lists();

        let registry = monitor.device_registry().unwrap();
        let events = registry.subscribe();
        assert_eq!(names(&registry.audio_outputs()), vec!["speakers"]);

        monitor.handle_event(node(2, 11, "Audio/Sink", "headphones", "Headphones"));
        monitor.handle_event(RegistryEvent::DefaultSinkChanged(Some("headphones".into())));
        monitor.device_lists();

        let timeout = Duration::from_secs(2);
        assert_eq!(events.recv_timeout(timeout).ok(), Some(SonicPortEvent::AudioOutputsChanged));
        assert_eq!(events.recv_timeout(timeout).ok(), Some(SonicPortEvent::DefaultOutputChanged));
        assert_eq!(names(&registry.audio_outputs()), vec!["headphones", "speakers"]);
        assert_eq!(
            registry.default_audio_output().map(|d| d.id().to_string()),
            Some("headphones".to_string())
        );
    }
}
