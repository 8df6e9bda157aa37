//! Simulated camera SDK (`stub://N`).
//!
//! Cameras share one [`SimRig`] which models the trigger cable: every frame the
//! free-running primary clocks while its exposure-active strobe is routed to an
//! output line produces one pulse, and every armed secondary listening on the
//! trigger input line receives one frame per pulse. Each secondary buffers
//! pulses in a bounded queue sized by its stream buffer settings. On overflow
//! the overwrite handling modes evict the oldest pending frame while
//! `OldestFirst` rejects the new pulse. Either way the loss is counted and
//! leaves a gap in that device's frame ids.
//!
//! Payloads carry the frame id and device timestamp in their first 16 bytes
//! (little endian) so recordings can be checked against the log.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{
    Camera, CameraProfile, CameraSystem, DeviceResult, Frame, NodeAccess, NodeMap, PixelFormat,
};
use crate::error::DeviceError;

/// Delay between the primary's exposure start and a secondary's timestamp.
const TRIGGER_LATENCY_NS: u64 = 1_500;
/// Wait used when the caller passes no timeout.
const IDLE_WAIT: Duration = Duration::from_secs(1);
/// Queue capacity when buffer counting is left on automatic.
const AUTO_BUFFER_COUNT: usize = 10;

/// Rig-wide behaviour knobs.
#[derive(Clone, Debug, Default)]
pub struct SimOptions {
    /// The primary waits for every secondary to be armed and for queue room
    /// before clocking a frame, so no pulse is ever dropped.
    pub lossless: bool,
    /// Clock the primary at its configured frame rate instead of on demand.
    pub pace: bool,
    /// Stop clocking after this many primary frames.
    pub frame_limit: Option<u64>,
    /// Pulses never reach the secondaries.
    pub trigger_line_dead: bool,
}

/// Static description of one simulated camera.
#[derive(Clone, Debug)]
pub struct SimCameraSpec {
    pub serial: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub max_exposure_us: f64,
    pub max_frame_rate: f64,
    pub max_buffers: i64,
    /// Every n-th frame is delivered incomplete.
    pub incomplete_every: Option<u64>,
    /// Nodes removed from the node maps.
    pub missing_nodes: Vec<(NodeMap, String)>,
}

impl SimCameraSpec {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            model: "Blackfly S BFS-U3-16S2M".to_string(),
            width: 64,
            height: 48,
            max_exposure_us: 30_000.0,
            max_frame_rate: 200.0,
            max_buffers: 1000,
            incomplete_every: None,
            missing_nodes: Vec::new(),
        }
    }
}

pub struct SimulatedSystem {
    specs: Vec<SimCameraSpec>,
    rig: Arc<SimRig>,
}

impl SimulatedSystem {
    pub fn new(specs: Vec<SimCameraSpec>, options: SimOptions) -> Self {
        let rig = Arc::new(SimRig::new(specs.len(), options));
        Self { specs, rig }
    }

    /// `count` cameras with serials `sim-0000`, `sim-0001`, ...
    pub fn with_cameras(count: usize, options: SimOptions) -> Self {
        let specs = (0..count)
            .map(|index| SimCameraSpec::new(format!("sim-{:04}", index)))
            .collect();
        Self::new(specs, options)
    }

    /// Build a paced rig from a `stub://N` source string.
    pub fn from_source(source: &str) -> DeviceResult<Self> {
        let count = source
            .strip_prefix("stub://")
            .ok_or_else(|| DeviceError::Backend(format!("unsupported camera source {}", source)))?;
        let count: usize = if count.is_empty() {
            1
        } else {
            count
                .parse()
                .map_err(|_| DeviceError::Backend(format!("invalid camera count in {}", source)))?
        };
        Ok(Self::with_cameras(
            count,
            SimOptions {
                pace: true,
                ..SimOptions::default()
            },
        ))
    }

    /// Camera handles currently initialized and not yet released.
    pub fn open_cameras(&self) -> usize {
        self.rig.open.load(Ordering::SeqCst)
    }
}

impl CameraSystem for SimulatedSystem {
    type Camera = SimCamera;

    fn library_version(&self) -> String {
        format!("syncrec-sim {}", env!("CARGO_PKG_VERSION"))
    }

    fn cameras(&mut self) -> DeviceResult<Vec<SimCamera>> {
        Ok(self
            .specs
            .iter()
            .map(|spec| SimCamera::new(spec.clone(), Arc::clone(&self.rig)))
            .collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SimRig {
    start: Instant,
    cameras: usize,
    options: SimOptions,
    listeners: Mutex<Vec<Arc<FrameQueue>>>,
    armed: Condvar,
    open: AtomicUsize,
}

impl SimRig {
    fn new(cameras: usize, options: SimOptions) -> Self {
        Self {
            start: Instant::now(),
            cameras,
            options,
            listeners: Mutex::new(Vec::new()),
            armed: Condvar::new(),
            open: AtomicUsize::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn arm(&self, queue: Arc<FrameQueue>) {
        lock(&self.listeners).push(queue);
        self.armed.notify_all();
    }

    fn disarm(&self, queue: &Arc<FrameQueue>) {
        lock(&self.listeners).retain(|armed| !Arc::ptr_eq(armed, queue));
        queue.close();
        self.armed.notify_all();
    }

    /// Block until every camera but the primary listens, or `wait` expires.
    fn wait_for_listeners(&self, wait: Duration) {
        let wanted = self.cameras.saturating_sub(1);
        let deadline = Instant::now() + wait;
        let mut listeners = lock(&self.listeners);
        while listeners.len() < wanted {
            let now = Instant::now();
            if now >= deadline {
                log::debug!(
                    "sim: clocking with {} of {} secondaries armed",
                    listeners.len(),
                    wanted
                );
                break;
            }
            listeners = self
                .armed
                .wait_timeout(listeners, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn pulse(&self, timestamp_ns: u64, stall: Option<Duration>) {
        let listeners: Vec<Arc<FrameQueue>> = lock(&self.listeners).clone();
        for queue in listeners {
            queue.push(timestamp_ns, stall);
        }
    }
}

struct Pending {
    frame_id: u64,
    timestamp_ns: u64,
}

struct QueueState {
    pending: VecDeque<Pending>,
    capacity: usize,
    overwrite: bool,
    next_id: u64,
    dropped: u64,
    closed: bool,
}

/// Device-side buffer pool of a triggered camera.
struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    room: Condvar,
}

impl FrameQueue {
    fn new(capacity: usize, overwrite: bool, next_id: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                overwrite,
                next_id,
                dropped: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            room: Condvar::new(),
        }
    }

    fn push(&self, timestamp_ns: u64, stall: Option<Duration>) {
        let mut state = lock(&self.state);
        if let Some(stall) = stall {
            let deadline = Instant::now() + stall;
            while !state.closed && state.pending.len() >= state.capacity {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = self
                    .room
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
        if state.closed {
            return;
        }
        let frame_id = state.next_id;
        state.next_id += 1;
        if state.pending.len() >= state.capacity {
            state.dropped += 1;
            if !state.overwrite {
                return;
            }
            state.pending.pop_front();
        }
        state.pending.push_back(Pending {
            frame_id,
            timestamp_ns,
        });
        self.ready.notify_one();
    }

    fn pop(&self, wait: Duration) -> Option<Pending> {
        let deadline = Instant::now() + wait;
        let mut state = lock(&self.state);
        loop {
            if let Some(pending) = state.pending.pop_front() {
                self.room.notify_all();
                return Some(pending);
            }
            let now = Instant::now();
            if now >= deadline || state.closed {
                return None;
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_all();
        self.room.notify_all();
    }

    fn next_id(&self) -> u64 {
        lock(&self.state).next_id
    }

    fn dropped(&self) -> u64 {
        lock(&self.state).dropped
    }
}

#[derive(Clone, Debug)]
enum NodeValue {
    Enum { value: String, entries: Vec<String> },
    Float { value: f64, max: f64 },
    Int { value: i64, max: i64 },
    Bool(bool),
    Str(String),
}

#[derive(Clone, Debug)]
struct Node {
    value: NodeValue,
    writable: bool,
}

impl Node {
    fn rw(value: NodeValue) -> Self {
        Self {
            value,
            writable: true,
        }
    }

    fn ro(value: NodeValue) -> Self {
        Self {
            value,
            writable: false,
        }
    }
}

fn enum_node(value: &str, entries: &[&str]) -> Node {
    Node::rw(NodeValue::Enum {
        value: value.to_string(),
        entries: entries.iter().map(|entry| entry.to_string()).collect(),
    })
}

fn build_nodes(spec: &SimCameraSpec, profile: &CameraProfile) -> HashMap<(NodeMap, String), Node> {
    let mut nodes = HashMap::new();
    let mut device = |name: &str, node: Node| {
        nodes.insert((NodeMap::Device, name.to_string()), node);
    };

    device("DeviceUserID", Node::rw(NodeValue::Str(String::new())));
    device("ExposureAuto", enum_node("Continuous", &["Off", "Once", "Continuous"]));
    device(
        "ExposureTime",
        Node::rw(NodeValue::Float {
            value: spec.max_exposure_us.min(10_000.0),
            max: spec.max_exposure_us,
        }),
    );
    device(
        "AcquisitionFrameRate",
        Node::rw(NodeValue::Float {
            value: spec.max_frame_rate.min(30.0),
            max: spec.max_frame_rate,
        }),
    );
    if let Some(enable) = profile.frame_rate_enable_node {
        device(enable, Node::rw(NodeValue::Bool(false)));
    }
    if let Some(auto) = profile.frame_rate_auto_node {
        device(auto, enum_node("Continuous", &["Off", "Continuous"]));
    }
    if let Some(resulting) = profile.resulting_frame_rate_node {
        device(
            resulting,
            Node::ro(NodeValue::Float {
                value: 0.0,
                max: spec.max_frame_rate,
            }),
        );
    }
    device("LineSelector", enum_node("Line0", &["Line0", "Line1", "Line2", "Line3"]));
    device("LineMode", enum_node("Input", &["Input", "Output"]));
    device("LineSource", enum_node("Off", &["Off", "ExposureActive"]));
    device("TriggerMode", enum_node("Off", &["Off", "On"]));
    device(
        "TriggerSource",
        enum_node("Software", &["Software", "Line0", "Line3"]),
    );
    device(
        "Width",
        Node::rw(NodeValue::Int {
            value: i64::from(spec.width),
            max: i64::from(spec.width),
        }),
    );
    device(
        "Height",
        Node::rw(NodeValue::Int {
            value: i64::from(spec.height),
            max: i64::from(spec.height),
        }),
    );
    device("PixelFormat", enum_node("Mono8", &["Mono8", "BayerRG8"]));

    let mut stream = |name: &str, node: Node| {
        nodes.insert((NodeMap::Stream, name.to_string()), node);
    };
    stream("StreamBufferCountMode", enum_node("Auto", &["Auto", "Manual"]));
    stream(
        "StreamBufferCountManual",
        Node::rw(NodeValue::Int {
            value: AUTO_BUFFER_COUNT as i64,
            max: spec.max_buffers,
        }),
    );
    stream(
        "StreamBufferHandlingMode",
        enum_node(
            "NewestOnly",
            &["OldestFirst", "OldestFirstOverwrite", "NewestOnly", "NewestFirst"],
        ),
    );

    for (map, name) in &spec.missing_nodes {
        nodes.remove(&(*map, name.clone()));
    }
    nodes
}

/// One simulated camera handle.
pub struct SimCamera {
    spec: SimCameraSpec,
    profile: &'static CameraProfile,
    rig: Arc<SimRig>,
    nodes: HashMap<(NodeMap, String), Node>,
    initialized: bool,
    acquiring: bool,
    queue: Option<Arc<FrameQueue>>,
    next_id: u64,
    next_due: Option<Instant>,
    listeners_settled: bool,
}

impl SimCamera {
    fn new(spec: SimCameraSpec, rig: Arc<SimRig>) -> Self {
        let profile = CameraProfile::for_model(&spec.model);
        let nodes = build_nodes(&spec, profile);
        Self {
            spec,
            profile,
            rig,
            nodes,
            initialized: false,
            acquiring: false,
            queue: None,
            next_id: 0,
            next_due: None,
            listeners_settled: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Pulses lost to a full buffer queue since the last acquisition start.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.as_ref().map(|queue| queue.dropped()).unwrap_or(0)
    }

    fn node(&self, map: NodeMap, name: &str) -> DeviceResult<&Node> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        self.nodes
            .get(&(map, name.to_string()))
            .ok_or_else(|| DeviceError::NodeUnavailable {
                map,
                name: name.to_string(),
            })
    }

    fn node_mut(&mut self, map: NodeMap, name: &str) -> DeviceResult<&mut Node> {
        if !self.node_access(map, name).writable {
            self.node(map, name)?;
            return Err(DeviceError::NodeNotWritable {
                name: name.to_string(),
            });
        }
        self.nodes
            .get_mut(&(map, name.to_string()))
            .ok_or_else(|| DeviceError::NodeUnavailable {
                map,
                name: name.to_string(),
            })
    }

    fn enum_value(&self, map: NodeMap, name: &str) -> Option<&str> {
        match self.nodes.get(&(map, name.to_string())).map(|node| &node.value) {
            Some(NodeValue::Enum { value, .. }) => Some(value.as_str()),
            _ => None,
        }
    }

    fn float_value(&self, name: &str) -> Option<f64> {
        match self
            .nodes
            .get(&(NodeMap::Device, name.to_string()))
            .map(|node| &node.value)
        {
            Some(NodeValue::Float { value, .. }) => Some(*value),
            _ => None,
        }
    }

    fn int_value(&self, map: NodeMap, name: &str) -> Option<i64> {
        match self.nodes.get(&(map, name.to_string())).map(|node| &node.value) {
            Some(NodeValue::Int { value, .. }) => Some(*value),
            _ => None,
        }
    }

    fn frame_rate_control_enabled(&self) -> bool {
        let enabled = match self.profile.frame_rate_enable_node {
            Some(enable) => !matches!(
                self.nodes
                    .get(&(NodeMap::Device, enable.to_string()))
                    .map(|node| &node.value),
                Some(NodeValue::Bool(false))
            ),
            None => true,
        };
        let manual = match self.profile.frame_rate_auto_node {
            Some(auto) => self
                .enum_value(NodeMap::Device, auto)
                .map_or(true, |value| value == "Off"),
            None => true,
        };
        enabled && manual
    }

    /// Sensor readout bound for the current exposure.
    fn exposure_bound_rate(&self) -> f64 {
        let exposure = self.float_value("ExposureTime").unwrap_or(1.0).max(1.0);
        1e6 / exposure
    }

    fn dynamic_writable(&self, map: NodeMap, name: &str) -> bool {
        match (map, name) {
            (NodeMap::Device, "TriggerSource") => {
                self.enum_value(NodeMap::Device, "TriggerMode") == Some("Off")
            }
            (NodeMap::Device, "AcquisitionFrameRate") => self.frame_rate_control_enabled(),
            (NodeMap::Device, "Width" | "Height" | "PixelFormat") => !self.acquiring,
            (NodeMap::Stream, "StreamBufferCountManual") => {
                self.enum_value(NodeMap::Stream, "StreamBufferCountMode") == Some("Manual")
            }
            _ => true,
        }
    }

    fn pixel_format(&self) -> PixelFormat {
        match self.enum_value(NodeMap::Device, "PixelFormat") {
            Some("BayerRG8") => PixelFormat::BayerRG8,
            _ => PixelFormat::Mono8,
        }
    }

    fn strobe_active(&self) -> bool {
        self.enum_value(NodeMap::Device, "LineSelector") == Some(self.profile.strobe_line)
            && self.enum_value(NodeMap::Device, "LineMode") == Some("Output")
            && self.enum_value(NodeMap::Device, "LineSource") == Some("ExposureActive")
    }

    fn make_frame(&self, frame_id: u64, timestamp_ns: u64) -> Frame {
        let width = self
            .int_value(NodeMap::Device, "Width")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(self.spec.width);
        let height = self
            .int_value(NodeMap::Device, "Height")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(self.spec.height);
        let size = self.pixel_format().frame_size(width, height);
        let mut data: Vec<u8> = (0..size)
            .map(|i| (i as u64).wrapping_add(frame_id) as u8)
            .collect();
        let mut header = [0u8; 16];
        header[..8].copy_from_slice(&frame_id.to_le_bytes());
        header[8..].copy_from_slice(&timestamp_ns.to_le_bytes());
        let n = header.len().min(size);
        data[..n].copy_from_slice(&header[..n]);

        let complete = match self.spec.incomplete_every {
            Some(every) if every > 0 => (frame_id + 1) % every != 0,
            _ => true,
        };
        Frame::new(frame_id, timestamp_ns, complete, width, height, data)
    }

    /// Free-running capture: one exposure per call, pulsing the trigger line.
    fn clock_frame(&mut self, wait: Duration) -> DeviceResult<Frame> {
        let options = self.rig.options.clone();
        if let Some(limit) = options.frame_limit {
            if self.next_id >= limit {
                std::thread::sleep(wait);
                return Err(DeviceError::Timeout);
            }
        }
        if options.lossless && !self.listeners_settled {
            self.rig.wait_for_listeners(wait);
            self.listeners_settled = true;
        }
        if options.pace {
            let rate = self.float_value("AcquisitionFrameRate").unwrap_or(30.0).max(0.1);
            let period = Duration::from_secs_f64(1.0 / rate);
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            self.next_due = Some(due.max(now) + period);
        }

        let timestamp_ns = self.rig.now_ns();
        let frame_id = self.next_id;
        self.next_id += 1;
        if self.strobe_active() && !options.trigger_line_dead {
            let stall = options.lossless.then_some(wait);
            self.rig.pulse(timestamp_ns + TRIGGER_LATENCY_NS, stall);
        }
        Ok(self.make_frame(frame_id, timestamp_ns))
    }
}

impl Camera for SimCamera {
    fn serial(&self) -> &str {
        &self.spec.serial
    }

    fn model(&self) -> &str {
        &self.spec.model
    }

    fn init(&mut self) -> DeviceResult<()> {
        if !self.initialized {
            self.rig.open.fetch_add(1, Ordering::SeqCst);
        }
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> DeviceResult<()> {
        if self.acquiring {
            self.end_acquisition()?;
        }
        if self.initialized {
            self.rig.open.fetch_sub(1, Ordering::SeqCst);
        }
        self.initialized = false;
        Ok(())
    }

    fn node_access(&self, map: NodeMap, name: &str) -> NodeAccess {
        match self.node(map, name) {
            Ok(node) => NodeAccess {
                available: true,
                readable: true,
                writable: node.writable && self.dynamic_writable(map, name),
            },
            Err(_) => NodeAccess::NONE,
        }
    }

    fn enum_entries(&self, map: NodeMap, name: &str) -> DeviceResult<Vec<String>> {
        match &self.node(map, name)?.value {
            NodeValue::Enum { entries, .. } => Ok(entries.clone()),
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_enum(&self, map: NodeMap, name: &str) -> DeviceResult<String> {
        match &self.node(map, name)?.value {
            NodeValue::Enum { value, .. } => Ok(value.clone()),
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_enum_set(&mut self, map: NodeMap, name: &str, entry: &str) -> DeviceResult<()> {
        match &mut self.node_mut(map, name)?.value {
            NodeValue::Enum { value, entries } => {
                if !entries.iter().any(|candidate| candidate == entry) {
                    return Err(DeviceError::InvalidEntry {
                        name: name.to_string(),
                        entry: entry.to_string(),
                    });
                }
                *value = entry.to_string();
                Ok(())
            }
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_float(&self, map: NodeMap, name: &str) -> DeviceResult<f64> {
        let node = self.node(map, name)?;
        if Some(name) == self.profile.resulting_frame_rate_node {
            let requested = self.float_value("AcquisitionFrameRate").unwrap_or(0.0);
            return Ok(requested.min(self.exposure_bound_rate()));
        }
        match &node.value {
            NodeValue::Float { value, .. } => Ok(*value),
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_float_max(&self, map: NodeMap, name: &str) -> DeviceResult<f64> {
        let node = self.node(map, name)?;
        let max = match &node.value {
            NodeValue::Float { max, .. } => *max,
            _ => {
                return Err(DeviceError::WrongNodeType {
                    name: name.to_string(),
                })
            }
        };
        // Models without a resulting-rate node shrink the maximum instead.
        if name == "AcquisitionFrameRate" && self.profile.resulting_frame_rate_node.is_none() {
            return Ok(max.min(self.exposure_bound_rate()));
        }
        Ok(max)
    }

    fn feature_float_set(&mut self, map: NodeMap, name: &str, value: f64) -> DeviceResult<()> {
        let limit = self.feature_float_max(map, name)?;
        match &mut self.node_mut(map, name)?.value {
            NodeValue::Float { value: current, .. } => {
                if !(value.is_finite() && value >= 0.0 && value <= limit) {
                    return Err(DeviceError::Backend(format!(
                        "{} value {} outside [0, {}]",
                        name, value, limit
                    )));
                }
                *current = value;
                Ok(())
            }
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_int(&self, map: NodeMap, name: &str) -> DeviceResult<i64> {
        match &self.node(map, name)?.value {
            NodeValue::Int { value, .. } => Ok(*value),
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_int_max(&self, map: NodeMap, name: &str) -> DeviceResult<i64> {
        match &self.node(map, name)?.value {
            NodeValue::Int { max, .. } => Ok(*max),
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_int_set(&mut self, map: NodeMap, name: &str, value: i64) -> DeviceResult<()> {
        match &mut self.node_mut(map, name)?.value {
            NodeValue::Int { value: current, max } => {
                if value < 1 || value > *max {
                    return Err(DeviceError::Backend(format!(
                        "{} value {} outside [1, {}]",
                        name, value, max
                    )));
                }
                *current = value;
                Ok(())
            }
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_bool_set(&mut self, map: NodeMap, name: &str, value: bool) -> DeviceResult<()> {
        match &mut self.node_mut(map, name)?.value {
            NodeValue::Bool(current) => {
                *current = value;
                Ok(())
            }
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn feature_string_set(&mut self, map: NodeMap, name: &str, value: &str) -> DeviceResult<()> {
        match &mut self.node_mut(map, name)?.value {
            NodeValue::Str(current) => {
                *current = value.to_string();
                Ok(())
            }
            _ => Err(DeviceError::WrongNodeType {
                name: name.to_string(),
            }),
        }
    }

    fn begin_acquisition(&mut self) -> DeviceResult<()> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        if self.acquiring {
            return Ok(());
        }
        self.acquiring = true;
        self.next_due = None;
        if self.enum_value(NodeMap::Device, "TriggerMode") != Some("On") {
            self.queue = None;
            return Ok(());
        }

        let capacity = if self.enum_value(NodeMap::Stream, "StreamBufferCountMode") == Some("Manual")
        {
            self.int_value(NodeMap::Stream, "StreamBufferCountManual")
                .and_then(|count| usize::try_from(count).ok())
                .unwrap_or(AUTO_BUFFER_COUNT)
        } else {
            AUTO_BUFFER_COUNT
        };
        let handling = self.enum_value(NodeMap::Stream, "StreamBufferHandlingMode");
        let (capacity, overwrite) = match handling {
            Some("OldestFirst") => (capacity, false),
            Some("NewestOnly") => (1, true),
            _ => (capacity, true),
        };
        let next_id = self.queue.as_ref().map(|queue| queue.next_id()).unwrap_or(0);
        let queue = Arc::new(FrameQueue::new(capacity, overwrite, next_id));
        if self.enum_value(NodeMap::Device, "TriggerSource") == Some(self.profile.trigger_line) {
            self.rig.arm(Arc::clone(&queue));
        } else {
            log::debug!(
                "sim {}: triggered but not listening on {}",
                self.spec.serial,
                self.profile.trigger_line
            );
        }
        self.queue = Some(queue);
        Ok(())
    }

    fn end_acquisition(&mut self) -> DeviceResult<()> {
        if !self.acquiring {
            return Err(DeviceError::NotAcquiring);
        }
        if let Some(queue) = &self.queue {
            self.rig.disarm(queue);
        }
        self.acquiring = false;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Option<Duration>) -> DeviceResult<Frame> {
        if !self.initialized {
            return Err(DeviceError::NotInitialized);
        }
        if !self.acquiring {
            return Err(DeviceError::NotAcquiring);
        }
        let wait = timeout.unwrap_or(IDLE_WAIT);
        match self.queue.clone() {
            Some(queue) => match queue.pop(wait) {
                Some(pending) => Ok(self.make_frame(pending.frame_id, pending.timestamp_ns)),
                None => Err(DeviceError::Timeout),
            },
            None => self.clock_frame(wait),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm_secondary(camera: &mut SimCamera, buffers: i64, handling: &str) {
        camera.init().unwrap();
        camera
            .feature_enum_set(NodeMap::Device, "TriggerSource", "Line3")
            .unwrap();
        camera
            .feature_enum_set(NodeMap::Device, "TriggerMode", "On")
            .unwrap();
        camera
            .feature_enum_set(NodeMap::Stream, "StreamBufferCountMode", "Manual")
            .unwrap();
        camera
            .feature_int_set(NodeMap::Stream, "StreamBufferCountManual", buffers)
            .unwrap();
        camera
            .feature_enum_set(NodeMap::Stream, "StreamBufferHandlingMode", handling)
            .unwrap();
        camera.begin_acquisition().unwrap();
    }

    fn start_primary(camera: &mut SimCamera) {
        camera.init().unwrap();
        camera
            .feature_enum_set(NodeMap::Device, "LineSelector", "Line2")
            .unwrap();
        camera
            .feature_enum_set(NodeMap::Device, "LineMode", "Output")
            .unwrap();
        camera
            .feature_enum_set(NodeMap::Device, "LineSource", "ExposureActive")
            .unwrap();
        camera.begin_acquisition().unwrap();
    }

    #[test]
    fn source_string_sets_camera_count() {
        let mut system = SimulatedSystem::from_source("stub://4").unwrap();
        let cameras = system.cameras().unwrap();
        assert_eq!(cameras.len(), 4);
        assert_eq!(cameras[3].serial(), "sim-0003");
        assert!(SimulatedSystem::from_source("gige://0").is_err());
        assert!(SimulatedSystem::from_source("stub://x").is_err());
    }

    #[test]
    fn nodes_require_init() {
        let mut system = SimulatedSystem::with_cameras(1, SimOptions::default());
        let mut camera = system.cameras().unwrap().remove(0);
        assert_eq!(
            camera.node_access(NodeMap::Device, "ExposureTime"),
            NodeAccess::NONE
        );
        camera.init().unwrap();
        assert_eq!(
            camera.node_access(NodeMap::Device, "ExposureTime"),
            NodeAccess::READ_WRITE
        );
    }

    #[test]
    fn trigger_source_locked_while_trigger_mode_on() {
        let mut system = SimulatedSystem::with_cameras(1, SimOptions::default());
        let mut camera = system.cameras().unwrap().remove(0);
        camera.init().unwrap();
        camera
            .feature_enum_set(NodeMap::Device, "TriggerMode", "On")
            .unwrap();
        let err = camera
            .feature_enum_set(NodeMap::Device, "TriggerSource", "Line3")
            .unwrap_err();
        assert!(matches!(err, DeviceError::NodeNotWritable { .. }));
    }

    #[test]
    fn primary_pulses_reach_secondary() {
        let mut system = SimulatedSystem::with_cameras(2, SimOptions::default());
        let mut cameras = system.cameras().unwrap();
        let mut secondary = cameras.pop().unwrap();
        let mut primary = cameras.pop().unwrap();
        arm_secondary(&mut secondary, 8, "OldestFirst");
        start_primary(&mut primary);

        let timeout = Some(Duration::from_millis(100));
        for expected in 0..3u64 {
            let clocked = primary.next_frame(timeout).unwrap();
            let triggered = secondary.next_frame(timeout).unwrap();
            assert_eq!(clocked.frame_id, expected);
            assert_eq!(triggered.frame_id, expected);
            assert_eq!(
                triggered.timestamp_ns,
                clocked.timestamp_ns + TRIGGER_LATENCY_NS
            );
            assert_eq!(&triggered.data()[..8], &expected.to_le_bytes());
        }
        assert!(matches!(
            secondary.next_frame(Some(Duration::from_millis(10))),
            Err(DeviceError::Timeout)
        ));
    }

    #[test]
    fn full_queue_drops_oldest_pulses() {
        let mut system = SimulatedSystem::with_cameras(2, SimOptions::default());
        let mut cameras = system.cameras().unwrap();
        let mut secondary = cameras.pop().unwrap();
        let mut primary = cameras.pop().unwrap();
        arm_secondary(&mut secondary, 2, "OldestFirstOverwrite");
        start_primary(&mut primary);

        let timeout = Some(Duration::from_millis(50));
        for _ in 0..5 {
            primary.next_frame(timeout).unwrap();
        }
        assert_eq!(secondary.dropped_frames(), 3);
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 3);
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 4);
        primary.next_frame(timeout).unwrap();
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 5);
    }

    #[test]
    fn oldest_first_without_overwrite_rejects_new_pulses() {
        let mut system = SimulatedSystem::with_cameras(2, SimOptions::default());
        let mut cameras = system.cameras().unwrap();
        let mut secondary = cameras.pop().unwrap();
        let mut primary = cameras.pop().unwrap();
        arm_secondary(&mut secondary, 2, "OldestFirst");
        start_primary(&mut primary);

        let timeout = Some(Duration::from_millis(50));
        for _ in 0..5 {
            primary.next_frame(timeout).unwrap();
        }
        assert_eq!(secondary.dropped_frames(), 3);
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 0);
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 1);
        primary.next_frame(timeout).unwrap();
        // Rejected pulses still consumed device frame ids.
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 5);
    }

    #[test]
    fn dead_trigger_line_starves_secondaries() {
        let options = SimOptions {
            trigger_line_dead: true,
            ..SimOptions::default()
        };
        let mut system = SimulatedSystem::with_cameras(2, options);
        let mut cameras = system.cameras().unwrap();
        let mut secondary = cameras.pop().unwrap();
        let mut primary = cameras.pop().unwrap();
        arm_secondary(&mut secondary, 4, "OldestFirst");
        start_primary(&mut primary);

        primary.next_frame(Some(Duration::from_millis(10))).unwrap();
        assert!(matches!(
            secondary.next_frame(Some(Duration::from_millis(10))),
            Err(DeviceError::Timeout)
        ));
    }

    #[test]
    fn frame_limit_ends_primary_clock() {
        let options = SimOptions {
            frame_limit: Some(2),
            ..SimOptions::default()
        };
        let mut system = SimulatedSystem::with_cameras(1, options);
        let mut primary = system.cameras().unwrap().remove(0);
        start_primary(&mut primary);
        let timeout = Some(Duration::from_millis(5));
        assert!(primary.next_frame(timeout).is_ok());
        assert!(primary.next_frame(timeout).is_ok());
        assert!(matches!(
            primary.next_frame(timeout),
            Err(DeviceError::Timeout)
        ));
    }

    #[test]
    fn incomplete_frames_are_flagged() {
        let mut spec = SimCameraSpec::new("sim-0000");
        spec.incomplete_every = Some(3);
        let mut system = SimulatedSystem::new(vec![spec], SimOptions::default());
        let mut primary = system.cameras().unwrap().remove(0);
        start_primary(&mut primary);
        let flags: Vec<bool> = (0..6)
            .map(|_| primary.next_frame(None).unwrap().complete)
            .collect();
        assert_eq!(flags, vec![true, true, false, true, true, false]);
    }
}
