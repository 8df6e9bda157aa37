//! Device configuration unit.
//!
//! Turns an enumerated camera into an acquisition-ready device for its trigger
//! role. Every sub-step checks node access before writing and fails with a
//! [`ConfigError`] tagged by the step; on failure the camera is deinitialized.
//!
//! Exposure and frame rate are clamped silently to what the device can do.
//! A clamped exposure trades brightness for frame-rate headroom instead of
//! failing the session.

use serde::Serialize;

use super::{Camera, CameraProfile, NodeMap, PixelFormat, TriggerRole};
use crate::config::RigConfig;
use crate::error::{ConfigError, ConfigFailure, ConfigStep};

type StepResult<T> = std::result::Result<T, ConfigFailure>;

/// Values the device actually accepted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppliedSettings {
    pub role: TriggerRole,
    pub exposure_us: f64,
    pub frame_rate: f64,
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl AppliedSettings {
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Configure `camera` for `role`. The camera is left initialized on success.
pub fn configure<C: Camera + ?Sized>(
    camera: &mut C,
    identity: usize,
    role: TriggerRole,
    config: &RigConfig,
    profile: &CameraProfile,
) -> Result<AppliedSettings, ConfigError> {
    let serial = camera.serial().to_string();
    let tag = |step: ConfigStep| {
        let serial = serial.clone();
        move |failure: ConfigFailure| ConfigError {
            serial,
            step,
            failure,
        }
    };

    camera
        .init()
        .map_err(ConfigFailure::from)
        .map_err(tag(ConfigStep::Init))?;

    let result = apply_all(camera, identity, role, config, profile, &tag);
    if result.is_err() {
        if let Err(e) = camera.deinit() {
            log::debug!("camera {}: deinit after failed configuration: {}", serial, e);
        }
    }
    result
}

fn apply_all<C, F, M>(
    camera: &mut C,
    identity: usize,
    role: TriggerRole,
    config: &RigConfig,
    profile: &CameraProfile,
    tag: &F,
) -> Result<AppliedSettings, ConfigError>
where
    C: Camera + ?Sized,
    F: Fn(ConfigStep) -> M,
    M: FnOnce(ConfigFailure) -> ConfigError,
{
    let serial = camera.serial().to_string();
    log::info!(
        "[{}] configuring camera id {} as {} ({})",
        serial,
        identity,
        role,
        profile.name
    );

    write_identity(camera, identity).map_err(tag(ConfigStep::Identity))?;
    set_enum(camera, NodeMap::Device, "ExposureAuto", "Off")
        .map_err(tag(ConfigStep::ExposureAuto))?;
    let exposure_us =
        set_exposure(camera, config.exposure_us).map_err(tag(ConfigStep::ExposureTime))?;
    let frame_rate =
        set_frame_rate(camera, config.frame_rate, profile).map_err(tag(ConfigStep::FrameRate))?;

    match role {
        TriggerRole::Primary => {
            set_strobe(camera, profile).map_err(tag(ConfigStep::Strobe))?;
            set_trigger(camera, role, profile).map_err(tag(ConfigStep::Trigger))?;
        }
        TriggerRole::Secondary => {
            set_trigger(camera, role, profile).map_err(tag(ConfigStep::Trigger))?;
        }
    }

    let buffer_count =
        set_buffers(camera, config.buffer_depth).map_err(tag(ConfigStep::BufferHandling))?;
    let (width, height, pixel_format) =
        set_image_format(camera, config).map_err(tag(ConfigStep::ImageFormat))?;

    log::info!(
        "[{}] exposure {:.1} us, {:.2} fps, {} buffers, {}x{} {}",
        serial,
        exposure_us,
        frame_rate,
        buffer_count,
        width,
        height,
        pixel_format.entry_name()
    );

    Ok(AppliedSettings {
        role,
        exposure_us,
        frame_rate,
        buffer_count,
        width,
        height,
        pixel_format,
    })
}

fn require_writable<C: Camera + ?Sized>(camera: &C, map: NodeMap, name: &str) -> StepResult<()> {
    let access = camera.node_access(map, name);
    if !access.available {
        return Err(ConfigFailure::CapabilityUnavailable {
            node: name.to_string(),
        });
    }
    if !access.writable {
        return Err(ConfigFailure::NotWritable {
            node: name.to_string(),
        });
    }
    Ok(())
}

fn require_readable<C: Camera + ?Sized>(camera: &C, map: NodeMap, name: &str) -> StepResult<()> {
    let access = camera.node_access(map, name);
    if !access.available {
        return Err(ConfigFailure::CapabilityUnavailable {
            node: name.to_string(),
        });
    }
    if !access.readable {
        return Err(ConfigFailure::NotReadable {
            node: name.to_string(),
        });
    }
    Ok(())
}

fn set_enum<C: Camera + ?Sized>(
    camera: &mut C,
    map: NodeMap,
    name: &str,
    entry: &str,
) -> StepResult<()> {
    require_writable(camera, map, name)?;
    let entries = camera.enum_entries(map, name)?;
    if !entries.iter().any(|candidate| candidate == entry) {
        return Err(ConfigFailure::MissingEntry {
            node: name.to_string(),
            entry: entry.to_string(),
        });
    }
    camera.feature_enum_set(map, name, entry)?;
    Ok(())
}

fn write_identity<C: Camera + ?Sized>(camera: &mut C, identity: usize) -> StepResult<()> {
    let access = camera.node_access(NodeMap::Device, "DeviceUserID");
    if access.available && access.writable {
        camera.feature_string_set(NodeMap::Device, "DeviceUserID", &identity.to_string())?;
    } else {
        log::debug!(
            "[{}] DeviceUserID not writable, identity {} kept host side only",
            camera.serial(),
            identity
        );
    }
    Ok(())
}

fn set_exposure<C: Camera + ?Sized>(camera: &mut C, requested_us: f64) -> StepResult<f64> {
    require_writable(camera, NodeMap::Device, "ExposureTime")?;
    let max = camera.feature_float_max(NodeMap::Device, "ExposureTime")?;
    let to_set = requested_us.min(max);
    if to_set < requested_us {
        log::warn!(
            "[{}] exposure {} us exceeds device maximum, clamped to {} us",
            camera.serial(),
            requested_us,
            to_set
        );
    }
    camera.feature_float_set(NodeMap::Device, "ExposureTime", to_set)?;
    Ok(camera.feature_float(NodeMap::Device, "ExposureTime")?)
}

fn set_frame_rate<C: Camera + ?Sized>(
    camera: &mut C,
    requested: f64,
    profile: &CameraProfile,
) -> StepResult<f64> {
    if let Some(enable) = profile.frame_rate_enable_node {
        require_writable(camera, NodeMap::Device, enable)?;
        camera.feature_bool_set(NodeMap::Device, enable, true)?;
    }
    if let Some(auto) = profile.frame_rate_auto_node {
        set_enum(camera, NodeMap::Device, auto, "Off")?;
    }

    require_writable(camera, NodeMap::Device, "AcquisitionFrameRate")?;
    let max = camera.feature_float_max(NodeMap::Device, "AcquisitionFrameRate")?;
    camera.feature_float_set(NodeMap::Device, "AcquisitionFrameRate", max)?;

    // The achievable rate depends on the exposure that was just applied.
    let achievable = match profile.resulting_frame_rate_node {
        Some(node) => {
            require_readable(camera, NodeMap::Device, node)?;
            camera.feature_float(NodeMap::Device, node)?
        }
        None => max,
    };
    let to_set = requested.min(achievable);
    if to_set < requested {
        log::warn!(
            "[{}] frame rate {} exceeds achievable {:.2}, clamped",
            camera.serial(),
            requested,
            achievable
        );
    }
    camera.feature_float_set(NodeMap::Device, "AcquisitionFrameRate", to_set)?;
    Ok(camera.feature_float(NodeMap::Device, "AcquisitionFrameRate")?)
}

fn set_strobe<C: Camera + ?Sized>(camera: &mut C, profile: &CameraProfile) -> StepResult<()> {
    set_enum(camera, NodeMap::Device, "LineSelector", profile.strobe_line)?;
    set_enum(camera, NodeMap::Device, "LineMode", "Output")?;
    set_enum(camera, NodeMap::Device, "LineSource", "ExposureActive")?;
    Ok(())
}

fn set_trigger<C: Camera + ?Sized>(
    camera: &mut C,
    role: TriggerRole,
    profile: &CameraProfile,
) -> StepResult<()> {
    // Trigger source can only change while trigger mode is off.
    set_enum(camera, NodeMap::Device, "TriggerMode", "Off")?;
    match role {
        TriggerRole::Primary => {
            set_enum(camera, NodeMap::Device, "TriggerSource", "Software")?;
        }
        TriggerRole::Secondary => {
            set_enum(camera, NodeMap::Device, "TriggerSource", profile.trigger_line)?;
            set_enum(camera, NodeMap::Device, "TriggerMode", "On")?;
        }
    }
    Ok(())
}

fn set_buffers<C: Camera + ?Sized>(camera: &mut C, requested: u32) -> StepResult<u32> {
    set_enum(camera, NodeMap::Stream, "StreamBufferCountMode", "Manual")?;
    require_writable(camera, NodeMap::Stream, "StreamBufferCountManual")?;
    let max = camera.feature_int_max(NodeMap::Stream, "StreamBufferCountManual")?;
    let to_set = i64::from(requested).min(max);
    camera.feature_int_set(NodeMap::Stream, "StreamBufferCountManual", to_set)?;
    // Full buffers evict the oldest frame.
    set_enum(
        camera,
        NodeMap::Stream,
        "StreamBufferHandlingMode",
        "OldestFirstOverwrite",
    )?;
    let applied = camera.feature_int(NodeMap::Stream, "StreamBufferCountManual")?;
    Ok(u32::try_from(applied).unwrap_or(requested))
}

fn set_image_format<C: Camera + ?Sized>(
    camera: &mut C,
    config: &RigConfig,
) -> StepResult<(u32, u32, PixelFormat)> {
    let width = set_dimension(camera, "Width", config.resize_factor)?;
    let height = set_dimension(camera, "Height", config.resize_factor)?;
    let pixel_format = config.pixel_format();
    set_enum(
        camera,
        NodeMap::Device,
        "PixelFormat",
        pixel_format.entry_name(),
    )?;
    Ok((width, height, pixel_format))
}

/// Divide the sensor maximum by the resize factor. A read-only dimension keeps
/// its current value.
fn set_dimension<C: Camera + ?Sized>(camera: &mut C, name: &str, factor: u32) -> StepResult<u32> {
    let access = camera.node_access(NodeMap::Device, name);
    if access.available && access.writable {
        let max = camera.feature_int_max(NodeMap::Device, name)?;
        let to_set = (max / i64::from(factor.max(1))).max(1);
        camera.feature_int_set(NodeMap::Device, name, to_set)?;
    } else {
        require_readable(camera, NodeMap::Device, name)?;
        log::warn!("[{}] {} not writable, keeping current value", camera.serial(), name);
    }
    let value = camera.feature_int(NodeMap::Device, name)?;
    u32::try_from(value).map_err(|_| {
        ConfigFailure::Device(crate::error::DeviceError::Backend(format!(
            "{} out of range: {}",
            name, value
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::profile::{BLACKFLY_S, CHAMELEON3};
    use crate::device::sim::{SimCameraSpec, SimOptions, SimulatedSystem};
    use crate::device::CameraSystem;

    fn single_camera(spec: SimCameraSpec) -> crate::device::sim::SimCamera {
        let mut system = SimulatedSystem::new(vec![spec], SimOptions::default());
        system.cameras().unwrap().remove(0)
    }

    fn rig_config() -> RigConfig {
        RigConfig::new("sim-0000", ".")
    }

    #[test]
    fn exposure_is_clamped_to_device_maximum() {
        let mut spec = SimCameraSpec::new("sim-0000");
        spec.max_exposure_us = 8000.0;
        let mut camera = single_camera(spec);
        let mut cfg = rig_config();
        cfg.exposure_us = 50_000.0;

        let applied = configure(&mut camera, 0, TriggerRole::Primary, &cfg, &BLACKFLY_S).unwrap();
        assert_eq!(applied.exposure_us, 8000.0);
    }

    #[test]
    fn frame_rate_is_clamped_to_achievable_rate() {
        let mut spec = SimCameraSpec::new("sim-0000");
        spec.max_frame_rate = 500.0;
        let mut camera = single_camera(spec);
        let mut cfg = rig_config();
        // 4 ms exposure caps the sensor at 250 fps.
        cfg.exposure_us = 4000.0;
        cfg.frame_rate = 400.0;

        let applied = configure(&mut camera, 0, TriggerRole::Primary, &cfg, &BLACKFLY_S).unwrap();
        assert_eq!(applied.frame_rate, 250.0);
    }

    #[test]
    fn frame_rate_below_limit_is_kept() {
        let mut camera = single_camera(SimCameraSpec::new("sim-0000"));
        let mut cfg = rig_config();
        cfg.frame_rate = 30.0;
        let applied = configure(&mut camera, 0, TriggerRole::Primary, &cfg, &BLACKFLY_S).unwrap();
        assert_eq!(applied.frame_rate, 30.0);
    }

    #[test]
    fn chameleon_profile_uses_frame_rate_maximum() {
        let mut spec = SimCameraSpec::new("sim-0000");
        spec.model = "Chameleon3 CM3-U3-13Y3M".to_string();
        spec.max_frame_rate = 120.0;
        let mut camera = single_camera(spec);
        let mut cfg = rig_config();
        cfg.exposure_us = 1000.0;
        cfg.frame_rate = 200.0;

        let applied = configure(&mut camera, 0, TriggerRole::Primary, &cfg, &CHAMELEON3).unwrap();
        assert_eq!(applied.frame_rate, 120.0);
    }

    #[test]
    fn buffer_depth_is_clamped_and_image_resized() {
        let mut spec = SimCameraSpec::new("sim-0000");
        spec.max_buffers = 20;
        spec.width = 64;
        spec.height = 48;
        let mut camera = single_camera(spec);
        let mut cfg = rig_config();
        cfg.buffer_depth = 200;
        cfg.resize_factor = 2;
        cfg.color = true;

        let applied =
            configure(&mut camera, 1, TriggerRole::Secondary, &cfg, &BLACKFLY_S).unwrap();
        assert_eq!(applied.buffer_count, 20);
        assert_eq!((applied.width, applied.height), (32, 24));
        assert_eq!(applied.pixel_format, PixelFormat::BayerRG8);
        assert_eq!(applied.frame_size(), 32 * 24);
        assert_eq!(
            camera
                .feature_enum(NodeMap::Device, "TriggerSource")
                .unwrap(),
            "Line3"
        );
        assert_eq!(
            camera.feature_enum(NodeMap::Device, "TriggerMode").unwrap(),
            "On"
        );
    }

    #[test]
    fn primary_drives_strobe_line() {
        let mut camera = single_camera(SimCameraSpec::new("sim-0000"));
        configure(&mut camera, 0, TriggerRole::Primary, &rig_config(), &BLACKFLY_S).unwrap();
        assert_eq!(
            camera.feature_enum(NodeMap::Device, "LineSource").unwrap(),
            "ExposureActive"
        );
        assert_eq!(
            camera.feature_enum(NodeMap::Device, "TriggerMode").unwrap(),
            "Off"
        );
        assert_eq!(
            camera
                .feature_enum(NodeMap::Device, "TriggerSource")
                .unwrap(),
            "Software"
        );
    }

    #[test]
    fn missing_node_fails_with_tagged_step() {
        let mut spec = SimCameraSpec::new("sim-0000");
        spec.missing_nodes
            .push((NodeMap::Device, "ExposureAuto".to_string()));
        let mut camera = single_camera(spec);

        let err =
            configure(&mut camera, 0, TriggerRole::Primary, &rig_config(), &BLACKFLY_S).unwrap_err();
        assert_eq!(err.step, ConfigStep::ExposureAuto);
        assert_eq!(
            err.failure,
            ConfigFailure::CapabilityUnavailable {
                node: "ExposureAuto".to_string()
            }
        );
        assert!(!camera.is_initialized());
    }

    #[test]
    fn secondary_overflow_keeps_newest_frames() {
        let mut system = SimulatedSystem::with_cameras(2, SimOptions::default());
        let mut cameras = system.cameras().unwrap();
        let mut secondary = cameras.pop().unwrap();
        let mut primary = cameras.pop().unwrap();
        let mut cfg = rig_config();
        cfg.buffer_depth = 2;
        configure(&mut primary, 0, TriggerRole::Primary, &cfg, &BLACKFLY_S).unwrap();
        let applied =
            configure(&mut secondary, 1, TriggerRole::Secondary, &cfg, &BLACKFLY_S).unwrap();
        assert_eq!(applied.buffer_count, 2);
        assert_eq!(
            secondary
                .feature_enum(NodeMap::Stream, "StreamBufferHandlingMode")
                .unwrap(),
            "OldestFirstOverwrite"
        );

        secondary.begin_acquisition().unwrap();
        primary.begin_acquisition().unwrap();
        let timeout = Some(std::time::Duration::from_millis(50));
        for _ in 0..5 {
            primary.next_frame(timeout).unwrap();
        }
        assert_eq!(secondary.dropped_frames(), 3);
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 3);
        assert_eq!(secondary.next_frame(timeout).unwrap().frame_id, 4);
    }
}
