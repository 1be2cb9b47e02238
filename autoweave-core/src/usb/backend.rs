//! USB backend abstraction and the libusb hotplug implementation.
//!
//! The observer only sees [`RawHotplugEvent`]s coming out of a backend, so
//! tests can script attach/detach sequences without hardware. The
//! production backend wraps `rusb` hotplug callbacks plus a dedicated
//! event-pump thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use autoweave_model::DeviceAction;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverErrorKind {
    BackendUnavailable,
    DescriptorReadFailed,
    Permission,
}

impl std::fmt::Display for ObserverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObserverErrorKind::BackendUnavailable => "backend unavailable",
            ObserverErrorKind::DescriptorReadFailed => "descriptor read failed",
            ObserverErrorKind::Permission => "permission",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ObserverError {
    pub kind: ObserverErrorKind,
    pub message: String,
}

impl ObserverError {
    pub fn new(kind: ObserverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_rusb(err: rusb::Error, context: &str) -> Self {
        let kind = match err {
            rusb::Error::Access => ObserverErrorKind::Permission,
            _ => ObserverErrorKind::DescriptorReadFailed,
        };
        Self::new(kind, format!("{context}: {err}"))
    }
}

/// Where a device sits on the host, as reported by the notification itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceLocation {
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub port_path: String,
}

/// What the kernel told us, before descriptor extraction.
#[derive(Debug, Clone)]
pub struct RawHotplugEvent {
    pub action: DeviceAction,
    pub location: DeviceLocation,
}

/// Slow-path descriptor fields, read off the notification thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDescriptors {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
}

/// Running backend subscription. Dropping it (or calling `stop`) detaches
/// the hotplug registration; no events are delivered afterwards.
pub struct BackendTask {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for BackendTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTask")
            .field("stopped", &self.stop.is_none())
            .finish()
    }
}

impl BackendTask {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for BackendTask {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// Host USB subsystem seam.
pub trait UsbBackend: Send + Sync + 'static {
    /// Subscribes to attach/detach notifications. Implementations emit one
    /// synthetic attach per device already present, then live events, into
    /// `tx` until the returned task is stopped.
    fn start(
        &self,
        tx: mpsc::Sender<RawHotplugEvent>,
    ) -> Result<BackendTask, ObserverError>;

    /// Blocking descriptor extraction for a located device.
    fn read_descriptors(
        &self,
        location: &DeviceLocation,
    ) -> Result<DeviceDescriptors, ObserverError>;
}

/// libusb-backed production implementation.
#[derive(Debug)]
pub struct RusbBackend {
    context: rusb::Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self, ObserverError> {
        if !rusb::has_hotplug() {
            return Err(ObserverError::new(
                ObserverErrorKind::BackendUnavailable,
                "libusb on this host lacks hotplug support",
            ));
        }
        let context = rusb::Context::new().map_err(|err| {
            ObserverError::new(
                ObserverErrorKind::BackendUnavailable,
                format!("libusb context: {err}"),
            )
        })?;
        Ok(Self { context })
    }

    fn locate(
        &self,
        location: &DeviceLocation,
    ) -> Result<rusb::Device<rusb::Context>, ObserverError> {
        use rusb::UsbContext;
        let devices = self
            .context
            .devices()
            .map_err(|err| ObserverError::from_rusb(err, "device list"))?;
        devices
            .iter()
            .find(|device| {
                device.bus_number() == location.bus_number
                    && device.address() == location.device_address
            })
            .ok_or_else(|| {
                ObserverError::new(
                    ObserverErrorKind::DescriptorReadFailed,
                    format!(
                        "device at bus {} address {} is gone",
                        location.bus_number, location.device_address
                    ),
                )
            })
    }
}

fn port_path(device: &rusb::Device<rusb::Context>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let chain = ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(".");
            format!("{}-{}", device.bus_number(), chain)
        }
        _ => device.bus_number().to_string(),
    }
}

fn location_of(
    device: &rusb::Device<rusb::Context>,
) -> Result<DeviceLocation, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    Ok(DeviceLocation {
        bus_number: device.bus_number(),
        device_address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        port_path: port_path(device),
    })
}

/// Root hubs carry no useful hot-plug information.
fn is_root_hub(descriptor: &rusb::DeviceDescriptor) -> bool {
    descriptor.vendor_id() == 0x1d6b && descriptor.class_code() == 9
}

struct HotplugForwarder {
    tx: mpsc::Sender<RawHotplugEvent>,
}

impl HotplugForwarder {
    fn forward(&mut self, action: DeviceAction, device: rusb::Device<rusb::Context>) {
        let Ok(descriptor) = device.device_descriptor() else {
            warn!(
                bus = device.bus_number(),
                address = device.address(),
                "dropping hotplug notification without readable descriptor"
            );
            return;
        };
        if is_root_hub(&descriptor) {
            return;
        }
        let Ok(location) = location_of(&device) else {
            return;
        };
        // The pump thread is ours; blocking here simply delays further USB
        // notifications, which is the desired backpressure.
        if self
            .tx
            .blocking_send(RawHotplugEvent { action, location })
            .is_err()
        {
            debug!("observer channel closed, discarding hotplug event");
        }
    }
}

impl rusb::Hotplug<rusb::Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
        self.forward(DeviceAction::Attach, device);
    }

    fn device_left(&mut self, device: rusb::Device<rusb::Context>) {
        self.forward(DeviceAction::Detach, device);
    }
}

impl UsbBackend for RusbBackend {
    fn start(
        &self,
        tx: mpsc::Sender<RawHotplugEvent>,
    ) -> Result<BackendTask, ObserverError> {
        use rusb::UsbContext;

        // Synthetic attach per already-present device.
        let devices = self
            .context
            .devices()
            .map_err(|err| ObserverError::from_rusb(err, "enumeration"))?;
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if is_root_hub(&descriptor) {
                continue;
            }
            if let Ok(location) = location_of(&device) {
                let _ = tx.blocking_send(RawHotplugEvent {
                    action: DeviceAction::Attach,
                    location,
                });
            }
        }

        let registration = rusb::HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { tx }))
            .map_err(|err| {
                ObserverError::new(
                    ObserverErrorKind::BackendUnavailable,
                    format!("hotplug registration: {err}"),
                )
            })?;

        let running = Arc::new(AtomicBool::new(true));
        let pump_flag = Arc::clone(&running);
        let pump_context = self.context.clone();
        let pump = std::thread::Builder::new()
            .name("usb-event-pump".to_string())
            .spawn(move || {
                while pump_flag.load(Ordering::Relaxed) {
                    if let Err(err) = pump_context
                        .handle_events(Some(Duration::from_millis(250)))
                    {
                        warn!(error = %err, "libusb event pump error");
                    }
                }
                // Keep the registration alive for the pump's lifetime.
                drop(registration);
            })
            .map_err(|err| {
                ObserverError::new(
                    ObserverErrorKind::BackendUnavailable,
                    format!("event pump thread: {err}"),
                )
            })?;

        Ok(BackendTask::new(move || {
            running.store(false, Ordering::Relaxed);
            let _ = pump.join();
        }))
    }

    fn read_descriptors(
        &self,
        location: &DeviceLocation,
    ) -> Result<DeviceDescriptors, ObserverError> {
        let device = self.locate(location)?;
        let descriptor = device
            .device_descriptor()
            .map_err(|err| ObserverError::from_rusb(err, "descriptor"))?;

        let mut out = DeviceDescriptors {
            device_class: descriptor.class_code(),
            device_subclass: descriptor.sub_class_code(),
            device_protocol: descriptor.protocol_code(),
            ..DeviceDescriptors::default()
        };

        let timeout = Duration::from_millis(200);
        let handle = device
            .open()
            .map_err(|err| ObserverError::from_rusb(err, "open"))?;
        let languages = handle
            .read_languages(timeout)
            .map_err(|err| ObserverError::from_rusb(err, "languages"))?;
        let Some(language) = languages.first().copied() else {
            return Ok(out);
        };

        out.manufacturer = handle
            .read_manufacturer_string(language, &descriptor, timeout)
            .ok();
        out.product = handle
            .read_product_string(language, &descriptor, timeout)
            .ok();
        out.serial_number = handle
            .read_serial_number_string(language, &descriptor, timeout)
            .ok();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_task_runs_stop_once() {
        use std::sync::atomic::AtomicUsize;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = BackendTask::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backend_task_stops_on_drop() {
        use std::sync::atomic::AtomicUsize;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        drop(BackendTask::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn access_errors_map_to_permission() {
        let err = ObserverError::from_rusb(rusb::Error::Access, "open");
        assert_eq!(err.kind, ObserverErrorKind::Permission);
        let err = ObserverError::from_rusb(rusb::Error::Timeout, "open");
        assert_eq!(err.kind, ObserverErrorKind::DescriptorReadFailed);
    }
}
