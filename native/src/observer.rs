// Single-slot observer registration for engine events.

use arc_swap::ArcSwapOption;
use log::debug;
use std::sync::Arc;

use crate::ipc::protocol::{
    ButtonInfo, MessageKind, PatientInfo, PowerInfo, ProbeInfo, ProcessedImage, RawCapture, Rect,
};
use crate::transfer::{RawRangePackage, ResourceHandle};

/// Application-supplied sink for every decoded event and error.
///
/// Callbacks run on the engine loop, one at a time, in inbound arrival
/// order. A slow callback delays every later event.
#[allow(unused_variables)]
pub trait Observer: Send + Sync {
    fn on_connected(&self, connected: bool) {}
    fn on_error(&self, message: &str) {}

    fn on_freeze_changed(&self, frozen: bool) {}
    fn on_freeze_returned(&self, frozen: bool) {}
    fn on_depth_changed(&self, depth_cm: f64) {}
    fn on_depth_returned(&self, depth_cm: f64) {}
    fn on_gain_changed(&self, gain: f64) {}
    fn on_gain_returned(&self, gain: f64) {}

    fn on_new_processed_image(&self, image: &ProcessedImage) {}
    fn on_button_event(&self, button: &ButtonInfo) {}
    fn on_scan_area_changed(&self, area: &Rect) {}
    fn on_scan_area_returned(&self, area: &Rect) {}
    fn on_probe_info(&self, info: &ProbeInfo) {}
    fn on_patient_info(&self, info: &PatientInfo) {}
    fn on_license_changed(&self, licensed: bool) {}
    fn on_power_event(&self, power: &PowerInfo) {}

    /// Generic status reply for a command without a dedicated reply kind.
    /// `kind` is `None` when the tag matches no known command.
    fn on_return_status(&self, kind: Option<MessageKind>, status: i32) {}

    fn on_raw_capture_available(&self, capture: &RawCapture) {}
    /// Push transfer reached a terminal state. On success the handle points at
    /// the copied file.
    fn on_raw_capture_copied(&self, capture: &RawCapture, result: Result<&ResourceHandle, &str>) {}
    fn on_raw_range_progress(&self, percent: i32) {}
    fn on_raw_range_returned(&self, result: Result<&RawRangePackage, &str>) {}
}

/// Holds at most one observer; the last registration wins.
///
/// Swapping the observer does not replay anything: events already delivered
/// to the previous observer, and any correlation its callbacks kept for
/// outstanding requests, stay with it.
#[derive(Default)]
pub struct ObserverSlot {
    current: ArcSwapOption<Box<dyn Observer>>,
}

impl ObserverSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `observer`, returning true if it replaced another one.
    pub fn set(&self, observer: Box<dyn Observer>) -> bool {
        self.current.swap(Some(Arc::new(observer))).is_some()
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn is_set(&self) -> bool {
        self.current.load().is_some()
    }

    pub(crate) fn notify(&self, callback: impl FnOnce(&dyn Observer)) {
        match self.current.load_full() {
            Some(observer) => callback(&**observer),
            None => debug!("[DISPATCH] No observer registered, event dropped"),
        }
    }
}
