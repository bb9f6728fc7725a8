// Routes each inbound envelope to exactly one handler.

use log::{debug, warn};
use std::sync::Arc;

use crate::correlator::Resolution;
use crate::engine::Engine;
use crate::ipc::protocol::{Envelope, Event};

impl Engine {
    pub(crate) fn dispatch(&mut self, envelope: Envelope) {
        let event = match Event::decode(&envelope) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("[DISPATCH] Ignoring message kind {}", envelope.what);
                return;
            }
            Err(e) => {
                warn!("[DISPATCH] {}", e);
                self.report(e);
                return;
            }
        };

        debug!("[DISPATCH] {}", event.kind());
        let observer = Arc::clone(&self.observer);

        match event {
            Event::ReturnStatus { tag, status } => match self.correlator.resolve(tag, status) {
                Resolution::Registration { status } => self.session.on_registration_status(status),
                Resolution::Informational { kind, status } => {
                    observer.notify(|o| o.on_return_status(kind, status))
                }
            },
            Event::FreezeChanged(frozen) => observer.notify(|o| o.on_freeze_changed(frozen)),
            Event::FreezeReturned(frozen) => observer.notify(|o| o.on_freeze_returned(frozen)),
            Event::DepthChanged(cm) => observer.notify(|o| o.on_depth_changed(cm)),
            Event::DepthReturned(cm) => observer.notify(|o| o.on_depth_returned(cm)),
            Event::GainChanged(gain) => observer.notify(|o| o.on_gain_changed(gain)),
            Event::GainReturned(gain) => observer.notify(|o| o.on_gain_returned(gain)),
            Event::NewProcessedImage(image) => observer.notify(|o| o.on_new_processed_image(&image)),
            Event::ButtonEvent(button) => observer.notify(|o| o.on_button_event(&button)),
            Event::ScanAreaChanged(area) => observer.notify(|o| o.on_scan_area_changed(&area)),
            Event::ScanAreaReturned(area) => observer.notify(|o| o.on_scan_area_returned(&area)),
            Event::ProbeInfoReturned(info) => observer.notify(|o| o.on_probe_info(&info)),
            Event::PatientInfoReturned(info) => observer.notify(|o| o.on_patient_info(&info)),
            Event::PowerEvent(power) => observer.notify(|o| o.on_power_event(&power)),
            Event::NoLicense => {
                if !self.session.license_revoked() {
                    self.report("No license");
                }
                self.session.revoke_license();
            }
            Event::LicenseChanged(licensed) => {
                if !licensed {
                    self.session.revoke_license();
                }
                observer.notify(|o| o.on_license_changed(licensed));
            }
            Event::Error(message) => self.report(format!("Service error: {}", message)),
            Event::RawCaptureAvailable(capture) => {
                self.transfers.on_available(&mut self.session, capture)
            }
            Event::RawCaptureCopied { capture_id, error } => {
                self.transfers.on_copied(&capture_id, error)
            }
            Event::RawRangeProgress(percent) => self.transfers.on_progress(percent),
            Event::RawRangeReturned(reply) => self.transfers.on_range_returned(reply),
        }
    }
}
