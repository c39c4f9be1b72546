use std::time::Duration;

use rusb::{Direction as RusbDirection, GlobalContext, TransferType};

use crate::error::OpenError;

/// Which bulk endpoint an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    In,
    Out,
}

/// The canonical, OS-independent errors a gateway can report. Translation
/// of OS-level error codes into these happens here and nowhere else (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    PipeStall,
    ResourceBusy,
    Timeout,
    DeviceGone,
}

/// The only component that touches the OS USB API (§4.1).
///
/// Implemented by [`RusbGateway`] for real hardware and by a hand-rolled
/// mock (see `usbh-tft`'s `tests/` directory) for the scripted-device
/// property tests of §8 — the mock never depends on this trait living in
/// this crate's public API surface being `dyn`-friendly by accident, but it
/// is, which keeps both implementations interchangeable behind `Box<dyn
/// EndpointGateway>`.
pub trait EndpointGateway: Send {
    fn bulk_out(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, GatewayError>;
    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, GatewayError>;
    fn clear_halt(&mut self, endpoint: EndpointKind) -> Result<(), GatewayError>;
    fn reset_device(&mut self) -> Result<(), GatewayError>;
    fn is_present(&self) -> bool;

    /// Release the claimed interface and reattach any kernel driver that
    /// was detached on open. Called explicitly by `Transport::close` and
    /// defensively by `Drop`; must be idempotent.
    fn shutdown(&mut self) {}
}

/// A real USB Mass Storage interface, reached through `rusb`.
#[derive(Debug)]
pub struct RusbGateway {
    handle: rusb::DeviceHandle<GlobalContext>,
    in_address: u8,
    out_address: u8,
    interface_number: u8,
    kernel_driver_was_attached: bool,
    torn_down: bool,
}

impl RusbGateway {
    /// Find the first device matching `vendor:product`, claim its Mass
    /// Storage Bulk-Only Transport interface, and return a gateway over it.
    ///
    /// Detaches any kernel driver, sets the active configuration, finds the
    /// bulk IN/OUT endpoints on the MSC/SCSI/BOT interface, claims it, and
    /// clears any halt left over from a previous session.
    pub fn open(vendor: u16, product: u16) -> Result<Self, OpenError> {
        let devices = rusb::devices().map_err(|_| OpenError::NotFound { vendor, product })?;

        let device = devices
            .iter()
            .find(|d| match d.device_descriptor() {
                Ok(desc) => desc.vendor_id() == vendor && desc.product_id() == product,
                Err(_) => false,
            })
            .ok_or(OpenError::NotFound { vendor, product })?;

        let handle = device.open().map_err(|e| match e {
            rusb::Error::Access => OpenError::PermissionDenied,
            rusb::Error::Busy => OpenError::Busy,
            _ => OpenError::NotFound { vendor, product },
        })?;

        let kernel_driver_was_attached = handle
            .kernel_driver_active(0)
            .unwrap_or(false);
        handle.set_auto_detach_kernel_driver(true).ok();

        let config_desc = device
            .active_config_descriptor()
            .map_err(|_| OpenError::NotFound { vendor, product })?;
        handle.set_active_configuration(config_desc.number()).ok();

        let mut found = None;
        for interface in config_desc.interfaces() {
            for descriptor in interface.descriptors() {
                if descriptor.class_code() != 0x08
                    || descriptor.sub_class_code() != 0x06
                    || descriptor.protocol_code() != 0x50
                {
                    continue;
                }

                let mut in_info = None;
                let mut out_info = None;
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        RusbDirection::In => in_info = Some(endpoint.address()),
                        RusbDirection::Out => out_info = Some(endpoint.address()),
                    }
                }

                if let (Some(in_address), Some(out_address)) = (in_info, out_info) {
                    found = Some((descriptor.interface_number(), in_address, out_address));
                }
            }
        }

        let (interface_number, in_address, out_address) =
            found.ok_or(OpenError::NotFound { vendor, product })?;

        handle
            .claim_interface(interface_number)
            .map_err(|_| OpenError::Busy)?;
        handle.set_alternate_setting(interface_number, 0).ok();
        handle.clear_halt(in_address).ok();
        handle.clear_halt(out_address).ok();

        Ok(Self {
            handle,
            in_address,
            out_address,
            interface_number,
            kernel_driver_was_attached,
            torn_down: false,
        })
    }

    fn address_for(&self, endpoint: EndpointKind) -> u8 {
        match endpoint {
            EndpointKind::In => self.in_address,
            EndpointKind::Out => self.out_address,
        }
    }
}

fn translate(e: rusb::Error) -> GatewayError {
    match e {
        rusb::Error::Pipe => GatewayError::PipeStall,
        rusb::Error::Busy => GatewayError::ResourceBusy,
        rusb::Error::Timeout => GatewayError::Timeout,
        rusb::Error::NoDevice | rusb::Error::Io | rusb::Error::NotFound => GatewayError::DeviceGone,
        // The taxonomy is closed; anything else observed on the wire is
        // treated conservatively as the device having gone away (open
        // question (c) in the design notes — the device's true behavior on
        // an unrecognized fault is not documented).
        _ => GatewayError::DeviceGone,
    }
}

impl EndpointGateway for RusbGateway {
    fn bulk_out(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, GatewayError> {
        self.handle
            .write_bulk(self.out_address, bytes, timeout)
            .map_err(translate)
    }

    fn bulk_in(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, GatewayError> {
        self.handle
            .read_bulk(self.in_address, buf, timeout)
            .map_err(translate)
    }

    fn clear_halt(&mut self, endpoint: EndpointKind) -> Result<(), GatewayError> {
        self.handle
            .clear_halt(self.address_for(endpoint))
            .map_err(translate)
    }

    fn reset_device(&mut self) -> Result<(), GatewayError> {
        self.handle.reset().map_err(translate)
    }

    fn is_present(&self) -> bool {
        !self.torn_down
    }

    fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        let _ = self.handle.release_interface(self.interface_number);
        if self.kernel_driver_was_attached {
            let _ = self.handle.attach_kernel_driver(self.interface_number);
        }
        self.torn_down = true;
    }
}

impl Drop for RusbGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
