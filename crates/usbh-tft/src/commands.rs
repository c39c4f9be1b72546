//! SCSI Command Descriptor Blocks (CDBs), standard and vendor (`0xF5`).
//!
//! The transport treats every CDB as an opaque 16-byte (zero-padded) block;
//! it never inspects the contents. This module exists so callers don't have
//! to hand-assemble the bytes themselves.

/// A SCSI Command Block, fixed at 16 bytes with an effective length.
pub trait CommandBlock {
    /// The command descriptor block, zero-padded to 16 bytes.
    fn to_bytes(&self) -> [u8; 16];

    /// Effective length of the command (number of meaningful bytes in the CDB).
    fn len(&self) -> u8;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `TEST UNIT READY` — the keep-alive probe, and the cheapest command to
/// poll a handle's phase with when no real I/O is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestUnitReadyCommand;

impl CommandBlock for TestUnitReadyCommand {
    fn to_bytes(&self) -> [u8; 16] {
        [0u8; 16]
    }

    fn len(&self) -> u8 {
        6
    }
}

/// `REQUEST SENSE` — fetches the reason the last command failed.
#[derive(Debug, Clone, Copy)]
pub struct RequestSenseCommand {
    pub alloc_len: u8,
}

impl RequestSenseCommand {
    pub fn new(alloc_len: u8) -> Self {
        Self { alloc_len }
    }
}

impl CommandBlock for RequestSenseCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x03;
        cdb[4] = self.alloc_len;
        cdb
    }

    fn len(&self) -> u8 {
        6
    }
}

/// Minimal fixed-format sense data, as returned by [`RequestSenseCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
}

impl SenseData {
    /// Parse the fixed-format sense data response (18 bytes expected, but
    /// any buffer of at least 14 bytes carries the fields we need).
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 14 {
            return None;
        }
        Some(Self {
            sense_key: buf[2] & 0x0F,
            additional_sense_code: buf[12],
            additional_sense_code_qualifier: buf[13],
        })
    }
}

/// `INQUIRY` — standard device identification.
#[derive(Debug, Clone, Copy)]
pub struct InquiryCommand {
    pub alloc_len: u8,
}

impl InquiryCommand {
    pub fn new(alloc_len: u8) -> Self {
        Self { alloc_len }
    }
}

impl CommandBlock for InquiryCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x12;
        cdb[4] = self.alloc_len;
        cdb
    }

    fn len(&self) -> u8 {
        6
    }
}

/// Parsed standard INQUIRY response data (first 36 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryData {
    pub peripheral_device_type: u8,
    pub is_removable: bool,
    pub vendor_identification: [u8; 8],
    pub product_identification: [u8; 16],
    pub product_revision_level: [u8; 4],
}

impl InquiryData {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 36 {
            return None;
        }
        let mut vendor_identification = [0u8; 8];
        vendor_identification.copy_from_slice(&buf[8..16]);
        let mut product_identification = [0u8; 16];
        product_identification.copy_from_slice(&buf[16..32]);
        let mut product_revision_level = [0u8; 4];
        product_revision_level.copy_from_slice(&buf[32..36]);

        Some(Self {
            peripheral_device_type: buf[0] & 0x1F,
            is_removable: buf[1] & 0x80 != 0,
            vendor_identification,
            product_identification,
            product_revision_level,
        })
    }

    pub fn vendor(&self) -> String {
        String::from_utf8_lossy(&self.vendor_identification).trim().to_string()
    }

    pub fn product(&self) -> String {
        String::from_utf8_lossy(&self.product_identification).trim().to_string()
    }
}

/// Shared opcode for the whole vendor `0xF5` family driving the TFT panel.
const VENDOR_OPCODE: u8 = 0xF5;

/// Vendor command: initialize the display (`F5 01`). No data phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitDisplayCommand;

impl CommandBlock for InitDisplayCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = VENDOR_OPCODE;
        cdb[1] = 0x01;
        cdb
    }

    fn len(&self) -> u8 {
        12
    }
}

/// Vendor command: animation control (`F5 10`). One byte out in the data phase.
#[derive(Debug, Clone, Copy)]
pub struct AnimationControlCommand;

impl CommandBlock for AnimationControlCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = VENDOR_OPCODE;
        cdb[1] = 0x10;
        cdb
    }

    fn len(&self) -> u8 {
        12
    }
}

impl AnimationControlCommand {
    /// The one-byte data-phase payload: `0x01` to enable, `0x00` to disable.
    pub fn payload(enable: bool) -> [u8; 1] {
        [enable as u8]
    }
}

/// Vendor command: set mode (`F5 20`). Four bytes out in the data phase.
#[derive(Debug, Clone, Copy)]
pub struct SetModeCommand;

impl CommandBlock for SetModeCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = VENDOR_OPCODE;
        cdb[1] = 0x20;
        cdb
    }

    fn len(&self) -> u8 {
        12
    }
}

/// Vendor command: get status (`F5 30`). Eight bytes in.
#[derive(Debug, Clone, Copy)]
pub struct GetStatusCommand;

impl CommandBlock for GetStatusCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = VENDOR_OPCODE;
        cdb[1] = 0x30;
        cdb
    }

    fn len(&self) -> u8 {
        12
    }
}

/// Vendor command: clear screen (`F5 A0`). No data phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClearScreenCommand;

impl CommandBlock for ClearScreenCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = VENDOR_OPCODE;
        cdb[1] = 0xA0;
        cdb
    }

    fn len(&self) -> u8 {
        12
    }
}

/// Vendor command: display image (`F5 B0`). Data phase is a 10-byte
/// big-endian header followed by raw RGB565 pixels — both opaque to the
/// transport. Header assembly lives in `usbh-tft-cli`, not here.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayImageCommand;

impl CommandBlock for DisplayImageCommand {
    fn to_bytes(&self) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = VENDOR_OPCODE;
        cdb[1] = 0xB0;
        cdb
    }

    fn len(&self) -> u8 {
        12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_ready_is_all_zero() {
        assert_eq!(TestUnitReadyCommand.to_bytes(), [0u8; 16]);
        assert_eq!(TestUnitReadyCommand.len(), 6);
    }

    #[test]
    fn vendor_commands_share_opcode() {
        for cdb in [
            InitDisplayCommand.to_bytes(),
            AnimationControlCommand.to_bytes(),
            SetModeCommand.to_bytes(),
            GetStatusCommand.to_bytes(),
            ClearScreenCommand.to_bytes(),
            DisplayImageCommand.to_bytes(),
        ] {
            assert_eq!(cdb[0], VENDOR_OPCODE);
        }
    }

    #[test]
    fn inquiry_parses_vendor_and_product() {
        let mut buf = [0x20u8; 36];
        buf[0] = 0x00;
        buf[8..16].copy_from_slice(b"ACME    ");
        buf[16..32].copy_from_slice(b"TFT DISPLAY     ");
        let data = InquiryData::parse(&buf).unwrap();
        assert_eq!(data.vendor(), "ACME");
        assert_eq!(data.product(), "TFT DISPLAY");
    }
}
