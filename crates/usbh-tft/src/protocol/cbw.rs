use crate::commands::CommandBlock;

/// Magic signature identifying a valid CBW (`'USBC'` little-endian).
pub const CBW_SIGNATURE: u32 = 0x4342_5355;

/// Wire length of a Command Block Wrapper, in bytes.
pub const CBW_LEN: usize = 31;

/// Direction of the data phase following a CBW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device → host transfer (e.g. INQUIRY, a vendor "get status" command).
    In,
    /// Host → device transfer (e.g. a vendor "display image" command).
    Out,
    /// No data phase at all (e.g. TEST UNIT READY).
    ///
    /// The direction bit is meaningless when `dCBWDataTransferLength` is
    /// zero; by convention we encode it the same as [`Direction::Out`].
    None,
}

/// USB Mass Storage Bulk-Only Transport **Command Block Wrapper (CBW)**.
///
/// A CBW is the 31-byte structure sent from host to device over the
/// bulk-OUT endpoint. It wraps a SCSI command descriptor block (CDB)
/// together with the transfer length, data direction, and the host-supplied
/// tag that the matching CSW will echo back.
#[derive(Debug, Clone, Copy)]
#[allow(non_snake_case)]
pub struct Cbw {
    pub dCBWSignature: u32,
    pub dCBWTag: u32,
    pub dCBWDataTransferLength: u32,
    pub bmCBWFlags: u8,
    pub bCBWLUN: u8,
    pub bCBWCBLength: u8,
    pub CBWCB: [u8; 16],
}

impl Cbw {
    /// Construct a new CBW for a given SCSI command.
    ///
    /// `tag` is the host-assigned identifier the CSW will echo back;
    /// `data_len` is the number of bytes expected in the data phase (`0` for
    /// [`Direction::None`]); `cmd` is the opaque command descriptor block.
    pub fn new<T: CommandBlock>(tag: u32, data_len: u32, direction: Direction, cmd: &T) -> Self {
        let cdb = cmd.to_bytes();

        Self {
            dCBWSignature: CBW_SIGNATURE,
            dCBWTag: tag,
            dCBWDataTransferLength: data_len,
            bmCBWFlags: match direction {
                Direction::In => 0x80,
                Direction::Out | Direction::None => 0x00,
            },
            bCBWLUN: 0,
            bCBWCBLength: cmd.len(),
            CBWCB: cdb,
        }
    }

    /// Serialize into exactly 31 bytes (the CBW wire format, little-endian scalars).
    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut buf = [0u8; CBW_LEN];

        buf[0..4].copy_from_slice(&self.dCBWSignature.to_le_bytes());
        buf[4..8].copy_from_slice(&self.dCBWTag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.dCBWDataTransferLength.to_le_bytes());
        buf[12] = self.bmCBWFlags;
        buf[13] = self.bCBWLUN;
        buf[14] = self.bCBWCBLength;
        buf[15..31].copy_from_slice(&self.CBWCB);

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::TestUnitReadyCommand;

    #[test]
    fn round_trips_fixed_fields() {
        let cbw = Cbw::new(42, 36, Direction::In, &TestUnitReadyCommand);
        let bytes = cbw.to_bytes();

        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), CBW_SIGNATURE);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 42);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 36);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0);
        assert_eq!(bytes[14], TestUnitReadyCommand.len());
    }

    #[test]
    fn none_direction_encodes_like_out() {
        let cbw = Cbw::new(1, 0, Direction::None, &TestUnitReadyCommand);
        assert_eq!(cbw.bmCBWFlags, 0x00);
    }
}
