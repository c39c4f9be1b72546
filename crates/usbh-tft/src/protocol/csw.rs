/// Magic signature identifying a valid CSW (`'USBS'` little-endian).
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Wire length of a Command Status Wrapper, in bytes.
pub const CSW_LEN: usize = 13;

/// The one-byte status field of a CSW.
///
/// `PhaseError` ("Condition Met", per the design notes) is undocumented for
/// this device and only ever observed during the Animation phase; it is
/// kept distinct from `Failure` so callers can still see it in statistics
/// even though the transport treats both the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    Success,
    Failure,
    PhaseError,
    /// Reserved values with no assigned meaning on the wire.
    Reserved(u8),
}

impl From<u8> for CswStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => CswStatus::Success,
            1 => CswStatus::Failure,
            2 => CswStatus::PhaseError,
            other => CswStatus::Reserved(other),
        }
    }
}

impl CswStatus {
    pub fn is_success(self) -> bool {
        matches!(self, CswStatus::Success)
    }

    /// Raw wire value, for statistics and logging.
    pub fn raw(self) -> u8 {
        match self {
            CswStatus::Success => 0,
            CswStatus::Failure => 1,
            CswStatus::PhaseError => 2,
            CswStatus::Reserved(v) => v,
        }
    }
}

/// USB Mass Storage Bulk-Only Transport **Command Status Wrapper (CSW)**.
///
/// The 13-byte device-to-host envelope that concludes every CBW exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CswStatus,
}

/// Why a candidate CSW buffer failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CswDecodeError {
    #[error("expected a 13-byte CSW, got {0} bytes")]
    WrongLength(usize),
    #[error("bad CSW signature {0:#010x}")]
    BadSignature(u32),
}

impl Csw {
    /// Decode a 13-byte buffer into a [`Csw`].
    ///
    /// Fails with [`CswDecodeError::WrongLength`] if `buf` is not exactly
    /// [`CSW_LEN`] bytes, or [`CswDecodeError::BadSignature`] if the
    /// signature field is not `0x53425355`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, CswDecodeError> {
        if buf.len() != CSW_LEN {
            return Err(CswDecodeError::WrongLength(buf.len()));
        }

        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CSW_SIGNATURE {
            return Err(CswDecodeError::BadSignature(signature));
        }

        let tag = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let data_residue = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let status = CswStatus::from(buf[12]);

        Ok(Self {
            tag,
            data_residue,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(tag: u32, residue: u32, status: u8) -> [u8; CSW_LEN] {
        let mut buf = [0u8; CSW_LEN];
        buf[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&tag.to_le_bytes());
        buf[8..12].copy_from_slice(&residue.to_le_bytes());
        buf[12] = status;
        buf
    }

    #[test]
    fn decodes_a_well_formed_csw() {
        let buf = encode(7, 0, 0);
        let csw = Csw::from_bytes(&buf).unwrap();
        assert_eq!(csw.tag, 7);
        assert_eq!(csw.data_residue, 0);
        assert!(csw.status.is_success());
    }

    #[test]
    fn rejects_wrong_length() {
        let err = Csw::from_bytes(&[0u8; 12]).unwrap_err();
        assert_eq!(err, CswDecodeError::WrongLength(12));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buf = encode(7, 0, 0);
        buf[0] = 0;
        let err = Csw::from_bytes(&buf).unwrap_err();
        assert!(matches!(err, CswDecodeError::BadSignature(_)));
    }
}
