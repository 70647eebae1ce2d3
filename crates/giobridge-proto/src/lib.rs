#![no_std]

use byteorder::{ByteOrder, LittleEndian};
use core::{convert::TryFrom, fmt};

/// log2 of the device sector size used for block/byte conversion.
pub const SECTOR_SHIFT: u32 = 9;
/// Device sector size in bytes.
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;
/// First block number whose byte offset no longer fits in a 32-bit `lo` field.
pub const MAX_BLOCK: u32 = 1 << (32 - SECTOR_SHIFT);
/// Upper bound on the opaque transfer parameter block carried by a [`ControlRequest`].
pub const MAX_PARAMS_SIZE: usize = 64;
/// Number of bytes in the fixed header of an encoded [`ControlRequest`].
pub const CONTROL_REQUEST_HEADER_LEN: usize = 24;
/// Number of bytes in an encoded [`ControlRequest`] (header plus padded params).
pub const CONTROL_REQUEST_LEN: usize = CONTROL_REQUEST_HEADER_LEN + MAX_PARAMS_SIZE;
/// Number of bytes in an encoded [`ControlReply`].
pub const CONTROL_REPLY_LEN: usize = 24;

/// Errors surfaced while decoding or building control structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the layout expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Operation code zero is reserved.
    InvalidOp(u8),
    /// Direction byte carried bits outside READ|WRITE.
    InvalidDirection(u8),
    /// Parameter block exceeds [`MAX_PARAMS_SIZE`].
    ParamsTooLarge { len: usize },
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid structure length {actual}, expected {expected}")
            }
            ProtoError::InvalidOp(op) => write!(f, "invalid operation code {op:#x}"),
            ProtoError::InvalidDirection(dir) => write!(f, "invalid direction bits {dir:#x}"),
            ProtoError::ParamsTooLarge { len } => {
                write!(f, "parameter block of {len} bytes exceeds {MAX_PARAMS_SIZE}")
            }
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

/// Result alias for encode/decode operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// 64-bit device byte offset kept as two 32-bit halves.
///
/// Provider transfer parameters carry offsets as `offset_lo`/`offset_hi` pairs, so all
/// cursor arithmetic happens on the halves and propagates the lo→hi carry explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceOffset {
    pub hi: u32,
    pub lo: u32,
}

impl DeviceOffset {
    pub const ZERO: DeviceOffset = DeviceOffset { hi: 0, lo: 0 };

    pub const fn new(hi: u32, lo: u32) -> Self {
        Self { hi, lo }
    }

    /// Convert a sector number plus intra-sector offset into a byte offset.
    pub fn encode(block: u32, block_offset: u16) -> Self {
        let (base, hi) = if block >= MAX_BLOCK {
            // Bits shifted past 32 are accounted for by `hi`.
            ((block - MAX_BLOCK) << SECTOR_SHIFT, block / MAX_BLOCK)
        } else {
            (block << SECTOR_SHIFT, 0)
        };
        let (lo, carry) = base.overflowing_add(u32::from(block_offset));
        Self {
            hi: hi + u32::from(carry),
            lo,
        }
    }

    /// Inverse of [`DeviceOffset::encode`] for offsets below `2^41` bytes.
    pub fn decode(self) -> (u32, u16) {
        let bytes = self.as_bytes();
        let block = (bytes >> SECTOR_SHIFT) as u32;
        let block_offset = (bytes & u64::from(SECTOR_SIZE - 1)) as u16;
        (block, block_offset)
    }

    pub const fn from_bytes(bytes: u64) -> Self {
        Self {
            hi: (bytes >> 32) as u32,
            lo: bytes as u32,
        }
    }

    pub const fn as_bytes(self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }

    /// Move the cursor forward by `delta_lo` bytes, carrying into `hi` on wrap.
    pub fn advance(self, delta_lo: u32) -> Self {
        let (lo, carry) = self.lo.overflowing_add(delta_lo);
        Self {
            hi: self.hi.wrapping_add(u32::from(carry)),
            lo,
        }
    }
}

impl fmt::Display for DeviceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}:{:08x}", self.hi, self.lo)
    }
}

/// Provider operation code.
///
/// Codes below [`GioOp::CUSTOM_BASE`] are defined here; anything above is passed through
/// to the provider untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GioOp(u8);

impl GioOp {
    pub const READ: GioOp = GioOp(0x01);
    pub const WRITE: GioOp = GioOp(0x02);
    pub const DIAG_ENABLE: GioOp = GioOp(0x10);
    pub const DIAG_DISABLE: GioOp = GioOp(0x11);
    pub const DIAG_RUN_TEST: GioOp = GioOp(0x12);
    pub const CUSTOM_BASE: u8 = 0x80;

    pub fn custom(code: u8) -> Result<Self> {
        if code < Self::CUSTOM_BASE {
            return Err(ProtoError::InvalidValue("custom op codes start at 0x80"));
        }
        Ok(Self(code))
    }

    pub const fn code(self) -> u8 {
        self.0
    }

    /// True for the canonical READ/WRITE ops that carry a device offset.
    pub fn is_transfer(self) -> bool {
        self == Self::READ || self == Self::WRITE
    }

    pub fn is_diagnostic(self) -> bool {
        matches!(self, Self::DIAG_ENABLE | Self::DIAG_DISABLE | Self::DIAG_RUN_TEST)
    }
}

impl TryFrom<u8> for GioOp {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Err(ProtoError::InvalidOp(value)),
            other => Ok(Self(other)),
        }
    }
}

impl From<GioOp> for u8 {
    fn from(op: GioOp) -> Self {
        op.0
    }
}

impl fmt::Display for GioOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::READ => f.write_str("read"),
            Self::WRITE => f.write_str("write"),
            Self::DIAG_ENABLE => f.write_str("diag_enable"),
            Self::DIAG_DISABLE => f.write_str("diag_disable"),
            Self::DIAG_RUN_TEST => f.write_str("diag_run_test"),
            Self(code) => write!(f, "op{code:#04x}"),
        }
    }
}

/// Data direction bits of a request, relative to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Direction(u8);

impl Direction {
    pub const NONE: Direction = Direction(0);
    /// Data flows from the device into the caller's buffer.
    pub const READ: Direction = Direction(1 << 0);
    /// Data flows from the caller's buffer to the device.
    pub const WRITE: Direction = Direction(1 << 1);
    const MASK: u8 = Self::READ.0 | Self::WRITE.0;

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Direction) -> Direction {
        Direction(self.0 | other.0)
    }

    pub const fn reads(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub const fn writes(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub const fn has_data(self) -> bool {
        self.0 & Self::MASK != 0
    }

    /// Both READ and WRITE set: the request contradicts itself.
    pub const fn is_conflicting(self) -> bool {
        self.reads() && self.writes()
    }
}

impl TryFrom<u8> for Direction {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        if value & !Self::MASK != 0 {
            return Err(ProtoError::InvalidDirection(value));
        }
        Ok(Self(value))
    }
}

/// Completion status reported by the provider or synthesised by the mapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const OK: Status = Status(0);
    pub const NOT_SUPPORTED: Status = Status(1);
    pub const NOT_UNDERSTOOD: Status = Status(2);
    pub const INVALID_STATE: Status = Status(3);
    pub const ABORTED: Status = Status(5);
    pub const TIMEOUT: Status = Status(6);
    pub const BUSY: Status = Status(7);
    pub const RESOURCE_UNAVAILABLE: Status = Status(8);
    pub const HW_PROBLEM: Status = Status(9);
    pub const DATA_UNDERRUN: Status = Status(11);
    pub const DATA_ERROR: Status = Status(13);
    pub const CANNOT_BIND: Status = Status(15);

    pub const fn is_ok(self) -> bool {
        self.0 == Self::OK.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "ok",
            Self::NOT_SUPPORTED => "not_supported",
            Self::NOT_UNDERSTOOD => "not_understood",
            Self::INVALID_STATE => "invalid_state",
            Self::ABORTED => "aborted",
            Self::TIMEOUT => "timeout",
            Self::BUSY => "busy",
            Self::RESOURCE_UNAVAILABLE => "resource_unavailable",
            Self::HW_PROBLEM => "hw_problem",
            Self::DATA_UNDERRUN => "data_underrun",
            Self::DATA_ERROR => "data_error",
            Self::CANNOT_BIND => "cannot_bind",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "status{}", self.0),
        }
    }
}

/// Token returned for an asynchronous control request still owned by the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncHandle {
    pub id: u32,
    pub context: u16,
}

/// Opaque transfer parameters, bounded by [`MAX_PARAMS_SIZE`].
pub type Params = heapless::Vec<u8, MAX_PARAMS_SIZE>;

/// Host control call: one request that may become several provider transfers.
///
/// Field order is part of the encoded layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub op: GioOp,
    pub direction: Direction,
    /// Starting device byte offset for READ/WRITE; opaque to other ops.
    pub address: u64,
    pub requested_len: u32,
    pub is_async: bool,
    pub params: Params,
}

impl ControlRequest {
    pub fn new(op: GioOp, direction: Direction, address: u64, requested_len: u32) -> Self {
        Self {
            op,
            direction,
            address,
            requested_len,
            is_async: false,
            params: Params::new(),
        }
    }

    pub fn read(address: u64, requested_len: u32) -> Self {
        Self::new(GioOp::READ, Direction::READ, address, requested_len)
    }

    pub fn write(address: u64, requested_len: u32) -> Self {
        Self::new(GioOp::WRITE, Direction::WRITE, address, requested_len)
    }

    pub fn asynchronous(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_params(mut self, params: &[u8]) -> Result<Self> {
        self.params = Params::from_slice(params)
            .map_err(|_| ProtoError::ParamsTooLarge { len: params.len() })?;
        Ok(self)
    }

    pub fn encode(&self) -> [u8; CONTROL_REQUEST_LEN] {
        let mut buf = [0u8; CONTROL_REQUEST_LEN];
        buf[0] = u8::from(self.op);
        buf[1] = self.direction.bits();
        buf[2] = u8::from(self.is_async);
        buf[3] = self.params.len() as u8;
        LittleEndian::write_u32(&mut buf[4..8], self.requested_len);
        LittleEndian::write_u64(&mut buf[8..16], self.address);
        let params_end = CONTROL_REQUEST_HEADER_LEN + self.params.len();
        buf[CONTROL_REQUEST_HEADER_LEN..params_end].copy_from_slice(&self.params);
        buf
    }

    pub fn decode(bytes: [u8; CONTROL_REQUEST_LEN]) -> Result<Self> {
        let op = GioOp::try_from(bytes[0])?;
        let direction = Direction::try_from(bytes[1])?;
        let is_async = match bytes[2] {
            0 => false,
            1 => true,
            _ => return Err(ProtoError::InvalidValue("async flag must be 0 or 1")),
        };
        let params_len = usize::from(bytes[3]);
        if params_len > MAX_PARAMS_SIZE {
            return Err(ProtoError::ParamsTooLarge { len: params_len });
        }
        if bytes[16..CONTROL_REQUEST_HEADER_LEN].iter().any(|b| *b != 0) {
            return Err(ProtoError::InvalidValue("reserved header bytes must be zero"));
        }
        let requested_len = LittleEndian::read_u32(&bytes[4..8]);
        let address = LittleEndian::read_u64(&bytes[8..16]);
        let params_end = CONTROL_REQUEST_HEADER_LEN + params_len;
        let params = Params::from_slice(&bytes[CONTROL_REQUEST_HEADER_LEN..params_end])
            .map_err(|_| ProtoError::ParamsTooLarge { len: params_len })?;
        Ok(Self {
            op,
            direction,
            address,
            requested_len,
            is_async,
            params,
        })
    }
}

impl TryFrom<&[u8]> for ControlRequest {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != CONTROL_REQUEST_LEN {
            return Err(ProtoError::InvalidLength {
                expected: CONTROL_REQUEST_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; CONTROL_REQUEST_LEN];
        buf.copy_from_slice(value);
        Self::decode(buf)
    }
}

/// Result of a host control call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlReply {
    pub transferred_len: u32,
    pub status: Status,
    pub async_handle: Option<AsyncHandle>,
}

impl ControlReply {
    pub const fn complete(transferred_len: u32, status: Status) -> Self {
        Self {
            transferred_len,
            status,
            async_handle: None,
        }
    }

    pub const fn pending(handle: AsyncHandle) -> Self {
        Self {
            transferred_len: 0,
            status: Status::OK,
            async_handle: Some(handle),
        }
    }

    pub fn encode(self) -> [u8; CONTROL_REPLY_LEN] {
        let mut buf = [0u8; CONTROL_REPLY_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.transferred_len);
        LittleEndian::write_u32(&mut buf[4..8], self.status.0);
        if let Some(handle) = self.async_handle {
            LittleEndian::write_u32(&mut buf[8..12], 1);
            LittleEndian::write_u32(&mut buf[12..16], handle.id);
            LittleEndian::write_u16(&mut buf[16..18], handle.context);
        }
        buf
    }

    pub fn decode(bytes: [u8; CONTROL_REPLY_LEN]) -> Result<Self> {
        let transferred_len = LittleEndian::read_u32(&bytes[0..4]);
        let status = Status(LittleEndian::read_u32(&bytes[4..8]));
        let async_handle = match LittleEndian::read_u32(&bytes[8..12]) {
            0 => None,
            1 => Some(AsyncHandle {
                id: LittleEndian::read_u32(&bytes[12..16]),
                context: LittleEndian::read_u16(&bytes[16..18]),
            }),
            _ => return Err(ProtoError::InvalidValue("async handle flag must be 0 or 1")),
        };
        if bytes[18..].iter().any(|b| *b != 0) {
            return Err(ProtoError::InvalidValue("reserved reply bytes must be zero"));
        }
        Ok(Self {
            transferred_len,
            status,
            async_handle,
        })
    }
}

impl TryFrom<&[u8]> for ControlReply {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != CONTROL_REPLY_LEN {
            return Err(ProtoError::InvalidLength {
                expected: CONTROL_REPLY_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; CONTROL_REPLY_LEN];
        buf.copy_from_slice(value);
        Self::decode(buf)
    }
}
