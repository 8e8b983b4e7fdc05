//! Wire format for active message packets.
//!
//! Packet format: `[length:4][checksum:4][handler:1][user:1][flags:1][reserved:1][offset:4][size:4][payload:N]`
//!
//! - **length**: Total packet size including header (little-endian u32)
//! - **checksum**: CRC32C of everything after the checksum field
//! - **handler**: Protocol-internal handler (short / medium-long / long reply)
//! - **user**: Handler id the receiver dispatches to
//! - **flags**: Payload placement for medium-long, ack tier for long reply
//! - **offset**: Slice offset in the receiver's segment (rendezvous only)
//! - **size**: Payload length, inline or in the segment
//! - **payload**: Inline bytes (medium only)

use bytes::{BufMut, Bytes, BytesMut};

/// Header size: 4 + 4 + 1 + 1 + 1 + 1 + 4 + 4 = 20 bytes.
pub const HEADER_SIZE: usize = 20;

/// Largest payload an inline packet may carry (1MB).
pub const MAX_INLINE_PAYLOAD: usize = 1024 * 1024;

/// Medium-long flag: payload already sits in the receiver's segment.
const FLAG_IN_SEGMENT: u8 = 0x01;

const NO_PAYLOAD: &[u8] = &[];

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the packet.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Inline payload exceeds maximum allowed size.
    #[error("packet too large: {size} bytes (max {MAX_INLINE_PAYLOAD})")]
    PacketTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid packet length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Protocol handler byte names no known handler.
    #[error("unknown protocol handler {id}")]
    UnknownProtocolHandler {
        /// The unknown handler byte.
        id: u8,
    },

    /// Header fields contradict each other.
    #[error("malformed packet: {reason}")]
    Malformed {
        /// What was inconsistent.
        reason: &'static str,
    },
}

/// Protocol-internal handlers, registered by every node at bootstrap.
///
/// User handlers are multiplexed over these: the user id travels in the
/// header and is dispatched by the receiving transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolHandler {
    /// Header-only control signal.
    Short = 200,
    /// Inline or rendezvous payload.
    MedLong = 201,
    /// Completion acknowledgment sent back by the receiver.
    LongReply = 202,
}

impl ProtocolHandler {
    /// Wire byte for this handler.
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Parse the wire byte.
    pub fn from_id(id: u8) -> Result<Self, WireError> {
        match id {
            200 => Ok(ProtocolHandler::Short),
            201 => Ok(ProtocolHandler::MedLong),
            202 => Ok(ProtocolHandler::LongReply),
            other => Err(WireError::UnknownProtocolHandler { id: other }),
        }
    }
}

/// Which transfer a completion acknowledgment releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckTier {
    /// An oversized inline envelope can be recycled.
    Inline = 1,
    /// The rendezvous slice is free again.
    Rendezvous = 2,
}

impl AckTier {
    fn from_flags(flags: u8) -> Result<Self, WireError> {
        match flags {
            1 => Ok(AckTier::Inline),
            2 => Ok(AckTier::Rendezvous),
            _ => Err(WireError::Malformed {
                reason: "unknown acknowledgment tier",
            }),
        }
    }
}

/// Fixed-size header that precedes every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet size including header.
    pub length: u32,
    /// CRC32C over the remaining header fields and the payload.
    pub checksum: u32,
    /// Protocol handler byte.
    pub handler: u8,
    /// User handler id.
    pub user_handler: u8,
    /// Placement or ack-tier flags.
    pub flags: u8,
    /// Offset in the receiver's segment.
    pub offset: u32,
    /// Payload length.
    pub size: u32,
}

impl PacketHeader {
    /// Serialize header into buffer (must be at least HEADER_SIZE bytes).
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than HEADER_SIZE.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8] = self.handler;
        buf[9] = self.user_handler;
        buf[10] = self.flags;
        buf[11] = 0;
        buf[12..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.size.to_le_bytes());
    }

    /// Deserialize header from buffer.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if buffer is smaller than HEADER_SIZE.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        Ok(Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            checksum: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            handler: buf[8],
            user_handler: buf[9],
            flags: buf[10],
            offset: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            size: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}

/// Decoded active message packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Control tier: handler id only.
    Short {
        /// User handler id.
        handler: u8,
    },
    /// Inline tier: payload travels with the packet.
    Medium {
        /// User handler id.
        handler: u8,
        /// Inline payload.
        payload: Bytes,
    },
    /// Rendezvous tier: payload already written into the receiver's segment.
    Long {
        /// User handler id.
        handler: u8,
        /// Slice offset in the receiver's segment.
        offset: u32,
        /// Payload length.
        size: u32,
    },
    /// Completion acknowledgment.
    Ack {
        /// Transfer being released.
        tier: AckTier,
    },
}

impl Packet {
    /// Serialize the packet.
    ///
    /// # Errors
    ///
    /// Returns `PacketTooLarge` if an inline payload exceeds MAX_INLINE_PAYLOAD.
    ///
    /// # Examples
    ///
    /// ```
    /// use aml::wire::Packet;
    ///
    /// let packet = Packet::Medium { handler: 4, payload: "hello".into() };
    /// let bytes = packet.encode().expect("encode");
    /// assert_eq!(Packet::decode(bytes).expect("decode"), packet);
    /// ```
    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            Packet::Short { handler } => {
                encode_parts(ProtocolHandler::Short, *handler, 0, 0, 0, NO_PAYLOAD)
            }
            Packet::Medium { handler, payload } => Self::encode_medium(*handler, payload),
            Packet::Long {
                handler,
                offset,
                size,
            } => encode_parts(
                ProtocolHandler::MedLong,
                *handler,
                FLAG_IN_SEGMENT,
                *offset,
                *size,
                NO_PAYLOAD,
            ),
            Packet::Ack { tier } => {
                encode_parts(ProtocolHandler::LongReply, 0, *tier as u8, 0, 0, NO_PAYLOAD)
            }
        }
    }

    /// Serialize an inline packet straight from a borrowed payload.
    ///
    /// Same bytes as encoding [`Packet::Medium`], without first copying the
    /// payload into a `Bytes`.
    ///
    /// # Errors
    ///
    /// Returns `PacketTooLarge` if the payload exceeds MAX_INLINE_PAYLOAD.
    pub fn encode_medium(handler: u8, payload: &[u8]) -> Result<Bytes, WireError> {
        if payload.len() > MAX_INLINE_PAYLOAD {
            return Err(WireError::PacketTooLarge {
                size: payload.len(),
            });
        }
        encode_parts(
            ProtocolHandler::MedLong,
            handler,
            0,
            0,
            payload.len() as u32,
            payload,
        )
    }

    /// Deserialize and validate a packet.
    ///
    /// The inline payload of a medium packet shares `data`'s allocation.
    ///
    /// # Errors
    ///
    /// - `InsufficientData`: Not enough bytes for header or payload
    /// - `InvalidLength`: Length field is malformed
    /// - `ChecksumMismatch`: Data was corrupted
    /// - `UnknownProtocolHandler` / `Malformed`: Fields are inconsistent
    pub fn decode(data: Bytes) -> Result<Self, WireError> {
        let header = PacketHeader::deserialize(&data)?;

        if (header.length as usize) < HEADER_SIZE {
            return Err(WireError::InvalidLength {
                length: header.length,
            });
        }

        let expected_len = header.length as usize;
        if data.len() < expected_len {
            return Err(WireError::InsufficientData {
                needed: expected_len,
                have: data.len(),
            });
        }

        let computed = compute_checksum(&data[8..expected_len]);
        if computed != header.checksum {
            return Err(WireError::ChecksumMismatch {
                expected: header.checksum,
                actual: computed,
            });
        }

        let inline_len = expected_len - HEADER_SIZE;
        match ProtocolHandler::from_id(header.handler)? {
            ProtocolHandler::Short => {
                if inline_len != 0 || header.size != 0 {
                    return Err(WireError::Malformed {
                        reason: "short packet carries a payload",
                    });
                }
                Ok(Packet::Short {
                    handler: header.user_handler,
                })
            }
            ProtocolHandler::MedLong if header.flags & FLAG_IN_SEGMENT != 0 => {
                if inline_len != 0 {
                    return Err(WireError::Malformed {
                        reason: "rendezvous packet carries inline bytes",
                    });
                }
                Ok(Packet::Long {
                    handler: header.user_handler,
                    offset: header.offset,
                    size: header.size,
                })
            }
            ProtocolHandler::MedLong => {
                if inline_len != header.size as usize {
                    return Err(WireError::Malformed {
                        reason: "inline size disagrees with packet length",
                    });
                }
                Ok(Packet::Medium {
                    handler: header.user_handler,
                    payload: data.slice(HEADER_SIZE..expected_len),
                })
            }
            ProtocolHandler::LongReply => Ok(Packet::Ack {
                tier: AckTier::from_flags(header.flags)?,
            }),
        }
    }
}

fn encode_parts(
    protocol: ProtocolHandler,
    user_handler: u8,
    flags: u8,
    offset: u32,
    size: u32,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    let total_length = HEADER_SIZE + payload.len();
    let mut header = PacketHeader {
        length: total_length as u32,
        checksum: 0,
        handler: protocol.id(),
        user_handler,
        flags,
        offset,
        size,
    };

    let mut buf = BytesMut::with_capacity(total_length);
    buf.resize(HEADER_SIZE, 0);
    header.serialize_into(&mut buf[..HEADER_SIZE]);
    buf.put_slice(payload);

    header.checksum = compute_checksum(&buf[8..]);
    buf[4..8].copy_from_slice(&header.checksum.to_le_bytes());

    Ok(buf.freeze())
}

/// Compute CRC32C checksum over everything after the checksum field.
fn compute_checksum(covered: &[u8]) -> u32 {
    crc32c::crc32c(covered)
}
