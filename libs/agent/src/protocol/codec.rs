//! Per-command payload decoding and encoding.
//!
//! Everything here is a pure function (or a small cursor type) over borrowed
//! byte slices: decoders read a typed payload out of the request data,
//! encoders write a typed payload into the response buffer. No partial
//! effects on error: an encoder either fits entirely or reports `Overflow`
//! and leaves `data_length` untouched.

use crate::software_id::SOFTWARE_ID;
use crate::ADDR_SIZE;

use super::{Response, CONNECT_MAGIC, DISCOVER_CHALLENGE_SIZE, DISCOVER_MAGIC};

/// Wire size of one `{addr, size}` block descriptor.
pub const BLOCK_DESCRIPTOR_SIZE: usize = ADDR_SIZE + 2;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The payload does not match the command grammar.
    InvalidRequest,
    /// The encoded payload would not fit the response buffer.
    Overflow,
}

impl From<CodecError> for super::ResponseCode {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidRequest => Self::InvalidRequest,
            CodecError::Overflow => Self::Overflow,
        }
    }
}

/// Communication parameters reported by `CommControl::GetParams`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommParams {
    pub rx_buffer_size: u16,
    pub tx_buffer_size: u16,
    pub max_bitrate_bps: u32,
    pub heartbeat_timeout_us: u32,
    pub rx_timeout_us: u32,
    pub addr_size: u8,
}

pub const COMM_PARAMS_SIZE: usize = 2 + 2 + 4 + 4 + 4 + 1;

// ---------------------------------------------------------------------------
// GetInfo

pub fn encode_protocol_version(
    major: u8,
    minor: u8,
    response: &mut Response<'_>,
) -> Result<(), CodecError> {
    if response.data.len() < 2 {
        return Err(CodecError::Overflow);
    }
    response.data[0] = major;
    response.data[1] = minor;
    response.data_length = 2;
    Ok(())
}

pub fn encode_software_id(response: &mut Response<'_>) -> Result<(), CodecError> {
    if response.data.len() < SOFTWARE_ID.len() {
        return Err(CodecError::Overflow);
    }
    response.data[..SOFTWARE_ID.len()].copy_from_slice(&SOFTWARE_ID);
    response.data_length = SOFTWARE_ID.len() as u16;
    Ok(())
}

// ---------------------------------------------------------------------------
// CommControl

/// Validates a Discover payload and returns the host's challenge bytes.
pub fn decode_discover(data: &[u8]) -> Result<[u8; DISCOVER_CHALLENGE_SIZE], CodecError> {
    if data.len() != DISCOVER_MAGIC.len() + DISCOVER_CHALLENGE_SIZE {
        return Err(CodecError::InvalidRequest);
    }
    if data[..DISCOVER_MAGIC.len()] != DISCOVER_MAGIC {
        return Err(CodecError::InvalidRequest);
    }
    let mut challenge = [0u8; DISCOVER_CHALLENGE_SIZE];
    challenge.copy_from_slice(&data[DISCOVER_MAGIC.len()..]);
    Ok(challenge)
}

/// Writes the Discover response: the magic followed by the bitwise complement
/// of each challenge byte.
pub fn encode_discover_response(
    challenge: &[u8; DISCOVER_CHALLENGE_SIZE],
    response: &mut Response<'_>,
) -> Result<(), CodecError> {
    let total = DISCOVER_MAGIC.len() + DISCOVER_CHALLENGE_SIZE;
    if response.data.len() < total {
        return Err(CodecError::Overflow);
    }
    response.data[..DISCOVER_MAGIC.len()].copy_from_slice(&DISCOVER_MAGIC);
    for (out, &byte) in response.data[DISCOVER_MAGIC.len()..total]
        .iter_mut()
        .zip(challenge.iter())
    {
        *out = !byte;
    }
    response.data_length = total as u16;
    Ok(())
}

pub fn decode_heartbeat(data: &[u8]) -> Result<u32, CodecError> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| CodecError::InvalidRequest)?;
    Ok(u32::from_be_bytes(bytes))
}

pub fn encode_heartbeat_response(
    challenge_response: u32,
    response: &mut Response<'_>,
) -> Result<(), CodecError> {
    if response.data.len() < 4 {
        return Err(CodecError::Overflow);
    }
    response.data[..4].copy_from_slice(&challenge_response.to_be_bytes());
    response.data_length = 4;
    Ok(())
}

pub fn encode_comm_params(
    params: &CommParams,
    response: &mut Response<'_>,
) -> Result<(), CodecError> {
    if response.data.len() < COMM_PARAMS_SIZE {
        return Err(CodecError::Overflow);
    }
    response.data[0..2].copy_from_slice(&params.rx_buffer_size.to_be_bytes());
    response.data[2..4].copy_from_slice(&params.tx_buffer_size.to_be_bytes());
    response.data[4..8].copy_from_slice(&params.max_bitrate_bps.to_be_bytes());
    response.data[8..12].copy_from_slice(&params.heartbeat_timeout_us.to_be_bytes());
    response.data[12..16].copy_from_slice(&params.rx_timeout_us.to_be_bytes());
    response.data[16] = params.addr_size;
    response.data_length = COMM_PARAMS_SIZE as u16;
    Ok(())
}

pub fn decode_connect(data: &[u8]) -> Result<(), CodecError> {
    if data != CONNECT_MAGIC {
        return Err(CodecError::InvalidRequest);
    }
    Ok(())
}

pub fn encode_connect_response(
    session_id: u32,
    response: &mut Response<'_>,
) -> Result<(), CodecError> {
    let total = CONNECT_MAGIC.len() + 4;
    if response.data.len() < total {
        return Err(CodecError::Overflow);
    }
    response.data[..CONNECT_MAGIC.len()].copy_from_slice(&CONNECT_MAGIC);
    response.data[CONNECT_MAGIC.len()..total].copy_from_slice(&session_id.to_be_bytes());
    response.data_length = total as u16;
    Ok(())
}

pub fn decode_disconnect(data: &[u8]) -> Result<u32, CodecError> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| CodecError::InvalidRequest)?;
    Ok(u32::from_be_bytes(bytes))
}

// ---------------------------------------------------------------------------
// MemoryControl

/// One `{addr, size}` descriptor out of a Read request.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub addr: usize,
    pub size: u16,
}

/// One `{addr, size, data}` element out of a Write request.
#[derive(Clone, Copy, Debug)]
pub struct WriteBlock<'a> {
    pub addr: usize,
    pub size: u16,
    pub data: &'a [u8],
}

/// Iterator over the block descriptors of a Read request.
///
/// The payload must be a nonzero exact multiple of
/// [`BLOCK_DESCRIPTOR_SIZE`]; the whole request is rejected otherwise. `Copy`, so the dispatcher can walk
/// the blocks once for the guard check and once for execution.
#[derive(Clone, Copy, Debug)]
pub struct ReadRequestParser<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ReadRequestParser<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, CodecError> {
        if data.is_empty() || data.len() % BLOCK_DESCRIPTOR_SIZE != 0 {
            return Err(CodecError::InvalidRequest);
        }
        Ok(Self { data, offset: 0 })
    }
}

impl<'a> Iterator for ReadRequestParser<'a> {
    type Item = BlockDescriptor;

    fn next(&mut self) -> Option<BlockDescriptor> {
        if self.offset >= self.data.len() {
            return None;
        }
        let block = read_descriptor(&self.data[self.offset..]);
        self.offset += BLOCK_DESCRIPTOR_SIZE;
        Some(block)
    }
}

/// Iterator over the blocks of a Write request.
///
/// Construction walks the whole payload once and rejects it unless a
/// nonempty sequence of `{addr, size, data[size]}` elements consumes `data`
/// exactly; iteration afterwards is infallible.
#[derive(Clone, Copy, Debug)]
pub struct WriteRequestParser<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WriteRequestParser<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, CodecError> {
        if data.is_empty() {
            return Err(CodecError::InvalidRequest);
        }
        let mut offset = 0usize;
        while offset < data.len() {
            let remaining = data.len() - offset;
            if remaining < BLOCK_DESCRIPTOR_SIZE {
                return Err(CodecError::InvalidRequest);
            }
            let block = read_descriptor(&data[offset..]);
            offset += BLOCK_DESCRIPTOR_SIZE;
            if data.len() - offset < block.size as usize {
                return Err(CodecError::InvalidRequest);
            }
            offset += block.size as usize;
        }
        Ok(Self { data, offset: 0 })
    }
}

impl<'a> Iterator for WriteRequestParser<'a> {
    type Item = WriteBlock<'a>;

    fn next(&mut self) -> Option<WriteBlock<'a>> {
        if self.offset >= self.data.len() {
            return None;
        }
        let block = read_descriptor(&self.data[self.offset..]);
        let data_start = self.offset + BLOCK_DESCRIPTOR_SIZE;
        let data_end = data_start + block.size as usize;
        self.offset = data_end;
        Some(WriteBlock {
            addr: block.addr,
            size: block.size,
            data: &self.data[data_start..data_end],
        })
    }
}

fn read_descriptor(data: &[u8]) -> BlockDescriptor {
    let mut addr = 0usize;
    for &byte in &data[..ADDR_SIZE] {
        addr = (addr << 8) | byte as usize;
    }
    let size = u16::from_be_bytes([data[ADDR_SIZE], data[ADDR_SIZE + 1]]);
    BlockDescriptor { addr, size }
}

fn write_descriptor(buf: &mut [u8], addr: usize, size: u16) {
    buf[..ADDR_SIZE].copy_from_slice(&addr.to_be_bytes());
    buf[ADDR_SIZE..BLOCK_DESCRIPTOR_SIZE].copy_from_slice(&size.to_be_bytes());
}

/// Appends `{addr, size, data[size]}` elements to a Read response.
///
/// Capacity is checked before each block is appended; on `Overflow` nothing
/// further is written and the caller abandons the response.
pub struct ReadResponseEncoder<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl<'a> ReadResponseEncoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    /// Reserves one block and returns the slot its data must be copied into.
    pub fn block(&mut self, addr: usize, size: u16) -> Result<&mut [u8], CodecError> {
        let needed = BLOCK_DESCRIPTOR_SIZE + size as usize;
        if self.buf.len() - self.cursor < needed {
            return Err(CodecError::Overflow);
        }
        write_descriptor(&mut self.buf[self.cursor..], addr, size);
        let data_start = self.cursor + BLOCK_DESCRIPTOR_SIZE;
        self.cursor += needed;
        Ok(&mut self.buf[data_start..data_start + size as usize])
    }

    pub fn finish(self) -> u16 {
        self.cursor as u16
    }
}

/// Appends `{addr, size}` acknowledgements to a Write response.
pub struct WriteResponseEncoder<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl<'a> WriteResponseEncoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    pub fn block(&mut self, addr: usize, size: u16) -> Result<(), CodecError> {
        if self.buf.len() - self.cursor < BLOCK_DESCRIPTOR_SIZE {
            return Err(CodecError::Overflow);
        }
        write_descriptor(&mut self.buf[self.cursor..], addr, size);
        self.cursor += BLOCK_DESCRIPTOR_SIZE;
        Ok(())
    }

    pub fn finish(self) -> u16 {
        self.cursor as u16
    }
}

#[cfg(test)]
mod tests {
    use super::super::ResponseCode;
    use super::*;
    use std::vec::Vec;

    fn response_over<'a>(buf: &'a mut [u8]) -> Response<'a> {
        Response {
            command_id: 0,
            subfunction_id: 0,
            data_length: 0,
            data: buf,
        }
    }

    #[test]
    fn discover_roundtrip() {
        let challenge = [0x11, 0x22, 0x33, 0x44];
        let mut payload = Vec::new();
        payload.extend_from_slice(&DISCOVER_MAGIC);
        payload.extend_from_slice(&challenge);
        assert_eq!(decode_discover(&payload), Ok(challenge));

        let mut buf = [0u8; 64];
        let mut response = response_over(&mut buf);
        encode_discover_response(&challenge, &mut response).unwrap();
        assert_eq!(response.data_length, 20);
        assert_eq!(&response.data[..16], &DISCOVER_MAGIC);
        assert_eq!(&response.data[16..20], &[0xEE, 0xDD, 0xCC, 0xBB]);
    }

    #[test]
    fn discover_rejects_bad_magic_and_length() {
        let mut payload = [0u8; 20];
        payload[..16].copy_from_slice(&DISCOVER_MAGIC);
        payload[0] ^= 0x01;
        assert_eq!(decode_discover(&payload), Err(CodecError::InvalidRequest));
        assert_eq!(
            decode_discover(&DISCOVER_MAGIC),
            Err(CodecError::InvalidRequest)
        );
    }

    #[test]
    fn heartbeat_payloads() {
        assert_eq!(decode_heartbeat(&[0x12, 0x34, 0x56, 0x78]), Ok(0x12345678));
        assert_eq!(
            decode_heartbeat(&[0x12, 0x34]),
            Err(CodecError::InvalidRequest)
        );

        let mut buf = [0u8; 8];
        let mut response = response_over(&mut buf);
        encode_heartbeat_response(!0x12345678u32, &mut response).unwrap();
        assert_eq!(response.data_length, 4);
        assert_eq!(&response.data[..4], &(!0x12345678u32).to_be_bytes());
    }

    #[test]
    fn comm_params_layout() {
        let params = CommParams {
            rx_buffer_size: 256,
            tx_buffer_size: 128,
            max_bitrate_bps: 115_200,
            heartbeat_timeout_us: 5_000_000,
            rx_timeout_us: 50_000,
            addr_size: ADDR_SIZE as u8,
        };
        let mut buf = [0u8; 32];
        let mut response = response_over(&mut buf);
        encode_comm_params(&params, &mut response).unwrap();
        assert_eq!(response.data_length as usize, COMM_PARAMS_SIZE);
        assert_eq!(&response.data[0..2], &[0x01, 0x00]);
        assert_eq!(&response.data[2..4], &[0x00, 0x80]);
        assert_eq!(&response.data[4..8], &115_200u32.to_be_bytes());
        assert_eq!(&response.data[8..12], &5_000_000u32.to_be_bytes());
        assert_eq!(&response.data[12..16], &50_000u32.to_be_bytes());
        assert_eq!(response.data[16], ADDR_SIZE as u8);
    }

    #[test]
    fn connect_payloads() {
        assert!(decode_connect(&CONNECT_MAGIC).is_ok());
        assert_eq!(decode_connect(&[0; 4]), Err(CodecError::InvalidRequest));
        assert_eq!(
            decode_connect(&CONNECT_MAGIC[..3]),
            Err(CodecError::InvalidRequest)
        );

        let mut buf = [0u8; 16];
        let mut response = response_over(&mut buf);
        encode_connect_response(0xDEAD_BEEF, &mut response).unwrap();
        assert_eq!(response.data_length, 8);
        assert_eq!(&response.data[..4], &CONNECT_MAGIC);
        assert_eq!(&response.data[4..8], &0xDEAD_BEEFu32.to_be_bytes());
    }

    fn read_request(blocks: &[(usize, u16)]) -> Vec<u8> {
        let mut payload = Vec::new();
        for &(addr, size) in blocks {
            payload.extend_from_slice(&addr.to_be_bytes());
            payload.extend_from_slice(&size.to_be_bytes());
        }
        payload
    }

    #[test]
    fn read_parser_walks_blocks() {
        let payload = read_request(&[(0x1000, 4), (0x2000, 0x1234)]);
        let parser = ReadRequestParser::new(&payload).unwrap();
        let blocks: Vec<_> = parser.collect();
        assert_eq!(
            blocks,
            &[
                BlockDescriptor {
                    addr: 0x1000,
                    size: 4
                },
                BlockDescriptor {
                    addr: 0x2000,
                    size: 0x1234
                },
            ]
        );
    }

    #[test]
    fn read_parser_rejects_partial_descriptors() {
        for len in 1..32usize {
            if len % BLOCK_DESCRIPTOR_SIZE == 0 {
                continue;
            }
            let payload = std::vec![0xA5u8; len];
            assert_eq!(
                ReadRequestParser::new(&payload).unwrap_err(),
                CodecError::InvalidRequest,
                "length {len} must be rejected"
            );
        }
    }

    #[test]
    fn parsers_reject_empty_payload() {
        assert!(matches!(
            ReadRequestParser::new(&[]),
            Err(CodecError::InvalidRequest)
        ));
        assert!(matches!(
            WriteRequestParser::new(&[]),
            Err(CodecError::InvalidRequest)
        ));
    }

    fn write_request(blocks: &[(usize, &[u8])]) -> Vec<u8> {
        let mut payload = Vec::new();
        for &(addr, data) in blocks {
            payload.extend_from_slice(&addr.to_be_bytes());
            payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
            payload.extend_from_slice(data);
        }
        payload
    }

    #[test]
    fn write_parser_walks_blocks() {
        let payload = write_request(&[(0x1000, &[1, 2, 3]), (0x2000, &[])]);
        let parser = WriteRequestParser::new(&payload).unwrap();
        let blocks: Vec<_> = parser.collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].addr, 0x1000);
        assert_eq!(blocks[0].size, 3);
        assert_eq!(blocks[0].data, &[1, 2, 3]);
        assert_eq!(blocks[1].addr, 0x2000);
        assert_eq!(blocks[1].size, 0);
    }

    #[test]
    fn write_parser_rejects_residue_and_truncation() {
        // Truncated data: descriptor promises 4 bytes, only 2 present.
        let mut payload = write_request(&[(0x1000, &[1, 2, 3, 4])]);
        payload.truncate(payload.len() - 2);
        assert_eq!(
            WriteRequestParser::new(&payload).unwrap_err(),
            CodecError::InvalidRequest
        );

        // Residue: a stray byte after the last block.
        let mut payload = write_request(&[(0x1000, &[1, 2])]);
        payload.push(0xFF);
        assert_eq!(
            WriteRequestParser::new(&payload).unwrap_err(),
            CodecError::InvalidRequest
        );
    }

    #[test]
    fn read_encoder_appends_until_full() {
        let mut buf = [0u8; BLOCK_DESCRIPTOR_SIZE * 2 + 5];
        let mut encoder = ReadResponseEncoder::new(&mut buf);
        let slot = encoder.block(0x1000, 3).unwrap();
        slot.copy_from_slice(&[0x11, 0x22, 0x33]);
        encoder.block(0x2000, 2).unwrap();
        // A third block no longer fits even with no data.
        assert_eq!(encoder.block(0x3000, 0), Err(CodecError::Overflow));
        let len = encoder.finish();
        assert_eq!(len as usize, BLOCK_DESCRIPTOR_SIZE * 2 + 5);
        assert_eq!(&buf[..ADDR_SIZE], &0x1000usize.to_be_bytes());
        assert_eq!(&buf[ADDR_SIZE..ADDR_SIZE + 2], &[0x00, 0x03]);
        assert_eq!(
            &buf[BLOCK_DESCRIPTOR_SIZE..BLOCK_DESCRIPTOR_SIZE + 3],
            &[0x11, 0x22, 0x33]
        );
    }

    #[test]
    fn write_encoder_echoes_descriptors() {
        let mut buf = [0u8; BLOCK_DESCRIPTOR_SIZE];
        let mut encoder = WriteResponseEncoder::new(&mut buf);
        encoder.block(0x4000, 7).unwrap();
        assert_eq!(encoder.block(0x5000, 1), Err(CodecError::Overflow));
        assert_eq!(encoder.finish() as usize, BLOCK_DESCRIPTOR_SIZE);
        assert_eq!(&buf[..ADDR_SIZE], &0x4000usize.to_be_bytes());
        assert_eq!(&buf[ADDR_SIZE..], &[0x00, 0x07]);
    }

    #[test]
    fn codec_errors_map_to_response_codes() {
        assert_eq!(
            ResponseCode::from(CodecError::InvalidRequest),
            ResponseCode::InvalidRequest
        );
        assert_eq!(
            ResponseCode::from(CodecError::Overflow),
            ResponseCode::Overflow
        );
    }
}
