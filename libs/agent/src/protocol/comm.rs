//! Byte-stream framing, RX/TX buffers and session state.
//!
//! The handler assembles request frames one byte at a time from whatever
//! chunks the transport delivers, verifies the CRC, and parks exactly one
//! validated request for the dispatcher. Responses are serialized into the
//! TX buffer and drained FIFO by the transport. Nothing here blocks; every
//! call does work linear in the bytes it is handed.

use crate::config::Config;
use crate::crc::{crc32, crc32_with_seed};
use crate::timebase::Timebase;

use super::{
    CommControlSubfunction, CommandId, Request, Response, ResponseCode, CONNECT_MAGIC, CRC_SIZE,
    DISCOVER_MAGIC, RESPONSE_FLAG, RESPONSE_HEADER_SIZE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RxState {
    WaitCommand,
    WaitSubfunction,
    WaitLengthHigh,
    WaitLengthLow,
    WaitData,
    WaitCrc,
    /// A validated frame is parked until `request_processed()`.
    WaitProcess,
    /// The declared length exceeded the RX buffer; bytes are discarded until
    /// the inter-byte timeout resynchronizes the decoder.
    Error,
}

/// Logical connection between host and agent.
///
/// Opened by a Discover or Connect exchange (or [`CommHandler::connect`]),
/// kept alive by heartbeats. The heartbeat timer only starts with the first
/// heartbeat, so a freshly discovered session is not torn down before the
/// host begins polling.
#[derive(Debug)]
pub struct Session {
    connected: bool,
    session_id: u32,
    seed: u32,
    connect_count: u32,
    last_heartbeat_us: Option<u32>,
    last_challenge: Option<u32>,
}

impl Session {
    fn new(seed: u32) -> Self {
        Self {
            connected: false,
            session_id: 0,
            seed,
            connect_count: 0,
            last_heartbeat_us: None,
            last_challenge: None,
        }
    }

    /// Opens a fresh session, clearing the heartbeat history, and returns
    /// the new session id.
    pub fn open(&mut self) -> u32 {
        self.connect_count = self.connect_count.wrapping_add(1);
        self.session_id = self.seed ^ self.connect_count.wrapping_mul(0x9E37_79B9);
        self.connected = true;
        self.last_heartbeat_us = None;
        self.last_challenge = None;
        self.session_id
    }

    pub fn close(&mut self) {
        self.connected = false;
        self.last_heartbeat_us = None;
        self.last_challenge = None;
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.connected
    }

    #[inline]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Records a heartbeat. Rejects it when no session is open or when the
    /// challenge repeats the previous one (replay).
    pub fn accept_heartbeat(&mut self, challenge: u32, now_us: u32) -> bool {
        if !self.connected {
            return false;
        }
        if self.last_challenge == Some(challenge) {
            return false;
        }
        self.last_challenge = Some(challenge);
        self.last_heartbeat_us = Some(now_us);
        true
    }

    fn heartbeat_expired(&self, timebase: &Timebase, timeout_us: u32) -> bool {
        match self.last_heartbeat_us {
            Some(t0) => timebase.is_elapsed(t0, timeout_us),
            None => false,
        }
    }
}

/// Framing and session layer, generic over the RX/TX buffer capacities.
pub struct CommHandler<const RX_N: usize, const TX_N: usize> {
    // Reception
    rx_buffer: [u8; RX_N],
    rx_state: RxState,
    request_command_id: u8,
    request_subfunction_id: u8,
    request_data_length: u16,
    data_bytes_received: u16,
    crc_bytes_received: u8,
    request_crc: u32,
    request_ready: bool,
    last_rx_timestamp: u32,

    // Transmission
    tx_buffer: [u8; TX_N],
    response_command_id: u8,
    response_subfunction_id: u8,
    response_code: u8,
    response_data_length: u16,
    response_crc: u32,
    nbytes_to_send: usize,
    nbytes_sent: usize,

    session: Session,
    rx_timeout_us: u32,
    heartbeat_timeout_us: u32,
}

impl<const RX_N: usize, const TX_N: usize> Default for CommHandler<RX_N, TX_N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const RX_N: usize, const TX_N: usize> CommHandler<RX_N, TX_N> {
    // Payload lengths travel on 16 bits.
    const CAPACITY_OK: () = assert!(RX_N <= u16::MAX as usize && TX_N <= u16::MAX as usize);

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        Self {
            rx_buffer: [0; RX_N],
            rx_state: RxState::WaitCommand,
            request_command_id: 0,
            request_subfunction_id: 0,
            request_data_length: 0,
            data_bytes_received: 0,
            crc_bytes_received: 0,
            request_crc: 0,
            request_ready: false,
            last_rx_timestamp: 0,
            tx_buffer: [0; TX_N],
            response_command_id: 0,
            response_subfunction_id: 0,
            response_code: 0,
            response_data_length: 0,
            response_crc: 0,
            nbytes_to_send: 0,
            nbytes_sent: 0,
            session: Session::new(0),
            rx_timeout_us: crate::config::DEFAULT_RX_TIMEOUT_US,
            heartbeat_timeout_us: crate::config::DEFAULT_HEARTBEAT_TIMEOUT_US,
        }
    }

    pub fn init(&mut self, config: &Config) {
        self.rx_timeout_us = config.rx_timeout_us;
        self.heartbeat_timeout_us = config.heartbeat_timeout_us;
        self.session = Session::new(config.session_id_seed);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.reset_rx();
        self.reset_tx();
    }

    /// Feeds transport bytes into the frame decoder and returns how many
    /// were consumed. Unconsumed bytes (a request is already parked) must be
    /// offered again later; this is the backpressure that keeps the pipeline
    /// one request deep.
    pub fn receive_data(&mut self, data: &[u8], timebase: &Timebase) -> usize {
        if data.is_empty() || self.request_ready {
            return 0;
        }

        // A stalled partial frame is abandoned once the line went quiet for
        // longer than the inter-byte timeout.
        if self.mid_frame() && timebase.is_elapsed(self.last_rx_timestamp, self.rx_timeout_us) {
            self.reset_rx();
        }
        self.last_rx_timestamp = timebase.now();

        let mut i = 0;
        while i < data.len() && !self.request_ready {
            match self.rx_state {
                RxState::WaitCommand => {
                    self.request_command_id = data[i] & !RESPONSE_FLAG;
                    self.rx_state = RxState::WaitSubfunction;
                    i += 1;
                }
                RxState::WaitSubfunction => {
                    self.request_subfunction_id = data[i];
                    self.rx_state = RxState::WaitLengthHigh;
                    i += 1;
                }
                RxState::WaitLengthHigh => {
                    self.request_data_length = (data[i] as u16) << 8;
                    self.rx_state = RxState::WaitLengthLow;
                    i += 1;
                }
                RxState::WaitLengthLow => {
                    self.request_data_length |= data[i] as u16;
                    i += 1;
                    self.rx_state = if self.request_data_length == 0 {
                        RxState::WaitCrc
                    } else if self.request_data_length as usize > RX_N {
                        RxState::Error
                    } else {
                        RxState::WaitData
                    };
                }
                RxState::WaitData => {
                    let missing =
                        self.request_data_length as usize - self.data_bytes_received as usize;
                    let take = missing.min(data.len() - i);
                    let start = self.data_bytes_received as usize;
                    self.rx_buffer[start..start + take].copy_from_slice(&data[i..i + take]);
                    self.data_bytes_received += take as u16;
                    i += take;
                    if self.data_bytes_received >= self.request_data_length {
                        self.rx_state = RxState::WaitCrc;
                    }
                }
                RxState::WaitCrc => {
                    self.request_crc = (self.request_crc << 8) | data[i] as u32;
                    self.crc_bytes_received += 1;
                    i += 1;
                    if self.crc_bytes_received == CRC_SIZE as u8 {
                        if self.check_crc() && self.accepts_request() {
                            self.rx_state = RxState::WaitProcess;
                            self.request_ready = true;
                        } else {
                            // Corrupt or unauthorized frames are dropped
                            // silently; the decoder resyncs on the next byte.
                            self.reset_rx();
                        }
                    }
                }
                RxState::WaitProcess => break,
                RxState::Error => break,
            }
        }

        if self.rx_state == RxState::Error {
            // The oversized frame's remaining bytes are swallowed.
            return data.len();
        }
        i
    }

    fn mid_frame(&self) -> bool {
        !matches!(self.rx_state, RxState::WaitCommand | RxState::WaitProcess)
    }

    fn check_crc(&self) -> bool {
        let header = [
            self.request_command_id,
            self.request_subfunction_id,
            (self.request_data_length >> 8) as u8,
            self.request_data_length as u8,
        ];
        let crc = crc32_with_seed(
            &self.rx_buffer[..self.request_data_length as usize],
            crc32(&header),
        );
        crc == self.request_crc
    }

    /// While no session is open, only a well-formed Discover or Connect
    /// frame may pass; everything else is dropped without a reply.
    fn accepts_request(&self) -> bool {
        if self.session.connected() {
            return true;
        }
        if self.request_command_id != CommandId::CommControl as u8 {
            return false;
        }
        let data = &self.rx_buffer[..self.request_data_length as usize];
        match CommControlSubfunction::from_u8(self.request_subfunction_id) {
            Some(CommControlSubfunction::Discover) => {
                data.len() >= DISCOVER_MAGIC.len() && data[..DISCOVER_MAGIC.len()] == DISCOVER_MAGIC
            }
            Some(CommControlSubfunction::Connect) => data == CONNECT_MAGIC,
            _ => false,
        }
    }

    /// True iff a validated request is parked and the previous response has
    /// fully left the TX buffer.
    pub fn request_received(&self) -> bool {
        self.request_ready && !self.transmitting()
    }

    /// Releases the RX machinery for the next request. Called exactly once
    /// per accepted request, after dispatch.
    pub fn request_processed(&mut self) {
        self.reset_rx();
    }

    /// Views over the parked request and the TX staging buffer, plus the
    /// session, for one dispatch.
    pub fn split_request_response(
        &mut self,
    ) -> Option<(Request<'_>, Response<'_>, &mut Session)> {
        if !self.request_ready {
            return None;
        }
        let request = Request {
            command_id: self.request_command_id,
            subfunction_id: self.request_subfunction_id,
            data: &self.rx_buffer[..self.request_data_length as usize],
        };
        let response = Response {
            command_id: self.request_command_id,
            subfunction_id: self.request_subfunction_id,
            data_length: 0,
            data: &mut self.tx_buffer,
        };
        Some((request, response, &mut self.session))
    }

    /// Seals the response and queues it for transmission. The payload must
    /// already be in the TX buffer.
    pub fn send_response(
        &mut self,
        command_id: u8,
        subfunction_id: u8,
        code: ResponseCode,
        data_length: u16,
    ) -> bool {
        if self.transmitting() {
            return false;
        }
        debug_assert!(data_length as usize <= TX_N);
        let (code, data_length) = if data_length as usize > TX_N {
            (ResponseCode::Overflow, 0)
        } else {
            (code, data_length)
        };
        let header = [
            command_id | RESPONSE_FLAG,
            subfunction_id,
            code as u8,
            (data_length >> 8) as u8,
            data_length as u8,
        ];
        self.response_command_id = header[0];
        self.response_subfunction_id = header[1];
        self.response_code = header[2];
        self.response_data_length = data_length;
        self.response_crc =
            crc32_with_seed(&self.tx_buffer[..data_length as usize], crc32(&header));
        self.nbytes_to_send = RESPONSE_HEADER_SIZE + data_length as usize + CRC_SIZE;
        self.nbytes_sent = 0;
        true
    }

    /// Bytes still queued for the transport.
    pub fn data_to_send(&self) -> usize {
        self.nbytes_to_send - self.nbytes_sent
    }

    #[inline]
    pub fn transmitting(&self) -> bool {
        self.nbytes_sent < self.nbytes_to_send
    }

    /// Drains queued response bytes FIFO into `dst`, returning the count.
    pub fn pop_data(&mut self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        let data_len = self.response_data_length as usize;
        while written < dst.len() && self.nbytes_sent < self.nbytes_to_send {
            let idx = self.nbytes_sent;
            dst[written] = if idx < RESPONSE_HEADER_SIZE {
                match idx {
                    0 => self.response_command_id,
                    1 => self.response_subfunction_id,
                    2 => self.response_code,
                    3 => (self.response_data_length >> 8) as u8,
                    _ => self.response_data_length as u8,
                }
            } else if idx < RESPONSE_HEADER_SIZE + data_len {
                self.tx_buffer[idx - RESPONSE_HEADER_SIZE]
            } else {
                let crc_byte = idx - RESPONSE_HEADER_SIZE - data_len;
                (self.response_crc >> (24 - 8 * crc_byte)) as u8
            };
            written += 1;
            self.nbytes_sent += 1;
        }
        if self.nbytes_sent >= self.nbytes_to_send {
            self.reset_tx();
        }
        written
    }

    /// Opens a session without a wire exchange (tests and local bring-up).
    pub fn connect(&mut self) -> u32 {
        self.session.open()
    }

    /// Closes the session and flushes any partially received frame. An
    /// in-flight response keeps draining.
    pub fn disconnect(&mut self) {
        self.session.close();
        self.reset_rx();
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.session.connected()
    }

    #[inline]
    pub fn session_id(&self) -> u32 {
        self.session.session_id()
    }

    /// Tears the session down when the host stopped heartbeating.
    pub fn check_heartbeat_timeout(&mut self, timebase: &Timebase) {
        if self.session.connected()
            && self
                .session
                .heartbeat_expired(timebase, self.heartbeat_timeout_us)
        {
            self.disconnect();
        }
    }

    fn reset_rx(&mut self) {
        self.rx_state = RxState::WaitCommand;
        self.request_command_id = 0;
        self.request_subfunction_id = 0;
        self.request_data_length = 0;
        self.data_bytes_received = 0;
        self.crc_bytes_received = 0;
        self.request_crc = 0;
        self.request_ready = false;
    }

    fn reset_tx(&mut self) {
        self.response_command_id = 0;
        self.response_subfunction_id = 0;
        self.response_code = 0;
        self.response_data_length = 0;
        self.response_crc = 0;
        self.nbytes_to_send = 0;
        self.nbytes_sent = 0;
    }
}
