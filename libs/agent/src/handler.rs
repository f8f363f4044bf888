//! Tick-driven dispatcher routing validated requests to per-command
//! subhandlers.
//!
//! [`MainHandler::process`] is the only entry point that mutates state and
//! must be called from a single context (superloop or low-priority task).
//! Dispatch runs to completion within one tick; the response is fully
//! serialized before the next request is surfaced.

use crate::config::Config;
use crate::memory::{self, AccessKind, MemoryGuard};
use crate::protocol::codec::{
    self, CodecError, CommParams, ReadRequestParser, ReadResponseEncoder, WriteRequestParser,
    WriteResponseEncoder, BLOCK_DESCRIPTOR_SIZE,
};
use crate::protocol::comm::{CommHandler, Session};
use crate::protocol::{
    CommControlSubfunction, CommandId, GetInfoSubfunction, MemoryControlSubfunction, Request,
    Response, ResponseCode,
};
use crate::timebase::Timebase;
use crate::{
    ADDR_SIZE, DEFAULT_RX_BUFFER_SIZE, DEFAULT_TX_BUFFER_SIZE, PROTOCOL_VERSION_MAJOR,
    PROTOCOL_VERSION_MINOR,
};

pub struct MainHandler<
    const RX_N: usize = DEFAULT_RX_BUFFER_SIZE,
    const TX_N: usize = DEFAULT_TX_BUFFER_SIZE,
> {
    timebase: Timebase,
    comm: CommHandler<RX_N, TX_N>,
    config: Config,
    processing_request: bool,
}

impl<const RX_N: usize, const TX_N: usize> Default for MainHandler<RX_N, TX_N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const RX_N: usize, const TX_N: usize> MainHandler<RX_N, TX_N> {
    pub fn new() -> Self {
        Self {
            timebase: Timebase::new(),
            comm: CommHandler::new(),
            config: Config::new(),
            processing_request: false,
        }
    }

    /// Installs the configuration (copied by value) and resets all state.
    pub fn init(&mut self, config: &Config) {
        self.config = config.clone();
        self.comm.init(&self.config);
        self.timebase.reset(0);
        self.processing_request = false;
    }

    /// One cooperative tick. `dt_us` is the elapsed time since the previous
    /// call. Bounded work, never blocks.
    pub fn process(&mut self, dt_us: u32) {
        self.timebase.step(dt_us);
        self.comm.check_heartbeat_timeout(&self.timebase);

        if self.comm.request_received() && !self.processing_request {
            self.processing_request = true;
            self.dispatch();
            self.comm.request_processed();
        }

        // The interlock opens again only once the response has fully left
        // the TX buffer.
        if self.processing_request && !self.comm.transmitting() {
            self.processing_request = false;
        }
    }

    pub fn comm(&self) -> &CommHandler<RX_N, TX_N> {
        &self.comm
    }

    pub fn comm_mut(&mut self) -> &mut CommHandler<RX_N, TX_N> {
        &mut self.comm
    }

    /// Feeds transport bytes; returns how many were consumed (see
    /// [`CommHandler::receive_data`]).
    pub fn receive_data(&mut self, data: &[u8]) -> usize {
        self.comm.receive_data(data, &self.timebase)
    }

    pub fn data_to_send(&self) -> usize {
        self.comm.data_to_send()
    }

    pub fn pop_data(&mut self, dst: &mut [u8]) -> usize {
        self.comm.pop_data(dst)
    }

    fn dispatch(&mut self) {
        let params = CommParams {
            rx_buffer_size: RX_N as u16,
            tx_buffer_size: TX_N as u16,
            max_bitrate_bps: self.config.max_bitrate_bps,
            heartbeat_timeout_us: self.config.heartbeat_timeout_us,
            rx_timeout_us: self.config.rx_timeout_us,
            addr_size: ADDR_SIZE as u8,
        };
        let guard = MemoryGuard::new(&self.config);
        let timebase = &self.timebase;

        let Some((request, mut response, session)) = self.comm.split_request_response() else {
            return;
        };

        let code = match CommandId::from_u8(request.command_id) {
            Some(CommandId::GetInfo) => process_get_info(&request, &mut response),
            Some(CommandId::CommControl) => {
                process_comm_control(&request, &mut response, session, timebase, &params)
            }
            Some(CommandId::MemoryControl) => {
                process_memory_control(&request, &mut response, &guard)
            }
            // Reserved command families.
            Some(CommandId::DataLogControl) | Some(CommandId::UserCommand) | None => {
                ResponseCode::UnsupportedFeature
            }
        };

        let data_length = if code == ResponseCode::Ok {
            response.data_length
        } else {
            0
        };
        let (command_id, subfunction_id) = (request.command_id, request.subfunction_id);
        self.comm
            .send_response(command_id, subfunction_id, code, data_length);
    }
}

fn code_from(result: Result<(), CodecError>) -> ResponseCode {
    match result {
        Ok(()) => ResponseCode::Ok,
        Err(err) => err.into(),
    }
}

fn process_get_info(request: &Request<'_>, response: &mut Response<'_>) -> ResponseCode {
    match GetInfoSubfunction::from_u8(request.subfunction_id) {
        Some(GetInfoSubfunction::ProtocolVersion) => code_from(codec::encode_protocol_version(
            PROTOCOL_VERSION_MAJOR,
            PROTOCOL_VERSION_MINOR,
            response,
        )),
        Some(GetInfoSubfunction::SoftwareId) => code_from(codec::encode_software_id(response)),
        // The capability bitmap layout is not settled yet.
        Some(GetInfoSubfunction::SupportedFeatures) | None => ResponseCode::UnsupportedFeature,
    }
}

fn process_comm_control(
    request: &Request<'_>,
    response: &mut Response<'_>,
    session: &mut Session,
    timebase: &Timebase,
    params: &CommParams,
) -> ResponseCode {
    match CommControlSubfunction::from_u8(request.subfunction_id) {
        Some(CommControlSubfunction::Discover) => {
            let challenge = match codec::decode_discover(request.data) {
                Ok(challenge) => challenge,
                Err(err) => return err.into(),
            };
            session.open();
            code_from(codec::encode_discover_response(&challenge, response))
        }
        Some(CommControlSubfunction::Heartbeat) => {
            let challenge = match codec::decode_heartbeat(request.data) {
                Ok(challenge) => challenge,
                Err(err) => return err.into(),
            };
            if !session.accept_heartbeat(challenge, timebase.now()) {
                return ResponseCode::InvalidRequest;
            }
            code_from(codec::encode_heartbeat_response(!challenge, response))
        }
        Some(CommControlSubfunction::GetParams) => {
            code_from(codec::encode_comm_params(params, response))
        }
        Some(CommControlSubfunction::Connect) => {
            if let Err(err) = codec::decode_connect(request.data) {
                return err.into();
            }
            if session.connected() {
                return ResponseCode::Busy;
            }
            let session_id = session.open();
            code_from(codec::encode_connect_response(session_id, response))
        }
        Some(CommControlSubfunction::Disconnect) => {
            let session_id = match codec::decode_disconnect(request.data) {
                Ok(id) => id,
                Err(err) => return err.into(),
            };
            if !session.connected() || session_id != session.session_id() {
                return ResponseCode::InvalidRequest;
            }
            session.close();
            ResponseCode::Ok
        }
        None => ResponseCode::UnsupportedFeature,
    }
}

fn process_memory_control(
    request: &Request<'_>,
    response: &mut Response<'_>,
    guard: &MemoryGuard<'_>,
) -> ResponseCode {
    match MemoryControlSubfunction::from_u8(request.subfunction_id) {
        Some(MemoryControlSubfunction::Read) => read_memory_blocks(request, response, guard),
        Some(MemoryControlSubfunction::Write) => write_memory_blocks(request, response, guard),
        None => ResponseCode::UnsupportedFeature,
    }
}

fn read_memory_blocks(
    request: &Request<'_>,
    response: &mut Response<'_>,
    guard: &MemoryGuard<'_>,
) -> ResponseCode {
    let blocks = match ReadRequestParser::new(request.data) {
        Ok(parser) => parser,
        Err(err) => return err.into(),
    };

    // Every block is vetted before a single byte of memory is touched.
    for block in blocks {
        if !guard.allows(block.addr, block.size, AccessKind::Read) {
            return ResponseCode::Forbidden;
        }
    }

    let mut encoder = ReadResponseEncoder::new(response.data);
    for block in blocks {
        match encoder.block(block.addr, block.size) {
            // SAFETY: the span passed the guard, and the slot lives in the
            // TX buffer which never overlaps guarded target regions.
            Ok(slot) => unsafe { memory::read_block(block.addr, slot) },
            Err(err) => return err.into(),
        }
    }
    response.data_length = encoder.finish();
    ResponseCode::Ok
}

fn write_memory_blocks(
    request: &Request<'_>,
    response: &mut Response<'_>,
    guard: &MemoryGuard<'_>,
) -> ResponseCode {
    let blocks = match WriteRequestParser::new(request.data) {
        Ok(parser) => parser,
        Err(err) => return err.into(),
    };

    let mut block_count = 0usize;
    for block in blocks {
        if !guard.allows(block.addr, block.size, AccessKind::Write) {
            return ResponseCode::Forbidden;
        }
        block_count += 1;
    }
    // The full acknowledgement must fit before any memory is modified.
    if block_count * BLOCK_DESCRIPTOR_SIZE > response.data.len() {
        return ResponseCode::Overflow;
    }

    let mut encoder = WriteResponseEncoder::new(response.data);
    for block in blocks {
        if encoder.block(block.addr, block.size).is_err() {
            return ResponseCode::Overflow;
        }
        // SAFETY: the span passed the guard; the source bytes live in the RX
        // buffer which never overlaps guarded target regions.
        unsafe { memory::write_block(block.addr, block.data) };
    }
    response.data_length = encoder.finish();
    ResponseCode::Ok
}
