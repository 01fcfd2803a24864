//! Minimal TraCI client
//!
//! TraCI is SUMO's length-prefixed, big-endian request/response protocol.
//! A message is an `i32` total length followed by commands; each command is a
//! length byte (or `0` plus an `i32` for long commands), a command id and the
//! command content. Every command is answered by a status block, and `get`
//! commands additionally by a response command carrying a typed value.
//!
//! The connection is generic over the stream so tests can drive it with
//! canned bytes.

use std::io::{Read, Write};

use crate::backend::{BackendError, BackendResult};
use crate::simulation::Position;

// Commands
pub const CMD_GETVERSION: u8 = 0x00;
pub const CMD_SIMSTEP: u8 = 0x02;
pub const CMD_CLOSE: u8 = 0x7F;

// Variable domains
pub const CMD_GET_TL_VARIABLE: u8 = 0xa2;
pub const CMD_GET_LANE_VARIABLE: u8 = 0xa3;
pub const CMD_GET_VEHICLE_VARIABLE: u8 = 0xa4;
pub const CMD_GET_JUNCTION_VARIABLE: u8 = 0xa9;
pub const CMD_GET_EDGE_VARIABLE: u8 = 0xaa;
pub const CMD_GET_SIM_VARIABLE: u8 = 0xab;
pub const CMD_SET_TL_VARIABLE: u8 = 0xc2;

/// Offset between a get command and its response command
pub const RESPONSE_OFFSET: u8 = 0x10;

// Variables
pub const ID_LIST: u8 = 0x00;
pub const VAR_SPEED: u8 = 0x40;
pub const VAR_MAXSPEED: u8 = 0x41;
pub const VAR_POSITION: u8 = 0x42;
pub const VAR_LENGTH: u8 = 0x44;
pub const VAR_WIDTH: u8 = 0x4d;
pub const VAR_LANE_ID: u8 = 0x51;
pub const VAR_EDGES: u8 = 0x54;
pub const VAR_LANEPOSITION: u8 = 0x56;
pub const VAR_TIME: u8 = 0x66;
pub const VAR_DELTA_T: u8 = 0x7b;
pub const LANE_EDGE_ID: u8 = 0x31;
pub const LANE_LINKS: u8 = 0x33;
pub const FROM_JUNCTION: u8 = 0x7b;
pub const TO_JUNCTION: u8 = 0x7c;
pub const TL_PHASE_INDEX: u8 = 0x22;
pub const TL_CONTROLLED_LINKS: u8 = 0x27;
pub const TL_CURRENT_PHASE: u8 = 0x28;
pub const TL_CURRENT_PROGRAM: u8 = 0x29;
pub const TL_CONTROLLED_JUNCTIONS: u8 = 0x2a;
pub const TL_COMPLETE_DEFINITION_RYG: u8 = 0x2b;

// Value types
pub const POSITION_2D: u8 = 0x01;
pub const POSITION_3D: u8 = 0x03;
pub const TYPE_UBYTE: u8 = 0x07;
pub const TYPE_BYTE: u8 = 0x08;
pub const TYPE_INTEGER: u8 = 0x09;
pub const TYPE_DOUBLE: u8 = 0x0B;
pub const TYPE_STRING: u8 = 0x0C;
pub const TYPE_DOUBLELIST: u8 = 0x0D;
pub const TYPE_STRINGLIST: u8 = 0x0E;
pub const TYPE_COMPOUND: u8 = 0x0F;
pub const TYPE_COLOR: u8 = 0x11;

pub const RTYPE_OK: u8 = 0x00;

/// A decoded TraCI value
#[derive(Debug, Clone, PartialEq)]
pub enum TraciValue {
    UByte(u8),
    Byte(i8),
    Int(i32),
    Double(f64),
    String(String),
    StringList(Vec<String>),
    DoubleList(Vec<f64>),
    Compound(Vec<TraciValue>),
    Position2D(Position),
    Position3D(f64, f64, f64),
    Color([u8; 4]),
}

fn type_mismatch(expected: &str, got: &TraciValue) -> BackendError {
    BackendError::Protocol(format!("expected {expected}, got {got:?}"))
}

impl TraciValue {
    pub fn as_int(&self) -> BackendResult<i32> {
        match self {
            TraciValue::Int(v) => Ok(*v),
            other => Err(type_mismatch("int", other)),
        }
    }

    pub fn as_double(&self) -> BackendResult<f64> {
        match self {
            TraciValue::Double(v) => Ok(*v),
            other => Err(type_mismatch("double", other)),
        }
    }

    pub fn as_ubyte(&self) -> BackendResult<u8> {
        match self {
            TraciValue::UByte(v) => Ok(*v),
            other => Err(type_mismatch("ubyte", other)),
        }
    }

    pub fn as_str(&self) -> BackendResult<&str> {
        match self {
            TraciValue::String(v) => Ok(v),
            other => Err(type_mismatch("string", other)),
        }
    }

    pub fn into_string(self) -> BackendResult<String> {
        match self {
            TraciValue::String(v) => Ok(v),
            other => Err(type_mismatch("string", &other)),
        }
    }

    pub fn into_string_list(self) -> BackendResult<Vec<String>> {
        match self {
            TraciValue::StringList(v) => Ok(v),
            other => Err(type_mismatch("string list", &other)),
        }
    }

    pub fn into_compound(self) -> BackendResult<Vec<TraciValue>> {
        match self {
            TraciValue::Compound(v) => Ok(v),
            other => Err(type_mismatch("compound", &other)),
        }
    }

    pub fn as_position(&self) -> BackendResult<Position> {
        match self {
            TraciValue::Position2D(p) => Ok(*p),
            TraciValue::Position3D(x, y, _) => Ok(Position::new(*x, *y)),
            other => Err(type_mismatch("position", other)),
        }
    }
}

/// Big-endian encoder for command content
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_string(&mut self, v: &str) {
        self.put_len(v.len());
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn put_string_list(&mut self, items: &[String]) {
        self.put_len(items.len());
        for item in items {
            self.put_string(item);
        }
    }

    /// Write a value prefixed with its type byte
    pub fn put_typed(&mut self, value: &TraciValue) {
        match value {
            TraciValue::UByte(v) => {
                self.put_u8(TYPE_UBYTE);
                self.put_u8(*v);
            }
            TraciValue::Byte(v) => {
                self.put_u8(TYPE_BYTE);
                self.buf.extend_from_slice(&v.to_be_bytes());
            }
            TraciValue::Int(v) => {
                self.put_u8(TYPE_INTEGER);
                self.put_i32(*v);
            }
            TraciValue::Double(v) => {
                self.put_u8(TYPE_DOUBLE);
                self.put_f64(*v);
            }
            TraciValue::String(v) => {
                self.put_u8(TYPE_STRING);
                self.put_string(v);
            }
            TraciValue::StringList(v) => {
                self.put_u8(TYPE_STRINGLIST);
                self.put_string_list(v);
            }
            TraciValue::DoubleList(v) => {
                self.put_u8(TYPE_DOUBLELIST);
                self.put_len(v.len());
                for d in v {
                    self.put_f64(*d);
                }
            }
            TraciValue::Compound(items) => {
                self.put_u8(TYPE_COMPOUND);
                self.put_len(items.len());
                for item in items {
                    self.put_typed(item);
                }
            }
            TraciValue::Position2D(p) => {
                self.put_u8(POSITION_2D);
                self.put_f64(p.x);
                self.put_f64(p.y);
            }
            TraciValue::Position3D(x, y, z) => {
                self.put_u8(POSITION_3D);
                self.put_f64(*x);
                self.put_f64(*y);
                self.put_f64(*z);
            }
            TraciValue::Color(rgba) => {
                self.put_u8(TYPE_COLOR);
                self.buf.extend_from_slice(rgba);
            }
        }
    }

    fn put_len(&mut self, len: usize) {
        self.put_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Big-endian decoder over a received message body
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> BackendResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(BackendError::Protocol(format!(
                "message truncated: wanted {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let buf: &'a [u8] = self.buf;
        let slice = &buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> BackendResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> BackendResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> BackendResult<i8> {
        Ok(i8::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> BackendResult<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> BackendResult<f64> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    fn read_len(&mut self) -> BackendResult<usize> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| BackendError::Protocol(format!("negative length {len}")))
    }

    pub fn read_string(&mut self) -> BackendResult<String> {
        let len = self.read_len()?;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    pub fn read_string_list(&mut self) -> BackendResult<Vec<String>> {
        let len = self.read_len()?;
        (0..len).map(|_| self.read_string()).collect()
    }

    /// Read a type byte and the value it announces
    pub fn read_typed(&mut self) -> BackendResult<TraciValue> {
        let ty = self.read_u8()?;
        let value = match ty {
            TYPE_UBYTE => TraciValue::UByte(self.read_u8()?),
            TYPE_BYTE => TraciValue::Byte(self.read_i8()?),
            TYPE_INTEGER => TraciValue::Int(self.read_i32()?),
            TYPE_DOUBLE => TraciValue::Double(self.read_f64()?),
            TYPE_STRING => TraciValue::String(self.read_string()?),
            TYPE_STRINGLIST => TraciValue::StringList(self.read_string_list()?),
            TYPE_DOUBLELIST => {
                let len = self.read_len()?;
                TraciValue::DoubleList((0..len).map(|_| self.read_f64()).collect::<Result<_, _>>()?)
            }
            TYPE_COMPOUND => {
                let len = self.read_len()?;
                TraciValue::Compound((0..len).map(|_| self.read_typed()).collect::<Result<_, _>>()?)
            }
            POSITION_2D => TraciValue::Position2D(Position::new(self.read_f64()?, self.read_f64()?)),
            POSITION_3D => {
                TraciValue::Position3D(self.read_f64()?, self.read_f64()?, self.read_f64()?)
            }
            TYPE_COLOR => TraciValue::Color(self.take_array()?),
            other => {
                return Err(BackendError::Protocol(format!(
                    "unsupported value type 0x{other:02x}"
                )))
            }
        };
        Ok(value)
    }

    /// Read a command header, returning (command id, content length)
    pub fn read_command_header(&mut self) -> BackendResult<(u8, usize)> {
        let short = self.read_u8()?;
        let (len, header) = if short == 0 {
            (self.read_len()?, 1 + 4 + 1)
        } else {
            (usize::from(short), 1 + 1)
        };
        let id = self.read_u8()?;
        let content = len.checked_sub(header).ok_or_else(|| {
            BackendError::Protocol(format!("command 0x{id:02x} has bad length {len}"))
        })?;
        Ok((id, content))
    }

    /// Read a status block, failing unless it reports success for `command`
    pub fn read_status(&mut self, command: u8) -> BackendResult<()> {
        let (id, _) = self.read_command_header()?;
        let result = self.read_u8()?;
        let description = self.read_string()?;
        if id != command {
            return Err(BackendError::Protocol(format!(
                "status for command 0x{id:02x}, expected 0x{command:02x}"
            )));
        }
        if result != RTYPE_OK {
            return Err(BackendError::Runtime(format!(
                "SUMO rejected command 0x{command:02x}: {description}"
            )));
        }
        Ok(())
    }
}

/// Frame one command: length, id, content
pub fn encode_command(id: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    let short = content.len() + 2;
    if short <= usize::from(u8::MAX) {
        out.push(short as u8);
    } else {
        out.push(0);
        let long = i32::try_from(content.len() + 6).unwrap_or(i32::MAX);
        out.extend_from_slice(&long.to_be_bytes());
    }
    out.push(id);
    out.extend_from_slice(content);
    out
}

/// A single variable read
#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub domain: u8,
    pub variable: u8,
    pub object: String,
}

impl GetRequest {
    pub fn new(domain: u8, variable: u8, object: impl Into<String>) -> Self {
        Self {
            domain,
            variable,
            object: object.into(),
        }
    }
}

pub struct TraciConnection<S: Read + Write> {
    stream: S,
}

impl<S: Read + Write> TraciConnection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send framed commands as one message and return the response body
    fn exchange(&mut self, commands: &[Vec<u8>]) -> BackendResult<Vec<u8>> {
        let body_len: usize = commands.iter().map(Vec::len).sum();
        let total = i32::try_from(body_len + 4)
            .map_err(|_| BackendError::Protocol(format!("message of {body_len} bytes is too long")))?;

        let mut message = Vec::with_capacity(body_len + 4);
        message.extend_from_slice(&total.to_be_bytes());
        for command in commands {
            message.extend_from_slice(command);
        }
        self.stream.write_all(&message)?;
        self.stream.flush()?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = i32::from_be_bytes(len_buf);
        let body_len = usize::try_from(len)
            .ok()
            .and_then(|l| l.checked_sub(4))
            .ok_or_else(|| BackendError::Protocol(format!("bad message length {len}")))?;
        let mut body = vec![0u8; body_len];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }

    /// Returns (api version, SUMO version string)
    pub fn get_version(&mut self) -> BackendResult<(i32, String)> {
        let body = self.exchange(&[encode_command(CMD_GETVERSION, &[])])?;
        let mut reader = Reader::new(&body);
        reader.read_status(CMD_GETVERSION)?;
        let (id, _) = reader.read_command_header()?;
        if id != CMD_GETVERSION {
            return Err(BackendError::Protocol(format!(
                "unexpected version response 0x{id:02x}"
            )));
        }
        let api = reader.read_i32()?;
        let version = reader.read_string()?;
        Ok((api, version))
    }

    /// Advance the simulation by one step
    pub fn simulation_step(&mut self) -> BackendResult<()> {
        let mut content = Writer::new();
        content.put_f64(0.0);
        let body = self.exchange(&[encode_command(CMD_SIMSTEP, &content.into_bytes())])?;
        let mut reader = Reader::new(&body);
        reader.read_status(CMD_SIMSTEP)?;
        // Subscription results follow; this client never subscribes
        let _subscriptions = reader.read_i32()?;
        Ok(())
    }

    pub fn get(&mut self, domain: u8, variable: u8, object: &str) -> BackendResult<TraciValue> {
        let mut values = self.get_batch(&[GetRequest::new(domain, variable, object)])?;
        values
            .pop()
            .ok_or_else(|| BackendError::Protocol("empty get response".to_string()))
    }

    /// Issue several variable reads in one round trip
    pub fn get_batch(&mut self, requests: &[GetRequest]) -> BackendResult<Vec<TraciValue>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let commands: Vec<Vec<u8>> = requests
            .iter()
            .map(|req| {
                let mut content = Writer::new();
                content.put_u8(req.variable);
                content.put_string(&req.object);
                encode_command(req.domain, &content.into_bytes())
            })
            .collect();

        let body = self.exchange(&commands)?;
        let mut reader = Reader::new(&body);
        let mut values = Vec::with_capacity(requests.len());
        for req in requests {
            reader.read_status(req.domain)?;
            let (id, _) = reader.read_command_header()?;
            let variable = reader.read_u8()?;
            let object = reader.read_string()?;
            if id != req.domain.wrapping_add(RESPONSE_OFFSET)
                || variable != req.variable
                || object != req.object
            {
                return Err(BackendError::Protocol(format!(
                    "response 0x{id:02x}/0x{variable:02x} for {object:?} does not match request 0x{:02x}/0x{:02x} for {:?}",
                    req.domain, req.variable, req.object
                )));
            }
            values.push(reader.read_typed()?);
        }
        Ok(values)
    }

    pub fn set(
        &mut self,
        domain: u8,
        variable: u8,
        object: &str,
        value: &TraciValue,
    ) -> BackendResult<()> {
        let mut content = Writer::new();
        content.put_u8(variable);
        content.put_string(object);
        content.put_typed(value);
        let body = self.exchange(&[encode_command(domain, &content.into_bytes())])?;
        Reader::new(&body).read_status(domain)
    }

    pub fn close(&mut self) -> BackendResult<()> {
        let body = self.exchange(&[encode_command(CMD_CLOSE, &[])])?;
        Reader::new(&body).read_status(CMD_CLOSE)
    }
}
