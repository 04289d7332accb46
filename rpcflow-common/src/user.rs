//! Userspace view of the wire records.

use std::net::{Ipv4Addr, SocketAddrV4};

use serde::Serialize;

use crate::{
    CaptureConfig, Direction, KernelLayout, MinimalEvent, NetworkEventV1, NetworkEventV2, Schema,
    SendCompletion, WireRecord, TASK_COMM_LEN,
};

unsafe impl aya::Pod for NetworkEventV1 {}
unsafe impl aya::Pod for NetworkEventV2 {}
unsafe impl aya::Pod for MinimalEvent {}
unsafe impl aya::Pod for SendCompletion {}
unsafe impl aya::Pod for KernelLayout {}
unsafe impl aya::Pod for CaptureConfig {}

/// Command name up to the first NUL.
pub fn comm_str(comm: &[u8; TASK_COMM_LEN]) -> String {
    let end = comm.iter().position(|b| *b == 0).unwrap_or(TASK_COMM_LEN);
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

/// The valid part of a sample: never more than `data_len` bytes, with
/// trailing zero padding removed.
pub fn sample_bytes(data: &[u8], data_len: u32) -> &[u8] {
    let n = (data_len as usize).min(data.len());
    let data = &data[..n];
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &data[..end]
}

impl NetworkEventV1 {
    pub fn process_name(&self) -> String {
        comm_str(&self.comm)
    }

    pub fn direction(&self) -> Direction {
        Direction::from_is_send(self.is_send)
    }

    pub fn payload(&self) -> &[u8] {
        sample_bytes(&self.data, self.data_len)
    }
}

impl NetworkEventV2 {
    pub fn process_name(&self) -> String {
        comm_str(&self.comm)
    }

    pub fn direction(&self) -> Direction {
        Direction::from_is_send(self.is_send)
    }

    pub fn dest_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.dest_ip), self.dest_port)
    }

    pub fn payload(&self) -> &[u8] {
        sample_bytes(&self.data, self.data_len)
    }
}

impl MinimalEvent {
    pub fn process_name(&self) -> String {
        comm_str(&self.comm)
    }
}

/// A decoded record from any schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedEvent {
    pub pid: u64,
    pub timestamp_ns: u64,
    /// Requested transfer size; may exceed `sample.len()`.
    pub data_len: u32,
    /// `None` for the minimal schema, which does not record it.
    pub direction: Option<Direction>,
    pub dest: Option<SocketAddrV4>,
    pub comm: String,
    #[serde(skip)]
    pub sample: Vec<u8>,
    /// Lossy UTF-8 rendering of `sample`.
    pub sample_text: String,
}

impl CapturedEvent {
    /// Decode one record of the given schema. `None` if `buf` is too short.
    pub fn decode(schema: Schema, buf: &[u8]) -> Option<Self> {
        match schema {
            Schema::V1 => NetworkEventV1::from_bytes(buf).map(|e| Self::from(&e)),
            Schema::V2 => NetworkEventV2::from_bytes(buf).map(|e| Self::from(&e)),
            Schema::Minimal => MinimalEvent::from_bytes(buf).map(|e| Self::from(&e)),
        }
    }

    fn with_sample(mut self, sample: &[u8]) -> Self {
        self.sample = sample.to_vec();
        self.sample_text = String::from_utf8_lossy(sample).into_owned();
        self
    }
}

impl From<&NetworkEventV1> for CapturedEvent {
    fn from(e: &NetworkEventV1) -> Self {
        CapturedEvent {
            pid: e.pid,
            timestamp_ns: e.timestamp_ns,
            data_len: e.data_len,
            direction: Some(e.direction()),
            dest: None,
            comm: e.process_name(),
            sample: Vec::new(),
            sample_text: String::new(),
        }
        .with_sample(e.payload())
    }
}

impl From<&NetworkEventV2> for CapturedEvent {
    fn from(e: &NetworkEventV2) -> Self {
        CapturedEvent {
            pid: e.pid,
            timestamp_ns: e.timestamp_ns,
            data_len: e.data_len,
            direction: Some(e.direction()),
            dest: Some(e.dest_addr()),
            comm: e.process_name(),
            sample: Vec::new(),
            sample_text: String::new(),
        }
        .with_sample(e.payload())
    }
}

impl From<&MinimalEvent> for CapturedEvent {
    fn from(e: &MinimalEvent) -> Self {
        CapturedEvent {
            pid: e.pid,
            timestamp_ns: e.timestamp_ns,
            data_len: e.data_len,
            direction: None,
            dest: None,
            comm: e.process_name(),
            sample: Vec::new(),
            sample_text: String::new(),
        }
    }
}
