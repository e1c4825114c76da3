//! HARQ Entity
//!
//! Stop-and-wait HARQ with a fixed pool of processes, after 3GPP TS 38.321
//! section 5.3.2. A process holds the last MAC PDU it sent until the PDU is
//! acknowledged or runs out of retransmissions.

use crate::LayerError;
use bytes::Bytes;
use common::logging::LayerLogger;
use serde::Serialize;
use std::fmt;

/// Number of HARQ processes
pub const MAX_HARQ_PROCESSES: usize = 8;

/// Retransmission attempt at which a process gives up
pub const MAX_HARQ_RETX: u8 = 4;

/// HARQ process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqState {
    /// Free for a new transmission
    Idle,
    /// PDU sent, feedback outstanding
    WaitingAck,
    /// Negative feedback received, retransmission due
    Nacked,
}

impl fmt::Display for HarqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HarqState::Idle => "IDLE",
            HarqState::WaitingAck => "WAITING_ACK",
            HarqState::Nacked => "NACKED",
        };
        f.write_str(s)
    }
}

/// One HARQ process
#[derive(Debug, Clone)]
pub struct HarqProcess {
    id: u8,
    state: HarqState,
    retx_count: u8,
    buffer: Bytes,
}

impl HarqProcess {
    fn new(id: u8) -> Self {
        Self {
            id,
            state: HarqState::Idle,
            retx_count: 0,
            buffer: Bytes::new(),
        }
    }

    fn reset(&mut self) {
        self.state = HarqState::Idle;
        self.retx_count = 0;
        self.buffer.clear();
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn state(&self) -> HarqState {
        self.state
    }

    /// Retransmissions performed for the buffered PDU
    pub fn retx_count(&self) -> u8 {
        self.retx_count
    }

    /// Buffered PDU, empty while idle
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }
}

/// A PDU handed to the physical layer by HARQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarqTransmission {
    /// MAC PDU to transmit
    pub pdu: Bytes,
    /// Process carrying the PDU
    pub process_id: u8,
    /// True if this resends a buffered PDU
    pub retransmission: bool,
}

/// HARQ counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarqStats {
    /// PDUs handed to PHY, retransmissions included
    pub transmissions: u64,
    /// Retransmission attempts
    pub retransmissions: u64,
    /// PDUs discarded at the retransmission limit
    pub failures: u64,
}

/// HARQ entity
pub struct HarqEntity {
    processes: Vec<HarqProcess>,
    next_process: usize,
    stats: HarqStats,
    log: LayerLogger,
}

impl HarqEntity {
    /// Create an entity with all processes idle
    pub fn new(log: LayerLogger) -> Self {
        Self {
            processes: (0..MAX_HARQ_PROCESSES as u8).map(HarqProcess::new).collect(),
            next_process: 0,
            stats: HarqStats::default(),
            log,
        }
    }

    /// Pick the process for the next transmission
    ///
    /// Idle processes are handed out round-robin. When none is idle the first
    /// NACKed process after the cursor is chosen so its PDU gets resent.
    pub fn select_process(&mut self) -> Result<u8, LayerError> {
        let n = self.processes.len();

        for _ in 0..n {
            let id = self.next_process;
            self.next_process = (self.next_process + 1) % n;
            if self.processes[id].state == HarqState::Idle {
                return Ok(id as u8);
            }
        }

        for offset in 0..n {
            let id = (self.next_process + offset) % n;
            if self.processes[id].state == HarqState::Nacked {
                self.next_process = (id + 1) % n;
                self.log.debug(format_args!(
                    "No idle HARQ process, reusing NACKED proc={}",
                    id
                ));
                return Ok(id as u8);
            }
        }

        self.log
            .warn(format_args!("All {} HARQ processes awaiting feedback", n));
        Err(LayerError::ResourceUnavailable)
    }

    /// Send `pdu` on the next available process
    ///
    /// If the chosen process is NACKed its buffered PDU goes out instead and
    /// `pdu` is not consumed; callers check `retransmission` on the result.
    pub fn transmit(&mut self, pdu: Bytes) -> Result<HarqTransmission, LayerError> {
        let id = self.select_process()?;
        let process = &self.processes[id as usize];

        if process.state == HarqState::Nacked && !process.buffer.is_empty() {
            return self.resend(id);
        }

        let process = &mut self.processes[id as usize];
        process.buffer = pdu.clone();
        process.state = HarqState::WaitingAck;
        process.retx_count = 0;
        self.stats.transmissions += 1;

        self.log.debug(format_args!(
            "TX MAC-PDU proc={} size={}",
            id,
            pdu.len()
        ));
        Ok(HarqTransmission {
            pdu,
            process_id: id,
            retransmission: false,
        })
    }

    /// Resend the PDU buffered on a NACKed process
    pub fn retransmit(&mut self, process_id: u8) -> Result<HarqTransmission, LayerError> {
        let process = self
            .processes
            .get(process_id as usize)
            .ok_or(LayerError::InvalidProcess(process_id))?;

        if process.state != HarqState::Nacked || process.buffer.is_empty() {
            return Err(LayerError::InvalidState(format!(
                "HARQ process {} is {}, nothing to retransmit",
                process_id, process.state
            )));
        }
        self.resend(process_id)
    }

    fn resend(&mut self, id: u8) -> Result<HarqTransmission, LayerError> {
        let process = &mut self.processes[id as usize];
        process.retx_count += 1;
        self.stats.retransmissions += 1;

        if process.retx_count >= MAX_HARQ_RETX {
            process.reset();
            self.stats.failures += 1;
            self.log.warn(format_args!(
                "HARQ max retransmissions reached proc={}, PDU discarded",
                id
            ));
            return Err(LayerError::HarqRetriesExhausted(id));
        }

        process.state = HarqState::WaitingAck;
        self.stats.transmissions += 1;
        self.log.info(format_args!(
            "HARQ retransmit proc={} attempt={}",
            id, process.retx_count
        ));
        Ok(HarqTransmission {
            pdu: process.buffer.clone(),
            process_id: id,
            retransmission: true,
        })
    }

    /// Apply ACK/NACK feedback for `process_id`
    pub fn feedback(&mut self, process_id: u8, ack: bool) {
        let Some(process) = self.processes.get_mut(process_id as usize) else {
            self.log.warn(format_args!(
                "HARQ feedback for unknown process {} ignored",
                process_id
            ));
            return;
        };

        if ack {
            process.reset();
            self.log
                .debug(format_args!("HARQ ACK proc={}", process_id));
            return;
        }

        match process.state {
            HarqState::WaitingAck => {
                process.state = HarqState::Nacked;
                self.log.debug(format_args!(
                    "HARQ NACK proc={} retx={}",
                    process_id, process.retx_count
                ));
            }
            HarqState::Nacked => {}
            HarqState::Idle => {
                self.log.debug(format_args!(
                    "HARQ NACK for idle proc={} ignored",
                    process_id
                ));
            }
        }
    }

    /// Look up a process
    pub fn process(&self, process_id: u8) -> Option<&HarqProcess> {
        self.processes.get(process_id as usize)
    }

    pub fn processes(&self) -> &[HarqProcess] {
        &self.processes
    }

    pub fn stats(&self) -> HarqStats {
        self.stats
    }
}
