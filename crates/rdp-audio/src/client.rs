//! Component D: the per-client channel.
//!
//! Owns the output ring buffer, the block-ID sequencer, the close
//! handshake, and the skip-on-overflow recovery. Exclusively driven by
//! the output actor, except [`ClientChannel::on_completion`] which is
//! called from the input actor and only ever touches the fields
//! documented as cross-actor atomics in the concurrency model.

use crate::error::ProtocolError;
use crate::types::{AudioFormat, Sample, OUTPUT_BLOCK_SIZE, QUEUE_STATS_LEN, RING_BYTES};
use crate::wire::{
    ClosePacket, CompletionPacket, NegotiateRequest, NegotiateResponse, RawPacket, WritePacket, MSG_CLOSE,
    MSG_COMPLETION, MSG_NEGOTIATE, MSG_SET_PITCH, MSG_SET_VOLUME, MSG_TRAINING, MSG_WRITE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Open,
    Negotiated,
    Streaming,
    Draining,
}

/// One outbound frame the channel wants the transport to send.
pub struct OutboundPacket {
    pub bytes: Vec<u8>,
    pub send_timing: Option<SendTiming>,
}

pub struct SendTiming {
    pub pkt_start_ns: u64,
    pub pkt_end_ns: u64,
}

struct Ring {
    buf: Vec<u8>,
    read_cursor: usize,
    write_cursor: usize,
    len: usize,
}

impl Ring {
    fn new() -> Self {
        Self { buf: vec![0u8; RING_BYTES], read_cursor: 0, write_cursor: 0, len: 0 }
    }

    fn free(&self) -> usize {
        RING_BYTES - self.len
    }

    fn push(&mut self, data: &[u8]) -> bool {
        if data.len() >= self.free() {
            return false;
        }
        let first = (RING_BYTES - self.write_cursor).min(data.len());
        self.buf[self.write_cursor..self.write_cursor + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.write_cursor = (self.write_cursor + data.len()) % RING_BYTES;
        self.len += data.len();
        true
    }

    fn pop(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.len);
        let mut out = Vec::with_capacity(take);
        let first = (RING_BYTES - self.read_cursor).min(take);
        out.extend_from_slice(&self.buf[self.read_cursor..self.read_cursor + first]);
        if first < take {
            out.extend_from_slice(&self.buf[..take - first]);
        }
        self.read_cursor = (self.read_cursor + take) % RING_BYTES;
        self.len -= take;
        out
    }
}

pub struct ClientChannel {
    pub state: ChannelState,
    format: AudioFormat,
    ring: Ring,
    time_ref_pos: usize,
    time_ref_ns: u64,
    block_id_next: u8,
    block_id_last_sent: u8,
    block_id_last_confirmed: u8,
    pending_close: bool,
    packets_to_skip: u32,
    accumulating: bool,
    queue_stats: [u32; QUEUE_STATS_LEN],
    queue_stats_len: usize,
    queue_stats_next: usize,
    queue_limit: Option<u32>,
    last_avg_depth: Option<u32>,
}

impl ClientChannel {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            state: ChannelState::Closed,
            format,
            ring: Ring::new(),
            time_ref_pos: 0,
            time_ref_ns: 0,
            block_id_next: 0,
            block_id_last_sent: 0,
            block_id_last_confirmed: 0,
            pending_close: false,
            packets_to_skip: 0,
            accumulating: true,
            queue_stats: [0; QUEUE_STATS_LEN],
            queue_stats_len: 0,
            queue_stats_next: 0,
            queue_limit: None,
            last_avg_depth: None,
        }
    }

    /// Transport attached the channel; we're ready to negotiate.
    pub fn attach(&mut self) {
        self.state = ChannelState::Open;
    }

    /// Build the NEGOTIATE request. The first WRITE's block ID equals
    /// `last_block_confirmed + 1`.
    pub fn begin_negotiate(&mut self) -> Vec<u8> {
        let req = NegotiateRequest { last_block_confirmed: self.block_id_next, format: self.format };
        self.block_id_next = self.block_id_next.wrapping_add(1);
        req.encode()
    }

    /// Dispatch an inbound wire packet. Returns any packets the channel
    /// wants sent back (only COMPLETION can trigger a CLOSE here).
    ///
    /// A message type outside the protocol's known set is a protocol
    /// violation when it carries a body (an empty body from an otherwise
    /// unknown type is tolerated as a no-op keep-alive); known types the
    /// client shouldn't normally send to the server (CLOSE, WRITE,
    /// SET_VOLUME, SET_PITCH, TRAINING) are accepted and ignored.
    pub fn on_wire_packet(&mut self, bytes: &[u8]) -> Result<Vec<OutboundPacket>, ProtocolError> {
        let raw = RawPacket::parse(bytes)?;
        match raw.msg_type {
            MSG_NEGOTIATE => {
                match NegotiateResponse::decode(raw.body) {
                    Ok(_resp) => {
                        self.state = ChannelState::Negotiated;
                        Ok(Vec::new())
                    }
                    Err(e) => {
                        self.state = ChannelState::Closed;
                        Err(e)
                    }
                }
            }
            MSG_COMPLETION => {
                let completion = CompletionPacket::decode(raw.body)?;
                Ok(self.on_completion(completion.confirmed_block_id))
            }
            MSG_CLOSE | MSG_WRITE | MSG_SET_VOLUME | MSG_SET_PITCH | MSG_TRAINING => Ok(Vec::new()),
            other => {
                if raw.body.is_empty() {
                    Ok(Vec::new())
                } else {
                    self.state = ChannelState::Closed;
                    Err(ProtocolError::UnknownType(other))
                }
            }
        }
    }

    /// Scheduler delivers resampled samples for this client.
    pub fn enqueue(&mut self, samples: &[Sample], samples_start_ns: u64, is_end: bool) -> Vec<OutboundPacket> {
        self.pending_close = false;

        if !samples.is_empty() {
            let mut bytes = Vec::with_capacity(samples.len() * 4);
            for s in samples {
                let (l, r) = s.to_i16();
                bytes.extend_from_slice(&l.to_le_bytes());
                bytes.extend_from_slice(&r.to_le_bytes());
            }
            if self.ring.push(&bytes) {
                self.time_ref_pos = self.ring.write_cursor;
                self.time_ref_ns = samples_start_ns;
            } else {
                tracing::warn!("client ring overflow, dropping {} bytes", bytes.len());
            }
        }

        if self.state == ChannelState::Negotiated {
            self.state = ChannelState::Streaming;
        }

        let mut out = Vec::new();
        if self.accumulating {
            self.accumulating = false;
        } else {
            out.extend(self.send_ready(false));
        }

        if is_end {
            out.extend(self.send_ready(true));
            self.accumulating = true;
            self.state = ChannelState::Draining;
        }

        out
    }

    fn send_ready(&mut self, is_last: bool) -> Vec<OutboundPacket> {
        let mut out = Vec::new();
        let mut sent_full_packet = false;

        while self.ring.len > 0 {
            let bytes_this_pkt = self.ring.len.min(OUTPUT_BLOCK_SIZE);
            if bytes_this_pkt < OUTPUT_BLOCK_SIZE && sent_full_packet && !is_last {
                break;
            }

            let dist_bytes = (self.time_ref_pos + RING_BYTES - self.ring.read_cursor) % RING_BYTES;
            let pkt_start_ns = self
                .time_ref_ns
                .saturating_sub(crate::types::duration_ns((dist_bytes / 4) as u64, self.format.sample_rate_hz));
            let pkt_end_ns = pkt_start_ns
                + crate::types::duration_ns((bytes_this_pkt / 4) as u64, self.format.sample_rate_hz);

            let data = self.ring.pop(bytes_this_pkt);
            // A full-sized block counts toward "we sent a full packet"
            // even when it's about to be skipped below: the original
            // tracks this at the point the block is sized, not at the
            // point it's transmitted, so a skipped full block still
            // suppresses a trailing short packet.
            sent_full_packet = bytes_this_pkt == OUTPUT_BLOCK_SIZE;

            if self.packets_to_skip > 0 {
                self.packets_to_skip -= 1;
            } else {
                self.block_id_last_sent = self.block_id_next;
                self.block_id_next = self.block_id_next.wrapping_add(1);
                let pkt = WritePacket { block_id: self.block_id_last_sent, timestamp_ms: 0, data: &data };
                out.push(OutboundPacket {
                    bytes: pkt.encode(),
                    send_timing: Some(SendTiming { pkt_start_ns, pkt_end_ns }),
                });
            }
        }

        if is_last {
            if self.block_id_last_confirmed == self.block_id_last_sent {
                out.push(OutboundPacket { bytes: ClosePacket.encode(), send_timing: None });
                self.pending_close = false;
            } else {
                self.pending_close = true;
            }
        }

        out
    }

    /// Input actor: client confirmed `confirmed_block_id`.
    pub fn on_completion(&mut self, confirmed_block_id: u8) -> Vec<OutboundPacket> {
        let diff = self.block_id_next.wrapping_sub(confirmed_block_id) as u32;
        self.queue_stats[self.queue_stats_next] = diff;
        self.queue_stats_next = (self.queue_stats_next + 1) % QUEUE_STATS_LEN;
        self.queue_stats_len = (self.queue_stats_len + 1).min(QUEUE_STATS_LEN);

        let mut avg_depth = None;
        if self.queue_stats_len == QUEUE_STATS_LEN {
            let sum: u32 = self.queue_stats.iter().sum();
            let avg = sum / QUEUE_STATS_LEN as u32;
            avg_depth = Some(avg);

            let limit = *self.queue_limit.get_or_insert(avg.max(8));
            if avg > limit && self.packets_to_skip == 0 {
                let overflow = avg - limit;
                if overflow > 4 {
                    self.packets_to_skip = 4;
                }
            }
        }

        self.block_id_last_confirmed = confirmed_block_id;

        let mut out = Vec::new();
        if self.pending_close && confirmed_block_id == self.block_id_last_sent {
            out.push(OutboundPacket { bytes: ClosePacket.encode(), send_timing: None });
            self.pending_close = false;
            self.queue_stats = [0; QUEUE_STATS_LEN];
            self.queue_stats_len = 0;
            self.queue_stats_next = 0;
            self.queue_limit = None;
            self.state = ChannelState::Open;
        }

        if let Some(avg) = avg_depth {
            self.last_avg_depth = Some(avg);
        }

        out
    }

    pub fn take_avg_queue_depth(&mut self) -> Option<u32> {
        self.last_avg_depth.take()
    }

    pub fn queue_depth_limit(&self) -> Option<u32> {
        self.queue_limit
    }

    pub fn packets_pending_skip(&self) -> u32 {
        self.packets_to_skip
    }

    pub fn block_id_next(&self) -> u8 {
        self.block_id_next
    }

    pub fn block_id_last_sent(&self) -> u8 {
        self.block_id_last_sent
    }

    pub fn block_id_last_confirmed(&self) -> u8 {
        self.block_id_last_confirmed
    }

    pub fn bytes_buffered(&self) -> usize {
        self.ring.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<Sample> {
        vec![Sample::from_i16(10, -10); n]
    }

    #[test]
    fn negotiate_assigns_first_block_id_after_confirmed() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        let req = c.begin_negotiate();
        assert_eq!(req[0], MSG_NEGOTIATE);
        assert_eq!(c.block_id_next(), 1);
    }

    #[test]
    fn enqueue_sends_full_block_packets() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        c.begin_negotiate();
        c.state = ChannelState::Negotiated;
        // Skip the accumulating phase for this test.
        c.accumulating = false;
        let samples = frames(OUTPUT_BLOCK_SIZE / 4 + 10);
        let out = c.enqueue(&samples, 0, false);
        assert!(!out.is_empty());
        assert_eq!(out[0].bytes[0], crate::wire::MSG_WRITE);
        assert_eq!(c.block_id_last_sent(), 1);
    }

    #[test]
    fn close_handshake_waits_for_confirmation() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        c.begin_negotiate();
        c.state = ChannelState::Negotiated;
        c.accumulating = false;
        let out = c.enqueue(&frames(100), 0, true);
        // Not all sent blocks confirmed yet -> no CLOSE in this batch.
        assert!(out.iter().all(|p| p.bytes.first() != Some(&MSG_CLOSE)));
        assert!(c.pending_close);

        let sent = c.block_id_last_sent();
        let closes = c.on_completion(sent);
        assert!(closes.iter().any(|p| p.bytes.first() == Some(&MSG_CLOSE)));
        assert!(!c.pending_close);
        assert_eq!(c.state, ChannelState::Open);
    }

    #[test]
    fn overflow_skips_exactly_four_packets() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        c.begin_negotiate();
        c.state = ChannelState::Negotiated;
        c.accumulating = false;
        // Baseline queue depth around 4.
        for _ in 0..QUEUE_STATS_LEN {
            c.on_completion(c.block_id_next().wrapping_sub(4));
        }
        assert_eq!(c.queue_depth_limit(), Some(8));

        // Push diff up to 13 (overflow = 13 - 8 = 5 > 4).
        for _ in 0..QUEUE_STATS_LEN {
            c.on_completion(c.block_id_next().wrapping_sub(13));
        }
        assert_eq!(c.packets_pending_skip(), 4);

        // Feed enough data for 5 packets; first 4 should be dropped.
        let samples = frames((OUTPUT_BLOCK_SIZE / 4) * 5);
        let before = c.block_id_next();
        let out = c.enqueue(&samples, 0, false);
        assert_eq!(out.len(), 1);
        assert_eq!(c.block_id_next(), before.wrapping_add(1));
        assert_eq!(c.packets_pending_skip(), 0);
    }

    #[test]
    fn ring_overflow_drops_whole_submission() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        c.state = ChannelState::Negotiated;
        c.accumulating = true;
        let huge = frames(RING_BYTES); // far more bytes than RING_BYTES holds
        let before = c.bytes_buffered();
        c.enqueue(&huge, 0, false);
        assert_eq!(c.bytes_buffered(), before);
    }

    #[test]
    fn known_ignored_type_with_body_is_not_a_violation() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        let pkt = crate::wire::SetVolumePacket { volume: 0xffff_ffff }.encode();
        assert!(c.on_wire_packet(&pkt).is_ok());
    }

    #[test]
    fn unknown_type_with_empty_body_is_tolerated() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        let pkt = [0xEE, 0, 0]; // unrecognized type, zero-length body
        assert!(c.on_wire_packet(&pkt).is_ok());
        assert_ne!(c.state, ChannelState::Closed);
    }

    #[test]
    fn unknown_type_with_body_is_a_protocol_violation() {
        let mut c = ClientChannel::new(AudioFormat::internal());
        let pkt = [0xEE, 2, 0, 0xAA, 0xBB]; // unrecognized type, 2-byte body
        let err = c.on_wire_packet(&pkt).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(0xEE)));
        assert_eq!(c.state, ChannelState::Closed);
    }
}
