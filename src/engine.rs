//! The Go-Back-N state machine of a single connection.
//!
//! Both directions share one sequence number space of size `window_size`: sent frames get
//!  consecutive sequence numbers modulo the window size, and every frame carries a cumulative
//!  ack for the peer's direction. At most `window_size - 1` frames are unacknowledged at any
//!  given time; they are kept in a buffer, oldest first, each with its own retransmission timer.
//!
//! When the oldest frame's timer expires, *all* buffered frames are resent in order. The
//!  receiving side accepts only the frame it expects next and discards everything else, so
//!  there is no reordering buffer on the receiving side.
//!
//! Acks are piggybacked on outgoing data frames. An ack that is owed to the peer when no data
//!  frame goes out within `ack_delay` is sent as a standalone ACK frame.
//!
//! There are three execution contexts per connection: the application calling
//!  [WindowEngine::submit] and [WindowEngine::close], the channel's receive loop calling
//!  [FrameHandler] methods, and the timer service calling [TimeoutHandler::on_timeout]. They
//!  all mutate the engine's state under a single lock.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time;
use tracing::{debug, error, info, trace};
use crate::channel::{FrameHandler, UnreliableChannel};
use crate::config::LinkConfig;
use crate::frame::{Frame, FrameError, FrameKind, MAX_PAYLOAD_LEN};
use crate::network_layer::NetworkLayer;
use crate::seq::SeqSpace;
use crate::timer_service::{TimeoutHandler, TimerKey, TimerService};

struct WindowState {
    seq: SeqSpace,
    /// unacknowledged frames, oldest first, with consecutive sequence numbers
    send_buffer: VecDeque<Frame>,
    next_to_send: u32,
    expected_seq: u32,

    /// set when this side sent end-of-stream, and also when the peer's end-of-stream arrived -
    ///  after that, nothing more is sent on this side
    sent_end: bool,
    received_end: bool,
    /// our own EOS frame was acknowledged
    end_acked: bool,

    retransmitting: bool,
    production_paused: bool,
    /// data timeouts since the last acknowledged progress
    unproductive_timeouts: u32,
    failure: Option<String>,
}

impl WindowState {
    fn new(window_size: u32) -> WindowState {
        WindowState {
            seq: SeqSpace::new(window_size),
            send_buffer: VecDeque::new(),
            next_to_send: 0,
            expected_seq: 0,
            sent_end: false,
            received_end: false,
            end_acked: false,
            retransmitting: false,
            production_paused: false,
            unproductive_timeouts: 0,
            failure: None,
        }
    }

    fn has_room(&self) -> bool {
        self.send_buffer.len() < self.seq.max_seq() as usize
    }

    fn can_produce(&self) -> bool {
        !self.retransmitting && self.has_room()
    }

    /// the cumulative ack for the peer's direction
    fn ack_number(&self) -> u32 {
        self.seq.prev(self.expected_seq)
    }

    fn take_next_seq(&mut self) -> u32 {
        let result = self.next_to_send;
        self.next_to_send = self.seq.next(self.next_to_send);
        result
    }

    fn is_buffered(&self, seq_number: u32) -> bool {
        self.send_buffer.iter()
            .any(|frame| frame.seq_number() == Some(seq_number))
    }
}

pub struct WindowEngine {
    config: Arc<LinkConfig>,
    state: Mutex<WindowState>,
    channel: Arc<UnreliableChannel>,
    timers: TimerService,
    network_layer: Arc<dyn NetworkLayer>,
    /// room in the buffer, or retransmission finished
    room_available: Notify,
    all_acked: Notify,
    peer_finished: Notify,
}

impl WindowEngine {
    /// Creates the engine and starts its timer service, so this must be called inside a Tokio
    ///  runtime. The engine does not start the channel's receive loop.
    pub fn new(config: Arc<LinkConfig>, window_size: u32, channel: Arc<UnreliableChannel>, network_layer: Arc<dyn NetworkLayer>) -> anyhow::Result<Arc<WindowEngine>> {
        config.validate()?;
        if window_size < 2 {
            bail!("window size must be at least 2, was {}", window_size);
        }

        Ok(Arc::new_cyclic(|engine: &Weak<WindowEngine>| {
            let timeout_handler: Weak<dyn TimeoutHandler> = engine.clone();
            WindowEngine {
                config,
                state: Mutex::new(WindowState::new(window_size)),
                channel,
                timers: TimerService::new(timeout_handler),
                network_layer,
                room_available: Notify::new(),
                all_acked: Notify::new(),
                peer_finished: Notify::new(),
            }
        }))
    }

    pub async fn window_size(&self) -> u32 {
        self.state.lock().await.seq.modulus()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.peer_addr()
    }

    pub async fn num_unacknowledged(&self) -> usize {
        self.state.lock().await.send_buffer.len()
    }

    /// Sends a payload as a single DATA frame. This blocks while the send buffer is full or
    ///  while all buffered frames are being retransmitted.
    pub async fn submit(&self, payload: Bytes) -> anyhow::Result<()> {
        if payload.is_empty() {
            bail!("empty payloads can not be sent");
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            bail!("payload of {} bytes exceeds the maximum of {}", payload.len(), MAX_PAYLOAD_LEN);
        }

        let mut state = self.wait_for(&self.room_available, WindowState::can_produce).await?;
        if state.sent_end {
            bail!("the stream was already closed");
        }

        let seq_number = state.take_next_seq();
        let frame = Frame::data(state.ack_number(), seq_number, payload)?;
        trace!("submitting frame #{} with {} bytes", seq_number, frame.payload().len());
        self.enqueue_and_send(&mut state, frame).await
    }

    /// Sends end-of-stream (unless the peer's end-of-stream implied it already), and waits until
    ///  all sent frames are acknowledged and the peer finished as well. Either way, the timer
    ///  service and the channel are shut down when this returns.
    pub async fn close(&self) -> anyhow::Result<()> {
        let result = self.finish().await;
        self.shutdown().await;
        result
    }

    async fn finish(&self) -> anyhow::Result<()> {
        {
            let mut state = self.wait_for(&self.room_available, WindowState::can_produce).await?;
            if !state.sent_end {
                state.sent_end = true;
                let seq_number = state.take_next_seq();
                debug!("sending end-of-stream as frame #{}", seq_number);
                let frame = Frame::end_of_stream(state.ack_number(), seq_number);
                self.enqueue_and_send(&mut state, frame).await?;
            }
        }

        trace!("waiting for all frames to be acknowledged");
        drop(self.wait_for(&self.all_acked, |s| s.send_buffer.is_empty()).await?);

        // the side receiving end-of-stream treats that as the end of both directions, so an
        //  acknowledged EOS means the peer finished
        trace!("waiting for the peer to finish");
        let received_end = self.wait_for(&self.peer_finished, |s| s.received_end || s.end_acked).await?
            .received_end;

        self.flush_owed_ack().await?;

        if received_end && !self.config.linger.is_zero() {
            debug!("lingering for {:?} to acknowledge retransmitted end-of-stream frames", self.config.linger);
            time::sleep(self.config.linger).await;
            self.flush_owed_ack().await?;
        }

        info!("connection to {:?} closed", self.peer_addr());
        Ok(())
    }

    /// Stops the timer service and the channel's receive loop. This is idempotent.
    pub async fn shutdown(&self) {
        self.timers.shutdown().await;
        self.channel.shutdown().await;
    }

    /// Waits until `ready` holds, returning the locked state. Fails if the connection failed.
    async fn wait_for(&self, notify: &Notify, ready: impl Fn(&WindowState) -> bool) -> anyhow::Result<MutexGuard<'_, WindowState>> {
        loop {
            // created before checking so that a notification between check and await is not lost
            let notified = notify.notified();
            {
                let state = self.state.lock().await;
                if let Some(failure) = &state.failure {
                    bail!("connection to {:?} failed: {}", self.peer_addr(), failure);
                }
                if ready(&state) {
                    return Ok(state);
                }
            }
            notified.await;
        }
    }

    async fn enqueue_and_send(&self, state: &mut WindowState, frame: Frame) -> anyhow::Result<()> {
        state.send_buffer.push_back(frame.clone());
        if !state.has_room() {
            self.pause_production(state);
        }

        if let Err(e) = self.send_frame(&frame).await {
            self.fail(state, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Transmits a DATA or EOS frame and (re)starts its retransmission timer. Any owed ack is
    ///  piggybacked on the frame.
    async fn send_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        self.channel.transmit(frame).await?;
        if let Some(seq_number) = frame.seq_number() {
            self.timers.start(TimerKey::Retransmit(seq_number), self.config.data_timeout);
        }
        self.timers.cancel(TimerKey::DelayedAck);
        Ok(())
    }

    async fn send_ack(&self) -> anyhow::Result<()> {
        let ack_number = self.state.lock().await.ack_number();
        trace!("sending standalone ack {}", ack_number);
        self.channel.transmit(&Frame::ack(ack_number)).await
    }

    async fn flush_owed_ack(&self) -> anyhow::Result<()> {
        if self.timers.is_pending(TimerKey::DelayedAck) {
            self.timers.cancel(TimerKey::DelayedAck);
            self.send_ack().await?;
        }
        Ok(())
    }

    fn pause_production(&self, state: &mut WindowState) {
        if !state.production_paused {
            trace!("pausing production");
            state.production_paused = true;
            self.network_layer.pause_production();
        }
    }

    fn resume_production(&self, state: &mut WindowState) {
        if !state.can_produce() {
            return;
        }
        if state.production_paused {
            trace!("resuming production");
            state.production_paused = false;
            self.network_layer.resume_production();
        }
        self.room_available.notify_waiters();
    }

    fn fail(&self, state: &mut WindowState, error: &anyhow::Error) {
        if state.failure.is_none() {
            error!("connection to {:?} failed: {:#}", self.peer_addr(), error);
            let reason = format!("{:#}", error);
            self.network_layer.connection_failed(&reason);
            state.failure = Some(reason);
        }
        self.room_available.notify_waiters();
        self.all_acked.notify_waiters();
        self.peer_finished.notify_waiters();
    }

    /// removes all buffered frames covered by a cumulative ack
    fn sweep_acknowledged(&self, state: &mut WindowState, ack_number: u32) {
        let mut num_acked = 0;
        while let Some(oldest) = state.send_buffer.front().and_then(Frame::seq_number) {
            if !state.seq.between(oldest, ack_number, state.next_to_send) {
                break;
            }
            if let Some(frame) = state.send_buffer.pop_front() {
                self.timers.cancel(TimerKey::Retransmit(oldest));
                if frame.kind() == FrameKind::EndOfStream {
                    debug!("end-of-stream was acknowledged");
                    state.end_acked = true;
                    self.peer_finished.notify_waiters();
                }
                num_acked += 1;
            }
        }

        if num_acked > 0 {
            trace!("ack {} acknowledged {} frame(s), {} remaining", ack_number, num_acked, state.send_buffer.len());
            state.unproductive_timeouts = 0;

            if state.send_buffer.is_empty() && state.sent_end {
                self.all_acked.notify_waiters();
            }
            self.resume_production(state);
        }
    }

    async fn on_data_timeout(&self, seq_number: u32) {
        let frames = {
            let mut state = self.state.lock().await;
            if state.failure.is_some() || state.retransmitting {
                return;
            }
            if !state.is_buffered(seq_number) {
                trace!("timeout for frame #{} which was acknowledged in the meantime", seq_number);
                return;
            }

            state.unproductive_timeouts += 1;
            if let Some(max_retransmissions) = self.config.max_retransmissions {
                if state.unproductive_timeouts > max_retransmissions {
                    let e = anyhow!("no acknowledgement after {} retransmissions", max_retransmissions);
                    self.fail(&mut state, &e);
                    return;
                }
            }

            debug!("timeout for frame #{} - retransmitting {} frame(s)", seq_number, state.send_buffer.len());
            state.retransmitting = true;
            self.pause_production(&mut state);
            state.send_buffer.iter().cloned().collect::<Vec<_>>()
        };

        // the lock is released while resending so that incoming acks are not held up
        let mut result = Ok(());
        for frame in &frames {
            if let Err(e) = self.send_frame(frame).await {
                result = Err(e);
                break;
            }
        }

        let mut state = self.state.lock().await;
        state.retransmitting = false;
        match result {
            Ok(()) => self.resume_production(&mut state),
            Err(e) => self.fail(&mut state, &e),
        }
    }

    async fn on_ack_timeout(&self) {
        if let Err(e) = self.send_ack().await {
            let mut state = self.state.lock().await;
            self.fail(&mut state, &e);
        }
    }
}

#[async_trait]
impl FrameHandler for WindowEngine {
    async fn on_frame_arrival(&self, frame: Frame) {
        let mut state = self.state.lock().await;
        if state.failure.is_some() {
            return;
        }

        self.sweep_acknowledged(&mut state, frame.ack_number());

        let Some(seq_number) = frame.seq_number() else {
            return;
        };

        // an ack is owed to the peer even for a frame that is discarded below
        self.timers.start(TimerKey::DelayedAck, self.config.ack_delay);

        if state.received_end {
            debug!("received frame #{} after end-of-stream - ignoring", seq_number);
            return;
        }
        if seq_number != state.expected_seq {
            debug!("received frame #{} out of sequence, expected #{} - discarding", seq_number, state.expected_seq);
            return;
        }

        state.expected_seq = state.seq.next(state.expected_seq);
        match frame.kind() {
            FrameKind::Data => {
                trace!("delivering frame #{} with {} bytes", seq_number, frame.payload().len());
                self.network_layer.deliver(frame.payload().clone());
            }
            FrameKind::EndOfStream => {
                debug!("received end-of-stream");
                state.received_end = true;
                state.sent_end = true;
                self.network_layer.end_of_stream();
                self.peer_finished.notify_waiters();
            }
            FrameKind::Ack => {}
        }
    }

    async fn on_damaged_frame(&self, error: FrameError) {
        debug!("received damaged frame - discarding: {}", error);
    }

    async fn on_channel_failure(&self, error: anyhow::Error) {
        let mut state = self.state.lock().await;
        self.fail(&mut state, &error);
    }
}

#[async_trait]
impl TimeoutHandler for WindowEngine {
    async fn on_timeout(&self, key: TimerKey) {
        match key {
            TimerKey::DelayedAck => self.on_ack_timeout().await,
            TimerKey::Retransmit(seq_number) => self.on_data_timeout(seq_number).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};
    use crate::config::ChannelConfig;
    use crate::fault::NoFaults;
    use crate::network_layer::MockNetworkLayer;
    use crate::send_socket::SendSocket;

    #[derive(Default)]
    struct RecordingSocket {
        sent: Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl SendSocket for RecordingSocket {
        async fn do_send_packet(&self, _to: SocketAddr, packet_buf: &[u8]) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(Frame::decode(packet_buf)?);
            Ok(())
        }
    }

    impl RecordingSocket {
        fn take(&self) -> Vec<Frame> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Delivered(Bytes),
        EndOfStream,
        Paused,
        Resumed,
        Failed,
    }

    #[derive(Default)]
    struct RecordingLayer {
        events: Mutex<Vec<Event>>,
    }

    impl NetworkLayer for RecordingLayer {
        fn deliver(&self, payload: Bytes) {
            self.events.lock().unwrap().push(Event::Delivered(payload));
        }
        fn end_of_stream(&self) {
            self.events.lock().unwrap().push(Event::EndOfStream);
        }
        fn pause_production(&self) {
            self.events.lock().unwrap().push(Event::Paused);
        }
        fn resume_production(&self) {
            self.events.lock().unwrap().push(Event::Resumed);
        }
        fn connection_failed(&self, _reason: &str) {
            self.events.lock().unwrap().push(Event::Failed);
        }
    }

    impl RecordingLayer {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    struct Harness {
        engine: Arc<WindowEngine>,
        socket: Arc<RecordingSocket>,
        layer: Arc<RecordingLayer>,
    }

    fn config() -> LinkConfig {
        LinkConfig {
            window_size: 8,
            packet_size: 16,
            data_timeout: Duration::from_millis(500),
            ack_delay: Duration::from_millis(50),
            max_retransmissions: None,
            linger: Duration::from_secs(1),
            channel: ChannelConfig::default(),
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from_str("127.0.0.1:4711").unwrap()
    }

    fn harness(window_size: u32, config: LinkConfig) -> Harness {
        let socket = Arc::new(RecordingSocket::default());
        let channel = Arc::new(UnreliableChannel::new(config.channel.clone(), peer(), socket.clone(), Arc::new(NoFaults)).unwrap());
        let layer = Arc::new(RecordingLayer::default());
        let engine = WindowEngine::new(Arc::new(config), window_size, channel, layer.clone()).unwrap();
        Harness { engine, socket, layer }
    }

    fn data(ack_number: u32, seq_number: u32, payload: &'static str) -> Frame {
        Frame::data(ack_number, seq_number, Bytes::from_static(payload.as_bytes())).unwrap()
    }

    fn summary(frames: &[Frame]) -> Vec<(FrameKind, Option<u32>, u32)> {
        frames.iter()
            .map(|f| (f.kind(), f.seq_number(), f.ack_number()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_wrap_around() {
        let h = harness(4, config());

        for payload in ["a", "b", "c"] {
            h.engine.submit(Bytes::from_static(payload.as_bytes())).await.unwrap();
        }
        assert_eq!(summary(&h.socket.take()), vec![
            (FrameKind::Data, Some(0), 3),
            (FrameKind::Data, Some(1), 3),
            (FrameKind::Data, Some(2), 3),
        ]);

        h.engine.on_frame_arrival(Frame::ack(2)).await;
        assert_eq!(h.engine.num_unacknowledged().await, 0);

        for payload in ["d", "e", "f"] {
            h.engine.submit(Bytes::from_static(payload.as_bytes())).await.unwrap();
        }
        assert_eq!(summary(&h.socket.take()), vec![
            (FrameKind::Data, Some(3), 3),
            (FrameKind::Data, Some(0), 3),
            (FrameKind::Data, Some(1), 3),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cumulative_ack() {
        let h = harness(8, config());
        for payload in ["a", "b", "c"] {
            h.engine.submit(Bytes::from_static(payload.as_bytes())).await.unwrap();
        }

        // nothing received yet from the peer's point of view
        h.engine.on_frame_arrival(Frame::ack(7)).await;
        assert_eq!(h.engine.num_unacknowledged().await, 3);

        h.engine.on_frame_arrival(Frame::ack(1)).await;
        assert_eq!(h.engine.num_unacknowledged().await, 1);

        // a data frame acknowledges as well
        h.engine.on_frame_arrival(data(2, 0, "x")).await;
        assert_eq!(h.engine.num_unacknowledged().await, 0);
        assert_eq!(h.layer.take(), vec![Event::Delivered(Bytes::from_static(b"x"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_sequence_delivery() {
        let h = harness(8, config());

        h.engine.on_frame_arrival(data(7, 1, "b")).await;
        assert!(h.layer.take().is_empty());

        h.engine.on_frame_arrival(data(7, 0, "a")).await;
        h.engine.on_frame_arrival(data(7, 0, "a")).await;
        h.engine.on_frame_arrival(data(7, 1, "b")).await;
        h.engine.on_damaged_frame(FrameError::ChecksumMismatch).await;

        assert_eq!(h.layer.take(), vec![
            Event::Delivered(Bytes::from_static(b"a")),
            Event::Delivered(Bytes::from_static(b"b")),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_ack() {
        let h = harness(8, config());

        h.engine.on_frame_arrival(data(7, 0, "a")).await;
        sleep(Duration::from_millis(40)).await;
        assert!(h.socket.take().is_empty());

        sleep(Duration::from_millis(20)).await;
        assert_eq!(summary(&h.socket.take()), vec![(FrameKind::Ack, None, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_piggybacked_ack() {
        let h = harness(8, config());

        h.engine.on_frame_arrival(data(7, 0, "a")).await;
        h.engine.submit(Bytes::from_static(b"b")).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(summary(&h.socket.take()), vec![(FrameKind::Data, Some(0), 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_end_of_stream() {
        let mut layer = MockNetworkLayer::new();
        layer.expect_end_of_stream()
            .times(1)
            .return_const(());
        layer.expect_deliver()
            .never();

        let config = config();
        let channel = Arc::new(UnreliableChannel::new(config.channel.clone(), peer(), Arc::new(RecordingSocket::default()), Arc::new(NoFaults)).unwrap());
        let engine = WindowEngine::new(Arc::new(config), 8, channel, Arc::new(layer)).unwrap();

        engine.on_frame_arrival(Frame::end_of_stream(7, 0)).await;
        engine.on_frame_arrival(Frame::end_of_stream(7, 0)).await;
        engine.on_frame_arrival(data(7, 1, "late")).await;

        assert!(engine.submit(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retransmits_whole_buffer() {
        let h = harness(8, config());
        for payload in ["a", "b", "c"] {
            h.engine.submit(Bytes::from_static(payload.as_bytes())).await.unwrap();
        }
        h.engine.on_frame_arrival(Frame::ack(0)).await;
        h.socket.take();
        h.layer.take();

        sleep(Duration::from_millis(550)).await;
        let resent = h.socket.take();
        assert_eq!(summary(&resent), vec![
            (FrameKind::Data, Some(1), 7),
            (FrameKind::Data, Some(2), 7),
        ]);
        assert_eq!(resent[0].payload().as_ref(), b"b");
        assert_eq!(h.layer.take(), vec![Event::Paused, Event::Resumed]);

        // retransmission restarted the timers
        sleep(Duration::from_millis(400)).await;
        assert!(h.socket.take().is_empty());
        sleep(Duration::from_millis(200)).await;
        assert_eq!(h.socket.take().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure() {
        let h = harness(4, config());
        for payload in ["a", "b", "c"] {
            h.engine.submit(Bytes::from_static(payload.as_bytes())).await.unwrap();
        }
        assert_eq!(h.layer.take(), vec![Event::Paused]);

        let engine = h.engine.clone();
        let blocked = tokio::spawn(async move {
            engine.submit(Bytes::from_static(b"d")).await
        });
        sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());
        assert_eq!(h.engine.num_unacknowledged().await, 3);

        h.engine.on_frame_arrival(Frame::ack(0)).await;
        blocked.await.unwrap().unwrap();

        assert_eq!(h.layer.take(), vec![Event::Resumed, Event::Paused]);
        assert_eq!(summary(&h.socket.take()).last(), Some(&(FrameKind::Data, Some(3), 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retransmissions() {
        let h = harness(8, LinkConfig { max_retransmissions: Some(2), ..config() });
        h.engine.submit(Bytes::from_static(b"a")).await.unwrap();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.socket.take().len(), 3);
        assert_eq!(h.layer.take().last(), Some(&Event::Failed));

        assert!(h.engine.submit(Bytes::from_static(b"b")).await.is_err());
        assert!(h.engine.close().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resets_retransmission_count() {
        let h = harness(8, LinkConfig { max_retransmissions: Some(1), ..config() });
        h.engine.submit(Bytes::from_static(b"a")).await.unwrap();
        h.engine.submit(Bytes::from_static(b"b")).await.unwrap();

        sleep(Duration::from_millis(600)).await;
        h.engine.on_frame_arrival(Frame::ack(0)).await;
        sleep(Duration::from_millis(600)).await;

        assert!(!h.layer.take().contains(&Event::Failed));
        assert_eq!(h.engine.num_unacknowledged().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_timeouts_count_as_one_retransmission() {
        let h = harness(8, LinkConfig { max_retransmissions: Some(1), ..config() });
        for payload in ["a", "b", "c"] {
            h.engine.submit(Bytes::from_static(payload.as_bytes())).await.unwrap();
        }
        h.socket.take();

        sleep(Duration::from_millis(600)).await;
        assert_eq!(summary(&h.socket.take()), vec![
            (FrameKind::Data, Some(0), 7),
            (FrameKind::Data, Some(1), 7),
            (FrameKind::Data, Some(2), 7),
        ]);

        h.engine.on_frame_arrival(Frame::ack(2)).await;
        assert!(!h.layer.take().contains(&Event::Failed));
        assert_eq!(h.engine.num_unacknowledged().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_failure() {
        let h = harness(8, config());
        h.engine.on_channel_failure(anyhow!("socket closed")).await;

        assert_eq!(h.layer.take(), vec![Event::Failed]);
        assert!(h.engine.submit(Bytes::from_static(b"a")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejects_empty_payload() {
        let h = harness(8, config());
        assert!(h.engine.submit(Bytes::new()).await.is_err());
        assert!(h.socket.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_ack() {
        let h = harness(8, config());
        h.engine.submit(Bytes::from_static(b"a")).await.unwrap();

        let engine = h.engine.clone();
        let closing = tokio::spawn(async move {
            engine.close().await
        });
        sleep(Duration::from_millis(10)).await;
        assert!(!closing.is_finished());
        assert_eq!(summary(&h.socket.take()), vec![
            (FrameKind::Data, Some(0), 7),
            (FrameKind::EndOfStream, Some(1), 7),
        ]);

        h.engine.on_frame_arrival(Frame::ack(1)).await;
        closing.await.unwrap().unwrap();

        assert!(h.engine.submit(Bytes::from_static(b"b")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_peer_end_of_stream() {
        let h = harness(8, config());
        h.engine.on_frame_arrival(data(7, 0, "a")).await;
        h.engine.on_frame_arrival(Frame::end_of_stream(7, 1)).await;
        assert_eq!(h.layer.take(), vec![Event::Delivered(Bytes::from_static(b"a")), Event::EndOfStream]);

        let start = Instant::now();
        h.engine.close().await.unwrap();

        assert!(Instant::now() - start >= Duration::from_secs(1));
        assert_eq!(summary(&h.socket.take()), vec![(FrameKind::Ack, None, 1)]);
    }
}
