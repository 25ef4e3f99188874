//! Background tasks of one connected session.
//!
//! A session owns three tasks: the writer (sole owner of the transport sink),
//! the reader (sole owner of the transport stream) and the heartbeat ticker.
//! They never touch connection state directly, every effect goes through the
//! [`Shared`] entry points.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{ErrorEvent, Event, SendError, Shared};
use crate::{
    config::OUTBOUND_QUEUE_SIZE,
    heartbeat::{Action, Beat},
    middleware::PipelineError,
    state::DisconnectReason,
    transport::{Frame, FrameSink, FrameStream, Link, TransportError},
};

/// A batch of frames written back to back, `done` gets the outcome
#[derive(Debug)]
pub(crate) struct Outbound {
    pub frames: Vec<Frame>,
    pub done: Option<oneshot::Sender<Result<(), SendError>>>,
}

impl Outbound {
    pub fn control(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
            done: None,
        }
    }
}

fn reply(done: Option<oneshot::Sender<Result<(), SendError>>>, result: Result<(), SendError>) {
    if let Some(done) = done {
        let _ = done.send(result);
    }
}

#[derive(Debug)]
pub(crate) struct SessionHandle {
    pub epoch: u64,
    pub outbound: mpsc::Sender<Outbound>,
    pub kick: Arc<Notify>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
}

impl SessionHandle {
    /// Stop every task, the writer fails queued sends
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop every task and wait the writer to close the sink
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.writer.await {
            log::debug!("Writer task ended abnormally: {}", err);
        }
    }
}

/// Reader task that starts once the connected event is out
#[derive(Debug)]
pub(crate) struct PendingReader {
    shared: Arc<Shared>,
    epoch: u64,
    stream: FrameStreamHolder,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

struct FrameStreamHolder(FrameStream);

impl std::fmt::Debug for FrameStreamHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameStream")
    }
}

impl PendingReader {
    pub fn spawn(self) {
        tokio::spawn(read_loop(
            self.shared,
            self.epoch,
            self.stream.0,
            self.outbound,
            self.cancel,
        ));
    }
}

pub(crate) fn start(shared: &Arc<Shared>, epoch: u64, link: Link) -> (SessionHandle, PendingReader) {
    log::debug!("Session {} of {} start", epoch, shared.id);

    let cancel = CancellationToken::new();
    let kick = Arc::new(Notify::new());
    let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

    let writer = tokio::spawn(write_loop(
        shared.clone(),
        epoch,
        link.sink,
        rx,
        cancel.clone(),
    ));

    if shared.heartbeat_enabled {
        tokio::spawn(heartbeat_loop(
            shared.clone(),
            epoch,
            outbound.clone(),
            kick.clone(),
            cancel.clone(),
        ));
    }

    let reader = PendingReader {
        shared: shared.clone(),
        epoch,
        stream: FrameStreamHolder(link.stream),
        outbound: outbound.clone(),
        cancel: cancel.clone(),
    };

    (
        SessionHandle {
            epoch,
            outbound,
            kick,
            cancel,
            writer,
        },
        reader,
    )
}

enum WriteFailure {
    Pipeline(PipelineError),
    Transport(TransportError),
}

async fn write_frames(
    shared: &Shared,
    sink: &mut FrameSink,
    frames: Vec<Frame>,
) -> Result<(), WriteFailure> {
    // the whole batch passes the pipeline before anything is written
    let frames = frames
        .into_iter()
        .map(|f| shared.pipeline.process_outbound(f))
        .collect::<Result<Vec<_>, _>>()
        .map_err(WriteFailure::Pipeline)?;

    for frame in frames {
        let len = frame.len();
        sink.feed(frame).await.map_err(WriteFailure::Transport)?;
        shared.count_sent(len);
    }

    sink.flush().await.map_err(WriteFailure::Transport)
}

async fn write_loop(
    shared: Arc<Shared>,
    epoch: u64,
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    log::debug!("Writer task start");

    loop {
        let Outbound { frames, done } = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            item = rx.recv() => match item {
                Some(outbound) => outbound,
                None => break,
            },
        };

        if matches!(&done, Some(d) if d.is_closed()) {
            log::trace!("Sender gave up before write, skip {} frames", frames.len());
            continue;
        }

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                reply(done, Err(SendError::Closing));
                break;
            }

            result = write_frames(&shared, &mut sink, frames) => result,
        };

        match result {
            Ok(()) => reply(done, Ok(())),
            Err(WriteFailure::Pipeline(source)) => {
                log::debug!("Outbound frame rejected: {}", source);
                reply(done, Err(SendError::Middleware { source }));
            }
            Err(WriteFailure::Transport(source)) => {
                log::warn!("Find transport broken when write: {}", source);
                let source = Arc::new(source);
                reply(
                    done,
                    Err(SendError::Transport {
                        source: source.clone(),
                    }),
                );
                shared.fail(Some(epoch), DisconnectReason::Error, Some(source));
                break;
            }
        }
    }

    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        reply(outbound.done, Err(SendError::Closing));
    }

    if let Err(err) = sink.close().await {
        log::debug!("Close transport sink failed: {}", err);
    }

    log::debug!("Writer task stop");
}

async fn read_loop(
    shared: Arc<Shared>,
    epoch: u64,
    mut stream: FrameStream,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) {
    log::debug!("Reader task start");

    let (reason, error) = loop {
        let item = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::debug!("Reader task stop");
                return;
            }

            item = stream.next() => item,
        };

        match item {
            None => {
                log::info!("Transport closed by remote");
                break (DisconnectReason::RemoteClosed, None);
            }
            Some(Err(err)) => {
                log::warn!("Find transport broken when read: {}", err);
                break (DisconnectReason::Error, Some(Arc::new(err)));
            }
            Some(Ok(frame)) => receive(&shared, frame, &outbound).await,
        }
    };

    shared.fail(Some(epoch), reason, error);

    log::debug!("Reader task stop");
}

async fn receive(shared: &Shared, frame: Frame, outbound: &mpsc::Sender<Outbound>) {
    shared.count_received(frame.len());

    let frame = match shared.pipeline.process_inbound(frame) {
        Ok(f) => f,
        Err(source) => {
            log::warn!("Inbound frame dropped: {}", source);
            shared.emit(Event::Error(ErrorEvent::Inbound { source }));
            return;
        }
    };

    match shared.probe.classify(&frame) {
        Beat::Pong => shared.acknowledge(),
        Beat::Ping(reply) => {
            shared.acknowledge();
            if let Some(reply) = reply {
                log::trace!("Answer peer heartbeat");
                let _ = outbound.send(Outbound::control(reply)).await;
            }
        }
        Beat::Data => {
            log::trace!("Received {} bytes message", frame.len());
            shared.emit(Event::Message(frame));
        }
    }
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    epoch: u64,
    outbound: mpsc::Sender<Outbound>,
    kick: Arc<Notify>,
    cancel: CancellationToken,
) {
    log::debug!("Heartbeat task start");

    loop {
        let wakeup = match shared.heartbeat_wakeup(epoch) {
            Some(w) => w,
            None => break,
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = kick.notified() => {
                log::trace!("Heartbeat schedule changed");
                continue;
            }

            _ = tokio::time::sleep_until(wakeup) => {}
        }

        let action = match shared.heartbeat_poll(epoch, Instant::now()) {
            Some(a) => a,
            None => break,
        };

        match action {
            Action::Idle => {}
            Action::Probe => {
                if let Some(ping) = shared.probe.ping() {
                    log::trace!("Send heartbeat probe");
                    if outbound.send(Outbound::control(ping)).await.is_err() {
                        log::debug!("Find writer stopped when send heartbeat probe");
                        break;
                    }
                }
            }
            Action::Missed(misses) => {
                log::warn!("Heartbeat probe missed, {} in a row", misses);
                shared.emit(Event::Error(ErrorEvent::HeartbeatMissed { misses }));
            }
            Action::Expired => {
                log::warn!("Reached heartbeat missed limit, drop connection");
                shared.fail(Some(epoch), DisconnectReason::HeartbeatTimeout, None);
                break;
            }
        }
    }

    log::debug!("Heartbeat task stop");
}
