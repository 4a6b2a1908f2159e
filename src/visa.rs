//! Session over a VISA `INSTR` resource.
//!
//! visa-rs instruments are blocking, so the session runs on its own thread.
//! Commands go in and replies come out through channels, framed by the same
//! [`ProtocolCodec`] as the byte stream transports.

use bytes::BytesMut;
use futures::channel::{mpsc, oneshot};
use futures::{Sink, Stream, StreamExt};
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};
use visa_rs::prelude::*;

use crate::proto::{
    block::TruncationPolicy, codec::ProtocolCodec, command::Command, response::Response,
    ProtoError, Result,
};

const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct VisaSession {
    commands: mpsc::UnboundedSender<Command>,
    replies: mpsc::UnboundedReceiver<io::Result<Response>>,
}

impl VisaSession {
    pub(crate) async fn open(resource: &str, policy: TruncationPolicy) -> Result<Self> {
        let name = CString::new(resource)
            .map_err(|e| ProtoError::InvalidAddress(format!("{}: {}", resource, e)))?;
        let (commands, command_rx) = mpsc::unbounded();
        let (reply_tx, replies) = mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("visa".into())
            .spawn(move || serve(name, policy, command_rx, reply_tx, ready_tx))?;
        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { commands, replies }),
            Ok(Err(msg)) => Err(ProtoError::Connection(format!("{}: {}", resource, msg))),
            Err(_) => Err(ProtoError::Abort),
        }
    }
}

fn closed(err: mpsc::SendError) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err)
}

impl Sink<Command> for VisaSession {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.commands).poll_ready(cx).map_err(closed)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Command) -> io::Result<()> {
        Pin::new(&mut self.commands).start_send(item).map_err(closed)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.commands).poll_flush(cx).map_err(closed)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.commands).poll_close(cx).map_err(closed)
    }
}

impl Stream for VisaSession {
    type Item = io::Result<Response>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.replies).poll_next(cx)
    }
}

fn serve(
    name: CString,
    policy: TruncationPolicy,
    mut commands: mpsc::UnboundedReceiver<Command>,
    replies: mpsc::UnboundedSender<io::Result<Response>>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    // Closing the resource manager closes its sessions, keep it alive.
    let rm = match DefaultRM::new() {
        Ok(rm) => rm,
        Err(e) => {
            let _ = ready.send(Err(format!("{:?}", e)));
            return;
        }
    };
    let mut instr = match rm.open(&name.into(), AccessMode::NO_LOCK, OPEN_TIMEOUT) {
        Ok(instr) => instr,
        Err(e) => {
            let _ = ready.send(Err(format!("{:?}", e)));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    let mut codec = ProtocolCodec::new(policy);
    while let Some(cmd) = futures::executor::block_on(commands.next()) {
        match transfer(&mut instr, &mut codec, cmd) {
            Ok(None) => {}
            Ok(Some(response)) => {
                if replies.unbounded_send(Ok(response)).is_err() {
                    break;
                }
            }
            Err(e) => {
                if replies.unbounded_send(Err(e)).is_err() {
                    break;
                }
            }
        }
    }
    log::debug!("visa session closed");
}

fn transfer(
    instr: &mut Instrument,
    codec: &mut ProtocolCodec,
    cmd: Command,
) -> io::Result<Option<Response>> {
    let mut out = BytesMut::new();
    codec.encode(cmd, &mut out)?;
    instr.write_all(&out)?;
    if !codec.expects_reply() {
        return Ok(None);
    }
    let mut src = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        match (&*instr).read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                src.extend_from_slice(&chunk[..n]);
                if let Some(response) = codec.decode(&mut src)? {
                    return Ok(Some(response));
                }
            }
            // A read timeout ends a reply which lacks its terminator.
            Err(e) if src.is_empty() => return Err(e),
            Err(_) => break,
        }
    }
    match codec.decode_eof(&mut src)? {
        Some(response) => Ok(Some(response)),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "instrument did not reply",
        )),
    }
}
