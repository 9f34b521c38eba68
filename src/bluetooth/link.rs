//! Live byte link to the paired peripheral.
//!
//! A link wraps any async byte stream (an RFCOMM socket in production, an
//! in-memory pipe in tests) with a writer task, a reader task and a
//! one-shot loss signal that fires when the peer goes away on its own.

use std::{sync::Arc, time::Duration};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::LinkError;

/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Time allowed for a graceful shutdown of the write half
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Read buffer for status bytes sent back by the peripheral
const READ_BUFFER_SIZE: usize = 512;
const COMMAND_BUFFER_SIZE: usize = 128;

enum Command {
   Write {
      data: Vec<u8>,
      then: oneshot::Sender<Result<(), LinkError>>,
   },
   Close {
      then: oneshot::Sender<()>,
   },
}

/// Why a link went away without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossCause {
   PeerClosed,
   Io(SmolStr),
}

type LossSignal = Arc<Mutex<Option<oneshot::Sender<LossCause>>>>;

fn fire(signal: &LossSignal, cause: LossCause) {
   if let Some(tx) = signal.lock().take() {
      let _ = tx.send(cause);
   }
}

fn disarm(signal: &LossSignal) {
   signal.lock().take();
}

/// Borrowable write side of a link.
///
/// This type is cheaply cloneable. Clones stop working as soon as the
/// owning session drops the link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
   label: SmolStr,
   tx: mpsc::Sender<Command>,
}

impl LinkHandle {
   pub const fn label(&self) -> &SmolStr {
      &self.label
   }

   pub fn is_open(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
      if !self.is_open() {
         return Err(LinkError::NotConnected);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Write {
            data: data.to_vec(),
            then: tx,
         })
         .await
         .map_err(|_| LinkError::NotConnected)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| LinkError::WriteTimeout)?
         .map_err(|_| LinkError::NotConnected)?
   }

   async fn close(&self) {
      let (tx, rx) = oneshot::channel();
      if self.tx.send(Command::Close { then: tx }).await.is_ok() {
         let _ = time::timeout(CLOSE_TIMEOUT, rx).await;
      }
   }
}

impl PartialEq for LinkHandle {
   fn eq(&self, other: &Self) -> bool {
      self.tx.same_channel(&other.tx)
   }
}

/// Resolves once, when the link is lost without being closed.
#[derive(Debug)]
pub struct LinkLoss {
   rx: oneshot::Receiver<LossCause>,
}

impl LinkLoss {
   /// Waits for the link to end. `None` means it was closed on purpose
   /// (or its tasks were dropped), not lost.
   pub async fn lost(self) -> Option<LossCause> {
      self.rx.await.ok()
   }
}

/// I/O tasks backing a link. Dropping this aborts them.
#[derive(Debug)]
struct LinkTasks(JoinSet<()>);

impl Drop for LinkTasks {
   fn drop(&mut self) {
      self.0.abort_all();
   }
}

/// The part of a link the session keeps: the handle it lends out plus
/// ownership of the tasks.
#[derive(Debug)]
pub struct ActiveLink {
   handle: LinkHandle,
   _tasks: LinkTasks,
}

impl ActiveLink {
   pub const fn handle(&self) -> &LinkHandle {
      &self.handle
   }

   /// Closes the link without tripping the loss signal.
   pub async fn close(self) {
      self.handle.close().await;
      debug!("Link to {} closed", self.handle.label);
   }
}

/// A freshly established link.
#[derive(Debug)]
pub struct Link {
   active: ActiveLink,
   loss: LinkLoss,
}

impl Link {
   pub const fn handle(&self) -> &LinkHandle {
      &self.active.handle
   }

   pub fn into_parts(self) -> (ActiveLink, LinkLoss) {
      (self.active, self.loss)
   }
}

/// Starts the I/O tasks for `stream` and returns the link.
pub fn spawn<S>(label: SmolStr, stream: S) -> Link
where
   S: AsyncRead + AsyncWrite + Send + 'static,
{
   let (reader, writer) = io::split(stream);
   let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
   let (loss_tx, loss_rx) = oneshot::channel();
   let signal: LossSignal = Arc::new(Mutex::new(Some(loss_tx)));

   let mut jset = JoinSet::new();
   jset.spawn(recv_task(label.clone(), reader, signal.clone()));
   jset.spawn(send_task(label.clone(), writer, cmd_rx, signal));

   Link {
      active: ActiveLink {
         handle: LinkHandle { label, tx: cmd_tx },
         _tasks: LinkTasks(jset),
      },
      loss: LinkLoss { rx: loss_rx },
   }
}

async fn recv_task<S: AsyncRead>(label: SmolStr, mut reader: ReadHalf<S>, signal: LossSignal) {
   let mut buf = [0u8; READ_BUFFER_SIZE];
   loop {
      match reader.read(&mut buf).await {
         Ok(0) => {
            warn!("Link to {label} closed by peer");
            fire(&signal, LossCause::PeerClosed);
            return;
         },
         Ok(n) => {
            trace!("← {label}: {}", hex::encode(&buf[..n]));
         },
         Err(e) => {
            warn!("Link to {label} failed while reading: {e}");
            fire(&signal, LossCause::Io(SmolStr::new(e.to_string())));
            return;
         },
      }
   }
}

async fn send_task<S: AsyncWrite>(
   label: SmolStr,
   mut writer: WriteHalf<S>,
   mut rx: mpsc::Receiver<Command>,
   signal: LossSignal,
) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Write { data, then } => {
            trace!("→ {label}: {}", hex::encode(&data));
            let result = match writer.write_all(&data).await {
               Ok(()) => writer.flush().await,
               Err(e) => Err(e),
            };
            if let Err(e) = result {
               warn!("Link to {label} failed while writing: {e}");
               fire(&signal, LossCause::Io(SmolStr::new(e.to_string())));
               let _ = then.send(Err(LinkError::LinkLost));
               return;
            }
            let _ = then.send(Ok(()));
         },
         Command::Close { then } => {
            disarm(&signal);
            rx.close();
            if let Err(e) = writer.shutdown().await {
               debug!("Shutdown of link to {label} failed: {e}");
            }
            let _ = then.send(());
            return;
         },
      }
   }
}
