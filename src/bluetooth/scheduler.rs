//! Background reconnect timers.
//!
//! Two mechanisms feed the connection manager: a periodic tick that lives
//! as long as the session, and a one-shot retry armed after an unsolicited
//! link loss. The retry carries the epoch it was armed for and the manager
//! ignores it once the epoch has moved on. Both stop when the scheduler is
//! cancelled.

use std::time::Duration;

use log::{debug, warn};
use tokio::{
   select,
   sync::mpsc,
   task::JoinHandle,
   time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Shortest period the periodic checker runs at
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
   Tick,
   RetryDue { epoch: u64 },
}

pub struct ReconnectScheduler {
   events: mpsc::Sender<SchedulerEvent>,
   token: CancellationToken,
   retry_delay: Duration,
   poll_interval: Duration,
   periodic: Option<JoinHandle<()>>,
}

impl ReconnectScheduler {
   pub fn new(
      events: mpsc::Sender<SchedulerEvent>,
      retry_delay: Duration,
      poll_interval: Duration,
   ) -> Self {
      if poll_interval < MIN_POLL_INTERVAL {
         warn!("Poll interval {poll_interval:?} too short, using {MIN_POLL_INTERVAL:?}");
      }
      Self {
         events,
         token: CancellationToken::new(),
         retry_delay,
         poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
         periodic: None,
      }
   }

   /// Starts the periodic checker. The first tick comes one interval from now.
   pub fn start_periodic(&mut self) {
      if self.periodic.is_some() || self.token.is_cancelled() {
         return;
      }

      let events = self.events.clone();
      let token = self.token.clone();
      let period = self.poll_interval;
      self.periodic = Some(tokio::spawn(async move {
         let mut interval = time::interval_at(Instant::now() + period, period);
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         loop {
            select! {
               () = token.cancelled() => break,
               _ = interval.tick() => {
                  // A full inbox means the manager is busy; drop the tick.
                  if events.try_send(SchedulerEvent::Tick).is_err() {
                     debug!("Reconnect tick skipped");
                  }
               }
            }
         }
      }));
   }

   /// Arms the single delayed retry for `epoch`.
   pub fn arm_retry(&self, epoch: u64) {
      if self.token.is_cancelled() {
         return;
      }

      let events = self.events.clone();
      let token = self.token.clone();
      let delay = self.retry_delay;
      debug!("Reconnect retry armed for epoch {epoch} in {delay:?}");
      tokio::spawn(async move {
         select! {
            () = token.cancelled() => {},
            () = time::sleep(delay) => {
               let _ = events.send(SchedulerEvent::RetryDue { epoch }).await;
            }
         }
      });
   }

   /// Stops every timer. Nothing fires after this returns.
   pub fn cancel(&mut self) {
      self.token.cancel();
      if let Some(handle) = self.periodic.take() {
         handle.abort();
      }
   }
}

impl Drop for ReconnectScheduler {
   fn drop(&mut self) {
      self.cancel();
   }
}

#[cfg(test)]
mod tests {
   use tokio::sync::mpsc::error::TryRecvError;

   use super::*;

   const RETRY: Duration = Duration::from_millis(2500);
   const POLL: Duration = Duration::from_secs(30);

   fn scheduler() -> (ReconnectScheduler, mpsc::Receiver<SchedulerEvent>) {
      let (tx, rx) = mpsc::channel(4);
      (ReconnectScheduler::new(tx, RETRY, POLL), rx)
   }

   #[tokio::test(start_paused = true)]
   async fn test_periodic_ticks_once_per_interval() {
      let (mut scheduler, mut rx) = scheduler();
      scheduler.start_periodic();

      time::sleep(POLL - Duration::from_secs(1)).await;
      assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

      time::sleep(Duration::from_secs(2)).await;
      assert_eq!(rx.try_recv(), Ok(SchedulerEvent::Tick));
      assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

      time::sleep(POLL).await;
      assert_eq!(rx.try_recv(), Ok(SchedulerEvent::Tick));
   }

   #[tokio::test(start_paused = true)]
   async fn test_zero_interval_is_clamped() {
      let (tx, mut rx) = mpsc::channel(4);
      let mut scheduler = ReconnectScheduler::new(tx, RETRY, Duration::ZERO);
      scheduler.start_periodic();

      time::sleep(MIN_POLL_INTERVAL + Duration::from_millis(100)).await;
      assert_eq!(rx.try_recv(), Ok(SchedulerEvent::Tick));
      assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

      time::sleep(MIN_POLL_INTERVAL).await;
      assert_eq!(rx.try_recv(), Ok(SchedulerEvent::Tick));
   }

   #[tokio::test(start_paused = true)]
   async fn test_retry_fires_once_with_epoch() {
      let (scheduler, mut rx) = scheduler();
      scheduler.arm_retry(7);

      time::sleep(RETRY + Duration::from_millis(100)).await;
      assert_eq!(rx.try_recv(), Ok(SchedulerEvent::RetryDue { epoch: 7 }));

      time::sleep(RETRY * 4).await;
      assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_stops_all_timers() {
      let (mut scheduler, mut rx) = scheduler();
      scheduler.start_periodic();
      scheduler.arm_retry(1);

      scheduler.cancel();
      time::sleep(POLL * 5).await;

      assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
   }

   #[tokio::test(start_paused = true)]
   async fn test_nothing_armed_after_cancel() {
      let (mut scheduler, mut rx) = scheduler();
      scheduler.cancel();
      scheduler.start_periodic();
      scheduler.arm_retry(3);

      time::sleep(POLL * 2).await;
      assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
   }
}
