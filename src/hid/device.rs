//! Input device adapters.
//!
//! Each adapter pairs a blocking reader thread, which pulls events from the
//! input device and queues the ones its report cares about, with a worker
//! thread that applies them to the report and transmits it. Either side
//! failing ends both. Shutdown is signalled by disconnecting a control
//! channel that both threads watch.

use std::{
   collections::VecDeque,
   io,
   path::Path,
   sync::Arc,
   thread::{self, JoinHandle},
};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use evdev::InputEvent;
use log::{debug, info, warn};
use smol_str::SmolStr;

use crate::{
   bluetooth::l2cap::L2capSocket,
   error::{HidError, Result},
   hid::report::{KeyReport, MouseReport, Report},
};

/// Events buffered between reader and worker; a full queue blocks the reader.
const EVENT_QUEUE_DEPTH: usize = 10;

/// Blocking source of input events.
pub trait EventSource: Send + 'static {
   fn next_event(&mut self) -> Result<InputEvent>;
}

/// Destination for serialized reports.
pub trait ReportSink: Send + Sync + 'static {
   fn send_report(&self, report: &[u8]) -> Result<usize>;
}

impl ReportSink for L2capSocket {
   fn send_report(&self, report: &[u8]) -> Result<usize> {
      self.write(report)
   }
}

/// evdev character device, e.g. `/dev/input/event3`.
pub struct EvdevSource {
   device: evdev::Device,
   pending: VecDeque<InputEvent>,
}

impl EvdevSource {
   pub fn open(path: &Path) -> Result<Self> {
      let device = evdev::Device::open(path)
         .inspect_err(|e| warn!("Failure on opening {}: {e}", path.display()))?;
      info!(
         "Opened input device {} ({})",
         path.display(),
         device.name().unwrap_or("unnamed")
      );
      Ok(Self {
         device,
         pending: VecDeque::new(),
      })
   }
}

impl EventSource for EvdevSource {
   fn next_event(&mut self) -> Result<InputEvent> {
      loop {
         if let Some(event) = self.pending.pop_front() {
            return Ok(event);
         }
         let events = self.device.fetch_events().map_err(read_error)?;
         self.pending.extend(events);
      }
   }
}

/// A device that went away (`ENODEV`) has no more events to give.
fn read_error(e: io::Error) -> HidError {
   if e.raw_os_error() == Some(libc::ENODEV) {
      HidError::ConnectionClosed
   } else {
      e.into()
   }
}

/// Running adapter for one input device.
pub struct DeviceAdapter {
   label: SmolStr,
   shutdown: Option<Sender<()>>,
   worker: Option<JoinHandle<()>>,
}

impl DeviceAdapter {
   pub fn open_keyboard(path: &Path, sink: Arc<dyn ReportSink>) -> Result<Self> {
      Self::spawn(label_for(path), EvdevSource::open(path)?, KeyReport::new(), sink)
   }

   pub fn open_mouse(path: &Path, sink: Arc<dyn ReportSink>) -> Result<Self> {
      Self::spawn(label_for(path), EvdevSource::open(path)?, MouseReport::new(), sink)
   }

   pub fn spawn<R, S>(label: SmolStr, source: S, report: R, sink: Arc<dyn ReportSink>) -> Result<Self>
   where
      R: Report,
      S: EventSource,
   {
      let (event_tx, event_rx) = channel::bounded(EVENT_QUEUE_DEPTH);
      // Nothing is ever sent; dropping the sender is the stop signal.
      let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

      // The reader is detached: a blocking device read can only be cut short
      // by the device itself, so it notices shutdown on its next event.
      thread::Builder::new()
         .name(format!("{label}-reader"))
         .spawn({
            let label = label.clone();
            let shutdown = shutdown_rx.clone();
            move || read_events::<R, S>(&label, source, &event_tx, &shutdown)
         })?;

      let worker = thread::Builder::new().name(format!("{label}-report")).spawn({
         let label = label.clone();
         move || transmit_reports(&label, report, sink.as_ref(), &event_rx, &shutdown_rx)
      })?;

      info!("Started {} adapter {label}", R::KIND);
      Ok(Self {
         label,
         shutdown: Some(shutdown_tx),
         worker: Some(worker),
      })
   }

   pub fn label(&self) -> &str {
      &self.label
   }

   pub fn is_running(&self) -> bool {
      self.worker.as_ref().is_some_and(|w| !w.is_finished())
   }

   /// Signals both loops and waits for the report worker to exit.
   pub fn stop(&mut self) {
      drop(self.shutdown.take());
      if let Some(worker) = self.worker.take() {
         if worker.join().is_err() {
            warn!("{}: report worker panicked", self.label);
         }
         debug!("{}: adapter stopped", self.label);
      }
   }
}

impl Drop for DeviceAdapter {
   fn drop(&mut self) {
      self.stop();
   }
}

fn label_for(path: &Path) -> SmolStr {
   path
      .file_name()
      .map(|name| SmolStr::new(name.to_string_lossy()))
      .unwrap_or_else(|| SmolStr::new(path.to_string_lossy()))
}

fn read_events<R: Report, S: EventSource>(
   label: &str,
   mut source: S,
   events: &Sender<InputEvent>,
   shutdown: &Receiver<()>,
) {
   loop {
      if let Err(TryRecvError::Disconnected) = shutdown.try_recv() {
         debug!("{label}: quitting poller");
         return;
      }

      let event = match source.next_event() {
         Ok(event) => event,
         Err(HidError::ConnectionClosed) => {
            info!("{label}: input device gone, quitting poller");
            return;
         },
         Err(e) => {
            warn!("{label}: error reading input event: {e}");
            return;
         },
      };
      if !R::accepts(&event) {
         continue;
      }
      if events.send(event).is_err() {
         debug!("{label}: report worker gone, quitting poller");
         return;
      }
   }
}

fn transmit_reports<R: Report>(
   label: &str,
   mut report: R,
   sink: &dyn ReportSink,
   events: &Receiver<InputEvent>,
   shutdown: &Receiver<()>,
) {
   loop {
      let event = channel::select! {
         recv(shutdown) -> _ => None,
         recv(events) -> event => event.ok(),
      };
      let Some(event) = event else {
         debug!("{label}: stop requested or input closed");
         break;
      };

      match report.update(&event) {
         Ok(true) => {},
         Ok(false) => continue,
         Err(e) => {
            warn!("{label}: dropping input event: {e}");
            continue;
         },
      }

      let bytes = report.as_bytes();
      debug!("→ {label}: {}", hex::encode(bytes));
      if let Err(e) = sink.send_report(bytes) {
         warn!("{label}: failure on sending report: {e}");
         break;
      }
   }
   info!("Stopping {} event loop for {label}", R::KIND);
}

#[cfg(test)]
pub(crate) mod testing {
   use std::time::Duration;

   use parking_lot::Mutex;

   use super::*;

   /// Event source fed from a channel; closing the channel fails the read.
   pub(crate) struct ScriptedSource(pub Receiver<InputEvent>);

   impl EventSource for ScriptedSource {
      fn next_event(&mut self) -> Result<InputEvent> {
         self.0.recv().map_err(|_| HidError::ConnectionClosed)
      }
   }

   /// Sink recording every report; can be told to fail.
   #[derive(Default)]
   pub(crate) struct RecordingSink {
      reports: Mutex<Vec<Vec<u8>>>,
      pub fail: std::sync::atomic::AtomicBool,
   }

   impl RecordingSink {
      pub(crate) fn wait_for(&self, count: usize) -> Vec<Vec<u8>> {
         for _ in 0..200 {
            {
               let reports = self.reports.lock();
               if reports.len() >= count {
                  return reports.clone();
               }
            }
            thread::sleep(Duration::from_millis(5));
         }
         self.reports.lock().clone()
      }
   }

   impl ReportSink for RecordingSink {
      fn send_report(&self, report: &[u8]) -> Result<usize> {
         if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(HidError::ConnectionClosed);
         }
         self.reports.lock().push(report.to_vec());
         Ok(report.len())
      }
   }
}
