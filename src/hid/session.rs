//! HIDP session for one connected host.
//!
//! A session owns the control and interrupt channels of one host, the
//! device adapters writing reports to the interrupt channel, and the
//! control loop answering the host's HIDP requests. The session ends when
//! it is closed or when the control channel stops delivering data.

use std::{
   mem,
   sync::Arc,
   thread::{self, JoinHandle},
   time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
   bluetooth::l2cap::L2capSocket,
   error::Result,
   hid::{
      device::DeviceAdapter,
      discovery::DeviceSet,
      protocol::{self, HELLO_FRAMES},
   },
};

/// Largest control message read in one go
const CONTROL_MTU: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
   /// Pause between the hello frames and the first control read
   pub hello_delay: Duration,
}

impl Default for SessionOptions {
   fn default() -> Self {
      Self {
         hello_delay: Duration::from_secs(1),
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
   Stop,
}

struct SessionShared {
   control: L2capSocket,
   interrupt: Arc<L2capSocket>,
   adapters: Mutex<Vec<DeviceAdapter>>,
   signals: Receiver<ControlSignal>,
}

/// Live HIDP session with one host.
pub struct HidSession {
   shared: Arc<SessionShared>,
   signal_tx: Sender<ControlSignal>,
   control_loop: Option<JoinHandle<()>>,
}

impl HidSession {
   /// Starts adapters for every discovered device, greets the host and
   /// spawns the control loop. Devices that fail to open are skipped.
   pub fn start(
      interrupt: L2capSocket,
      control: L2capSocket,
      devices: &DeviceSet,
      options: &SessionOptions,
   ) -> Result<Self> {
      let interrupt = Arc::new(interrupt);
      let mut adapters = Vec::with_capacity(devices.keyboards.len() + devices.mice.len());

      for path in &devices.keyboards {
         match DeviceAdapter::open_keyboard(path, interrupt.clone()) {
            Ok(adapter) => adapters.push(adapter),
            Err(e) => warn!("New keyboard initialization failed for {}: {e}", path.display()),
         }
      }
      for path in &devices.mice {
         match DeviceAdapter::open_mouse(path, interrupt.clone()) {
            Ok(adapter) => adapters.push(adapter),
            Err(e) => warn!("New mouse initialization failed for {}: {e}", path.display()),
         }
      }

      Self::launch(interrupt, control, adapters, options)
   }

   fn launch(
      interrupt: Arc<L2capSocket>,
      control: L2capSocket,
      adapters: Vec<DeviceAdapter>,
      options: &SessionOptions,
   ) -> Result<Self> {
      debug!("Sending hello on control channel");
      for frame in HELLO_FRAMES {
         control
            .write(&frame)
            .inspect_err(|e| warn!("Failure on sending hello on control channel: {e}"))?;
      }
      thread::sleep(options.hello_delay);

      info!("Session started with {} input device(s)", adapters.len());

      let (signal_tx, signals) = channel::bounded(2);
      let shared = Arc::new(SessionShared {
         control,
         interrupt,
         adapters: Mutex::new(adapters),
         signals,
      });

      let control_loop = thread::Builder::new()
         .name("hidp-control".into())
         .spawn({
            let shared = shared.clone();
            move || shared.run_control_loop()
         })?;

      Ok(Self {
         shared,
         signal_tx,
         control_loop: Some(control_loop),
      })
   }

   /// Whether the control loop is still serving the host.
   pub fn is_active(&self) -> bool {
      self
         .control_loop
         .as_ref()
         .is_some_and(|handle| !handle.is_finished())
   }

   pub fn adapter_count(&self) -> usize {
      self.shared.adapters.lock().len()
   }

   /// Stops every adapter and the control loop, then closes both channels.
   pub fn close(self) {
      drop(self);
   }

   fn shutdown(&mut self) {
      let Some(control_loop) = self.control_loop.take() else {
         return;
      };

      self.shared.stop_adapters();
      debug!("Stopped input devices");

      let _ = self.signal_tx.try_send(ControlSignal::Stop);
      if self.shared.control.is_open()
         && let Err(e) = self.shared.control.shutdown()
      {
         debug!("Control channel shutdown: {e}");
      }
      if control_loop.join().is_err() {
         warn!("Control loop panicked");
      }

      self.shared.close_endpoints();
      info!("Session closed");
   }
}

impl Drop for HidSession {
   fn drop(&mut self) {
      self.shutdown();
   }
}

impl SessionShared {
   fn run_control_loop(&self) {
      let mut buf = [0u8; CONTROL_MTU];
      loop {
         if self.stop_requested() {
            info!("Will quit control loop");
            return;
         }

         match self.control.read(&mut buf) {
            Ok(0) => {
               info!("Control channel closed by host");
               break;
            },
            Ok(n) => self.handle_control_message(&buf[..n]),
            Err(e) => {
               warn!("Control channel read failed: {e}");
               break;
            },
         }
      }

      if self.stop_requested() {
         return;
      }
      info!("No data on control channel, tearing session down");
      self.stop_adapters();
      self.close_endpoints();
   }

   fn stop_requested(&self) -> bool {
      match self.signals.try_recv() {
         Ok(ControlSignal::Stop) | Err(TryRecvError::Disconnected) => true,
         Err(TryRecvError::Empty) => false,
      }
   }

   fn handle_control_message(&self, msg: &[u8]) {
      debug!("← ctrl: {}", hex::encode(msg));
      let Some(&header) = msg.first() else {
         return;
      };

      let transaction = protocol::classify(header);
      let Some(reply) = protocol::respond(header) else {
         debug!("Control message {transaction:?} accepted");
         return;
      };

      debug!("→ ctrl: {reply:02x} (in reply to {transaction:?})");
      if let Err(e) = self.control.write(&[reply]) {
         warn!("Failure on handshake reply: {e}");
      }
   }

   fn stop_adapters(&self) {
      let adapters = mem::take(&mut *self.adapters.lock());
      for mut adapter in adapters {
         debug!("Stopping adapter {}", adapter.label());
         adapter.stop();
      }
   }

   fn close_endpoints(&self) {
      for (name, socket) in [("control", &self.control), ("interrupt", &*self.interrupt)] {
         if socket.is_open()
            && let Err(e) = socket.close()
         {
            debug!("Closing {name} channel: {e}");
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use evdev::{EventType, InputEvent, Key};

   use super::*;
   use crate::{
      bluetooth::l2cap::testing::socket_pair,
      hid::{device::testing::ScriptedSource, report::KeyReport},
   };

   const NO_DELAY: SessionOptions = SessionOptions {
      hello_delay: Duration::ZERO,
   };

   fn read_packet(socket: &L2capSocket) -> Vec<u8> {
      let mut buf = [0u8; 64];
      let n = socket.read(&mut buf).unwrap();
      buf[..n].to_vec()
   }

   fn wait_inactive(session: &HidSession) {
      for _ in 0..400 {
         if !session.is_active() {
            return;
         }
         thread::sleep(Duration::from_millis(5));
      }
      panic!("session still active");
   }

   #[test]
   fn test_hello_then_handshake_replies() {
      let (ctrl, ctrl_peer) = socket_pair();
      let (intr, _intr_peer) = socket_pair();
      let session = HidSession::start(intr, ctrl, &DeviceSet::default(), &NO_DELAY).unwrap();

      assert_eq!(read_packet(&ctrl_peer), vec![0xa1, 0x13, 0x03]);
      assert_eq!(read_packet(&ctrl_peer), vec![0xa1, 0x13, 0x02]);

      ctrl_peer.write(&[0x60]).unwrap();
      assert_eq!(read_packet(&ctrl_peer), vec![0x00]);

      // DATA gets no reply, so the next packet answers the unknown message.
      ctrl_peer.write(&[0xa0]).unwrap();
      ctrl_peer.write(&[0x55]).unwrap();
      assert_eq!(read_packet(&ctrl_peer), vec![0x0e]);

      assert!(session.is_active());
      session.close();
   }

   #[test]
   fn test_close_releases_both_channels() {
      let (ctrl, ctrl_peer) = socket_pair();
      let (intr, intr_peer) = socket_pair();
      let session = HidSession::start(intr, ctrl, &DeviceSet::default(), &NO_DELAY).unwrap();
      read_packet(&ctrl_peer);
      read_packet(&ctrl_peer);

      session.close();
      assert!(read_packet(&ctrl_peer).is_empty());
      assert!(read_packet(&intr_peer).is_empty());
   }

   #[test]
   fn test_unopenable_devices_are_skipped() {
      let (ctrl, _ctrl_peer) = socket_pair();
      let (intr, _intr_peer) = socket_pair();
      let devices = DeviceSet {
         keyboards: vec!["/nonexistent/event-kbd".into()],
         mice: vec!["/nonexistent/event-mouse".into()],
      };

      let session = HidSession::start(intr, ctrl, &devices, &NO_DELAY).unwrap();
      assert_eq!(session.adapter_count(), 0);
      assert!(session.is_active());
   }

   #[test]
   fn test_host_disconnect_tears_session_down() {
      let (ctrl, ctrl_peer) = socket_pair();
      let (intr, intr_peer) = socket_pair();
      let intr = Arc::new(intr);

      let (tx, rx) = channel::unbounded();
      let keyboard =
         DeviceAdapter::spawn("kbd".into(), ScriptedSource(rx), KeyReport::new(), intr.clone())
            .unwrap();
      let session = HidSession::launch(intr, ctrl, vec![keyboard], &NO_DELAY).unwrap();
      read_packet(&ctrl_peer);
      read_packet(&ctrl_peer);

      tx.send(InputEvent::new(EventType::KEY, Key::KEY_A.code(), 1))
         .unwrap();
      assert_eq!(read_packet(&intr_peer), vec![
         0xa1, 0x02, 0x00, 0x00, 0x04, 0, 0, 0, 0, 0
      ]);

      ctrl_peer.close().unwrap();
      wait_inactive(&session);
      assert_eq!(session.adapter_count(), 0);
      assert!(read_packet(&intr_peer).is_empty());
   }
}
