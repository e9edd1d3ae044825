//! HID input reports for the interrupt channel.
//!
//! Both reports are fixed-layout byte arrays prefixed with the HIDP
//! input-report header and the report ID from the SDP report descriptor:
//!
//! ```text
//! keyboard: [0xA1, 0x02, modifiers, 0x00, k1, k2, k3, k4, k5, k6]
//! mouse:    [0xA1, 0x01, buttons, dx, dy, wheel]
//! ```

use evdev::{EventType, InputEvent, Key, RelativeAxisType};
use log::debug;

use crate::{
   error::{HidError, Result},
   hid::keymap::{self, KeyClass},
};

/// HIDP DATA transaction carrying an input report
pub const HIDP_INPUT_REPORT: u8 = 0xa1;
pub const REPORT_ID_MOUSE: u8 = 0x01;
pub const REPORT_ID_KEYBOARD: u8 = 0x02;

const MODIFIERS: usize = 2;
const FIRST_KEY_SLOT: usize = 4;

const BUTTONS: usize = 2;
const BUTTON_LEFT: u8 = 1 << 0;
const BUTTON_MIDDLE: u8 = 1 << 1;
const BUTTON_RIGHT: u8 = 1 << 2;

/// `value` of an `EV_KEY` event.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
pub enum KeyState {
   Up = 0,
   Down = 1,
   Repeat = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
   Keyboard,
   Mouse,
}

/// Live report state driven by input events.
pub trait Report: Send + 'static {
   const KIND: DeviceKind;

   /// Whether the device reader should forward `event` at all.
   fn accepts(event: &InputEvent) -> bool;

   /// Applies `event`, returning whether the report should be transmitted.
   fn update(&mut self, event: &InputEvent) -> Result<bool>;

   fn as_bytes(&self) -> &[u8];
}

/// Keyboard report with 6-key rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyReport([u8; 10]);

impl KeyReport {
   pub const fn new() -> Self {
      let mut bytes = [0u8; 10];
      bytes[0] = HIDP_INPUT_REPORT;
      bytes[1] = REPORT_ID_KEYBOARD;
      Self(bytes)
   }

   pub const fn modifiers(&self) -> u8 {
      self.0[MODIFIERS]
   }

   pub fn keys(&self) -> &[u8] {
      &self.0[FIRST_KEY_SLOT..]
   }

   pub fn set_modifier(&mut self, bit: u8, pressed: bool) -> Result<()> {
      if bit > 7 {
         return Err(HidError::InvalidModifier(bit));
      }
      let mask = 1u8 << bit;
      if pressed {
         self.0[MODIFIERS] |= mask;
      } else {
         self.0[MODIFIERS] &= !mask;
      }
      Ok(())
   }

   /// Press fills the leftmost empty slot (dropped when all six are held);
   /// release clears the slot holding `usage`. Other slots never move.
   pub fn set_key(&mut self, usage: u8, pressed: bool) {
      let slots = &mut self.0[FIRST_KEY_SLOT..];
      if pressed {
         if slots.contains(&usage) {
            return;
         }
         if let Some(slot) = slots.iter_mut().find(|slot| **slot == 0) {
            *slot = usage;
         }
      } else if let Some(slot) = slots.iter_mut().find(|slot| **slot == usage) {
         *slot = 0;
      }
   }
}

impl Default for KeyReport {
   fn default() -> Self {
      Self::new()
   }
}

impl Report for KeyReport {
   const KIND: DeviceKind = DeviceKind::Keyboard;

   fn accepts(event: &InputEvent) -> bool {
      event.event_type() == EventType::KEY
         && matches!(
            KeyState::from_repr(event.value()),
            Some(KeyState::Up | KeyState::Down)
         )
   }

   fn update(&mut self, event: &InputEvent) -> Result<bool> {
      let name = format!("{:?}", Key::new(event.code()));
      let Some((usage, class)) = keymap::convert(&name) else {
         debug!("Ignoring unmapped key {name}");
         return Ok(false);
      };
      let pressed = match KeyState::from_repr(event.value()) {
         Some(KeyState::Down) => true,
         Some(KeyState::Up) => false,
         _ => return Ok(false),
      };

      match class {
         KeyClass::Modifier => self.set_modifier(usage, pressed)?,
         KeyClass::Function => self.set_key(usage, pressed),
      }
      Ok(true)
   }

   fn as_bytes(&self) -> &[u8] {
      &self.0
   }
}

/// Three-button relative mouse report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseReport([u8; 6]);

impl MouseReport {
   pub const fn new() -> Self {
      Self([HIDP_INPUT_REPORT, REPORT_ID_MOUSE, 0, 0, 0, 0])
   }

   pub const fn buttons(&self) -> u8 {
      self.0[BUTTONS]
   }

   /// `(dx, dy, wheel)` of the last update.
   pub const fn motion(&self) -> (i8, i8, i8) {
      (self.0[3] as i8, self.0[4] as i8, self.0[5] as i8)
   }

   /// Unknown button codes leave the button byte untouched.
   pub fn set_button(&mut self, code: u16, pressed: bool) {
      let Some(mask) = button_mask(code) else {
         return;
      };
      if pressed {
         self.0[BUTTONS] |= mask;
      } else {
         self.0[BUTTONS] &= !mask;
      }
   }
}

impl Default for MouseReport {
   fn default() -> Self {
      Self::new()
   }
}

impl Report for MouseReport {
   const KIND: DeviceKind = DeviceKind::Mouse;

   fn accepts(event: &InputEvent) -> bool {
      let kind = event.event_type();
      kind == EventType::KEY || kind == EventType::RELATIVE
   }

   fn update(&mut self, event: &InputEvent) -> Result<bool> {
      self.0[3..].fill(0);

      if event.event_type() == EventType::KEY {
         match KeyState::from_repr(event.value()) {
            Some(KeyState::Down) => self.set_button(event.code(), true),
            Some(KeyState::Up) => self.set_button(event.code(), false),
            _ => {},
         }
         return Ok(true);
      }

      let field = match event.code() {
         code if code == RelativeAxisType::REL_X.0 => 3,
         code if code == RelativeAxisType::REL_Y.0 => 4,
         code if code == RelativeAxisType::REL_WHEEL.0 => 5,
         _ => return Ok(true),
      };
      self.0[field] = clamp_motion(event.value()) as u8;
      Ok(true)
   }

   fn as_bytes(&self) -> &[u8] {
      &self.0
   }
}

fn button_mask(code: u16) -> Option<u8> {
   [
      (Key::BTN_LEFT, BUTTON_LEFT),
      (Key::BTN_MIDDLE, BUTTON_MIDDLE),
      (Key::BTN_RIGHT, BUTTON_RIGHT),
   ]
   .into_iter()
   .find(|(key, _)| key.code() == code)
   .map(|(_, mask)| mask)
}

/// Saturates a relative axis value to the report's signed byte.
pub fn clamp_motion(value: i32) -> i8 {
   value.clamp(i8::MIN.into(), i8::MAX.into()) as i8
}
