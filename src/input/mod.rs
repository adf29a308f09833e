/**
 * input/mod.rs
 *
 * Input event codec and the injection capability seam
 */

use anyhow::{anyhow, Context, Result};
use log::info;

/// Input event kinds carried over the stream, wire values 1-7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventKind {
    KeyPressed = 1,
    KeyReleased = 2,
    JoystickButtonPressed = 3,
    JoystickButtonReleased = 4,
    JoystickMoved = 5,
    JoystickConnected = 6,
    JoystickDisconnected = 7,
}

impl EventKind {
    pub const fn from_wire(value: i32) -> Option<EventKind> {
        match value {
            1 => Some(EventKind::KeyPressed),
            2 => Some(EventKind::KeyReleased),
            3 => Some(EventKind::JoystickButtonPressed),
            4 => Some(EventKind::JoystickButtonReleased),
            5 => Some(EventKind::JoystickMoved),
            6 => Some(EventKind::JoystickConnected),
            7 => Some(EventKind::JoystickDisconnected),
            _ => None,
        }
    }
}

/// One captured input event.
///
/// `id` is the key code for keyboard events and the joystick id otherwise;
/// `button` doubles as the axis id for [`EventKind::JoystickMoved`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub kind: EventKind,
    pub id: i32,
    pub button: i32,
    pub position: f32,
}

impl InputEvent {
    pub fn new(kind: EventKind, id: i32) -> Self {
        Self {
            kind,
            id,
            button: 0,
            position: 0.0,
        }
    }

    /// Text wire form: `kind:id:button:position`.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind as i32, self.id, self.button, self.position
        )
    }

    /// Parse the text wire form.
    pub fn parse(input: &str) -> Result<InputEvent> {
        let fields: Vec<&str> = input.split(':').collect();
        if fields.len() != 4 {
            return Err(anyhow!("Invalid input event format: {}", input));
        }

        let kind_value: i32 = fields[0].parse().context("Invalid event kind")?;
        let kind = EventKind::from_wire(kind_value)
            .ok_or_else(|| anyhow!("Event kind out of range: {}", kind_value))?;

        Ok(InputEvent {
            kind,
            id: fields[1].parse().context("Invalid event id")?,
            button: fields[2].parse().context("Invalid button id")?,
            position: fields[3].parse().context("Invalid axis position")?,
        })
    }
}

/// Injection capability.
///
/// One implementation per platform, chosen by the embedder at startup; the
/// protocol core only ever sees this trait.
pub trait InputSink: Send {
    fn apply(&mut self, event: &InputEvent);
}

/// Sink used when no platform injector is configured.
pub struct LoggingSink;

impl InputSink for LoggingSink {
    fn apply(&mut self, event: &InputEvent) {
        info!("input event: {}", event.encode());
    }
}
