//! Sony SRG-300 series PTZ camera (VISCA over IP, UDP port 52381).
//!
//! Every packet carries an 8-byte header: payload type (`01 00` command,
//! `01 10` inquiry), payload length and a 32-bit sequence number. The camera
//! answers a command with ACK `9x 4y FF` then completion `9x 5y FF`, and an
//! inquiry with `90 50 vv FF`. Errors are `9x 6y ee FF`.

use super::command::command_set;
use super::{Driver, Pacing, Qualifier, Reply, Request, RequestKind, Value};
use crate::error::{AvError, AvResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::warn;

command_set! {
    /// Commands of the SRG-300 series.
    pub enum SrgCommand {
        ConnectionStatus => "ConnectionStatus",
        AutoFocus => "AutoFocus",
        BacklightMode => "BacklightMode",
        Focus => "Focus" ["Focus Speed"],
        Gain => "Gain",
        Home => "Home",
        InformationDisplay => "InformationDisplay",
        Iris => "Iris",
        IrisDirect => "IrisDirect" ["XPos", "YPos"],
        IRReceiver => "IRReceiver",
        PanTilt => "PanTilt" ["Pan Speed", "Tilt Speed"],
        Power => "Power",
        PresetRecall => "PresetRecall",
        PresetReset => "PresetReset",
        PresetSave => "PresetSave",
        ResetPanTilt => "ResetPanTilt",
        Zoom => "Zoom" ["Zoom Speed"],
    }
}

/// Reply wait of one request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Control packet that resets the camera's expected sequence number.
pub const RESET_SEQUENCE: [u8; 9] = [0x02, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01];

const HEADER_LEN: usize = 8;

const PAN_TILT_DIRECTIONS: &[(&str, u16)] = &[
    ("Up", 0x0301),
    ("Down", 0x0302),
    ("Left", 0x0103),
    ("Right", 0x0203),
    ("Up Left", 0x0101),
    ("Up Right", 0x0201),
    ("Down Left", 0x0102),
    ("Down Right", 0x0202),
    ("Stop", 0x0303),
];

const ERRORS: &[(u8, &str)] = &[
    (0x01, "Message Length Error"),
    (0x02, "Syntax Error"),
    (0x03, "Command Buffer Full"),
    (0x04, "Command Cancelled"),
    (0x05, "No Socket"),
    (0x41, "Command Not Executable"),
];

fn text(command: SrgCommand, value: &Value) -> AvResult<&str> {
    value
        .as_text()
        .ok_or_else(|| AvError::invalid(command, format!("expected text, got {value}")))
}

fn on_off(command: SrgCommand, value: &Value) -> AvResult<u8> {
    match text(command, value)? {
        "On" => Ok(0x02),
        "Off" => Ok(0x03),
        other => Err(AvError::invalid(command, format!("unknown value '{other}'"))),
    }
}

fn up_down(command: SrgCommand, value: &Value) -> AvResult<u8> {
    match text(command, value)? {
        "Up" => Ok(0x02),
        "Down" => Ok(0x03),
        "Reset" => Ok(0x00),
        other => Err(AvError::invalid(command, format!("unknown value '{other}'"))),
    }
}

fn parameter(command: SrgCommand, qualifier: &Qualifier, name: &str, min: i64, max: i64) -> AvResult<u8> {
    qualifier
        .get(name)
        .and_then(Value::as_int)
        .filter(|n| (min..=max).contains(n))
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| AvError::invalid(command, format!("{name} must be {min}-{max}")))
}

/// Speed-scaled lens drive: `base + speed` for either direction, 0 to stop.
fn lens_drive(command: SrgCommand, value: &Value, qualifier: &Qualifier, speed: &str, out: &str, back: &str) -> AvResult<u8> {
    let direction = text(command, value)?;
    if direction == "Stop" {
        return Ok(0x00);
    }
    let base = if direction == out {
        0x20
    } else if direction == back {
        0x30
    } else {
        return Err(AvError::invalid(command, format!("unknown value '{direction}'")));
    };
    Ok(base + parameter(command, qualifier, speed, 0, 7)?)
}

fn preset(command: SrgCommand, value: &Value) -> AvResult<u8> {
    value
        .as_int()
        .filter(|n| (1..=16).contains(n))
        .and_then(|n| u8::try_from(n - 1).ok())
        .ok_or_else(|| AvError::invalid(command, "preset must be 1-16"))
}

/// Driver for the Sony SRG-300 series.
#[derive(Debug)]
pub struct SonySrg300 {
    sequence: u32,
    in_sync: bool,
}

impl Default for SonySrg300 {
    fn default() -> Self {
        Self::new()
    }
}

impl SonySrg300 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: 0,
            in_sync: false,
        }
    }

    /// Sequence number of the next packet. While out of sync every packet
    /// carries 1, which the camera accepts after a reset.
    fn next_sequence(&mut self) -> u32 {
        if !self.in_sync {
            return 1;
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn packet(&mut self, kind: RequestKind, payload: &[u8]) -> Bytes {
        let mut packet = BytesMut::with_capacity(HEADER_LEN + payload.len());
        packet.put_u8(0x01);
        packet.put_u8(match kind {
            RequestKind::Set => 0x00,
            RequestKind::Update => 0x10,
        });
        // Payloads are at most 16 bytes.
        packet.put_u16(payload.len() as u16);
        packet.put_u32(self.next_sequence());
        packet.put_slice(payload);
        packet.freeze()
    }

    fn decode_inquiry(command: SrgCommand, data: u8) -> Reply<SrgCommand> {
        match data {
            0x02 => Reply::status(command, "On"),
            0x03 => Reply::status(command, "Off"),
            other => Reply::Error(format!("{command}: unexpected reply {other:#04x}")),
        }
    }
}

impl Driver for SonySrg300 {
    type Command = SrgCommand;

    fn model(&self) -> &str {
        "Sony SRG-300"
    }

    fn pacing(&self) -> Pacing {
        Pacing::Paced {
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    fn encode_set(&mut self, command: SrgCommand, value: &Value, qualifier: &Qualifier) -> AvResult<Bytes> {
        let payload: Vec<u8> = match command {
            SrgCommand::AutoFocus => vec![0x81, 0x01, 0x04, 0x38, on_off(command, value)?, 0xFF],
            SrgCommand::BacklightMode => vec![0x81, 0x01, 0x04, 0x33, on_off(command, value)?, 0xFF],
            SrgCommand::Focus => {
                let drive = lens_drive(command, value, qualifier, "Focus Speed", "Far", "Near")?;
                vec![0x81, 0x01, 0x04, 0x08, drive, 0xFF]
            }
            SrgCommand::Gain => vec![0x81, 0x01, 0x04, 0x0C, up_down(command, value)?, 0xFF],
            SrgCommand::Home => vec![0x81, 0x01, 0x06, 0x04, 0xFF],
            SrgCommand::InformationDisplay => {
                vec![0x81, 0x01, 0x7E, 0x01, 0x18, on_off(command, value)?, 0xFF]
            }
            SrgCommand::Iris => vec![0x81, 0x01, 0x04, 0x0B, up_down(command, value)?, 0xFF],
            SrgCommand::IrisDirect => {
                let x = parameter(command, qualifier, "XPos", 0, 15)?;
                let y = parameter(command, qualifier, "YPos", 0, 15)?;
                vec![0x81, 0x01, 0x04, 0x4B, 0x00, 0x00, x, y, 0xFF]
            }
            SrgCommand::IRReceiver => vec![0x81, 0x01, 0x06, 0x08, on_off(command, value)?, 0xFF],
            SrgCommand::PanTilt => {
                let name = text(command, value)?;
                let direction = PAN_TILT_DIRECTIONS
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, d)| *d)
                    .ok_or_else(|| AvError::invalid(command, format!("unknown value '{name}'")))?;
                let pan = parameter(command, qualifier, "Pan Speed", 1, 24)?;
                let tilt = parameter(command, qualifier, "Tilt Speed", 1, 23)?;
                let [hi, lo] = direction.to_be_bytes();
                vec![0x81, 0x01, 0x06, 0x01, pan, tilt, hi, lo, 0xFF]
            }
            SrgCommand::Power => vec![0x81, 0x01, 0x04, 0x00, on_off(command, value)?, 0xFF],
            SrgCommand::PresetRecall => vec![0x81, 0x01, 0x04, 0x3F, 0x02, preset(command, value)?, 0xFF],
            SrgCommand::PresetReset => vec![0x81, 0x01, 0x04, 0x3F, 0x00, preset(command, value)?, 0xFF],
            SrgCommand::PresetSave => vec![0x81, 0x01, 0x04, 0x3F, 0x01, preset(command, value)?, 0xFF],
            SrgCommand::ResetPanTilt => vec![0x81, 0x01, 0x06, 0x05, 0xFF],
            SrgCommand::Zoom => {
                let drive = lens_drive(command, value, qualifier, "Zoom Speed", "Tele", "Wide")?;
                vec![0x81, 0x01, 0x04, 0x07, drive, 0xFF]
            }
            SrgCommand::ConnectionStatus => {
                return Err(AvError::invalid(command, "does not support Set"));
            }
        };
        Ok(self.packet(RequestKind::Set, &payload))
    }

    fn encode_update(&mut self, command: SrgCommand, _qualifier: &Qualifier) -> AvResult<Bytes> {
        let payload: &[u8] = match command {
            SrgCommand::AutoFocus => &[0x81, 0x09, 0x04, 0x38, 0xFF],
            SrgCommand::BacklightMode => &[0x81, 0x09, 0x04, 0x33, 0xFF],
            SrgCommand::InformationDisplay => &[0x81, 0x09, 0x7E, 0x01, 0x18, 0xFF],
            SrgCommand::Power => &[0x81, 0x09, 0x04, 0x00, 0xFF],
            _ => return Err(AvError::invalid(command, "does not support Update")),
        };
        Ok(self.packet(RequestKind::Update, payload))
    }

    fn answer(&mut self, request: &Request<SrgCommand>, reply: &[u8]) -> Option<Vec<Reply<SrgCommand>>> {
        let payload = if reply.len() > HEADER_LEN {
            &reply[HEADER_LEN..]
        } else {
            reply
        };
        if payload.len() < 3 || payload.last() != Some(&0xFF) {
            return None;
        }

        match (payload[1] & 0xF0, request.kind, payload.len()) {
            (0x60, _, _) => {
                let code = payload[2];
                let error = ERRORS
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map_or("Unknown Error", |(_, e)| *e);
                warn!(model = self.model(), command = %request.command, code, "{error}");
                None
            }
            (0x50, RequestKind::Set, 3) => Some(vec![Reply::Ack]),
            (0x50, RequestKind::Update, 4) => {
                Some(vec![Self::decode_inquiry(request.command, payload[2])])
            }
            // ACK of a command; completion follows.
            _ => None,
        }
    }

    fn on_connected(&mut self) -> Option<Bytes> {
        // Requests encoded while out of sync already carried 1.
        self.sequence = 1;
        self.in_sync = true;
        Some(Bytes::from_static(&RESET_SEQUENCE))
    }

    fn on_disconnected(&mut self) {
        self.in_sync = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: SrgCommand, kind: RequestKind) -> Request<SrgCommand> {
        Request {
            command,
            qualifier: Qualifier::new(),
            kind,
            bytes: Bytes::new(),
        }
    }

    #[test]
    fn packets_carry_header_and_sequence() {
        let mut camera = SonySrg300::new();
        let power = camera
            .encode_set(SrgCommand::Power, &"On".into(), &Qualifier::new())
            .unwrap();
        assert_eq!(
            &power[..],
            &[0x01, 0x00, 0x00, 0x06, 0, 0, 0, 1, 0x81, 0x01, 0x04, 0x00, 0x02, 0xFF]
        );

        assert_eq!(camera.on_connected().as_deref(), Some(&RESET_SEQUENCE[..]));
        let query = camera.encode_update(SrgCommand::Power, &Qualifier::new()).unwrap();
        assert_eq!(&query[..4], &[0x01, 0x10, 0x00, 0x05]);
        assert_eq!(&query[4..8], &2u32.to_be_bytes());

        camera.on_disconnected();
        let query = camera.encode_update(SrgCommand::Power, &Qualifier::new()).unwrap();
        assert_eq!(&query[4..8], &1u32.to_be_bytes());
    }

    #[test]
    fn encodes_qualified_motion() {
        let mut camera = SonySrg300::new();
        let speeds = Qualifier::new().with("Pan Speed", 12).with("Tilt Speed", 9);
        let packet = camera.encode_set(SrgCommand::PanTilt, &"Up Left".into(), &speeds).unwrap();
        assert_eq!(&packet[8..], &[0x81, 0x01, 0x06, 0x01, 12, 9, 0x01, 0x01, 0xFF]);

        let zoom = Qualifier::new().with("Zoom Speed", 5);
        let packet = camera.encode_set(SrgCommand::Zoom, &"Wide".into(), &zoom).unwrap();
        assert_eq!(&packet[8..], &[0x81, 0x01, 0x04, 0x07, 0x35, 0xFF]);
        let packet = camera.encode_set(SrgCommand::Zoom, &"Stop".into(), &Qualifier::new()).unwrap();
        assert_eq!(&packet[8..], &[0x81, 0x01, 0x04, 0x07, 0x00, 0xFF]);

        let packet = camera
            .encode_set(SrgCommand::PresetRecall, &Value::Int(16), &Qualifier::new())
            .unwrap();
        assert_eq!(&packet[8..], &[0x81, 0x01, 0x04, 0x3F, 0x02, 0x0F, 0xFF]);
    }

    #[test]
    fn rejects_out_of_range() {
        let mut camera = SonySrg300::new();
        let slow = Qualifier::new().with("Pan Speed", 25).with("Tilt Speed", 1);
        assert!(camera.encode_set(SrgCommand::PanTilt, &"Up".into(), &slow).is_err());
        assert!(camera
            .encode_set(SrgCommand::PresetSave, &Value::Int(0), &Qualifier::new())
            .is_err());
        assert!(camera.encode_update(SrgCommand::Zoom, &Qualifier::new()).is_err());
    }

    #[test]
    fn answers_inquiry_and_completion() {
        let mut camera = SonySrg300::new();
        let query = request(SrgCommand::Power, RequestKind::Update);
        let reply = [0x01, 0x11, 0x00, 0x04, 0, 0, 0, 2, 0x90, 0x50, 0x03, 0xFF];
        assert_eq!(
            camera.answer(&query, &reply),
            Some(vec![Reply::status(SrgCommand::Power, "Off")])
        );

        let set = request(SrgCommand::Home, RequestKind::Set);
        assert_eq!(camera.answer(&set, &[0x90, 0x41, 0xFF]), None);
        assert_eq!(camera.answer(&set, &[0x90, 0x51, 0xFF]), Some(vec![Reply::Ack]));
    }

    #[test]
    fn error_replies_keep_waiting() {
        let mut camera = SonySrg300::new();
        let set = request(SrgCommand::Home, RequestKind::Set);
        assert_eq!(camera.answer(&set, &[0x90, 0x60, 0x02, 0xFF]), None);
        assert_eq!(camera.answer(&set, &[0x90]), None);
    }
}
