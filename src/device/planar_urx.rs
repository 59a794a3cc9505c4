//! Planar UltraRes X series display (ASCII protocol over RS-232 or TCP).
//!
//! Commands are `(KEY=value)\r`, queries `(KEY?)\r`, replies
//! `(0;KEY=value)\r`. A non-zero leading code is an error reply.

use super::command::command_set;
use super::{Driver, MatchTable, Qualifier, Reply, Value, MAX_RECEIVE_BUFFER};
use crate::error::{AvError, AvResult};
use bytes::{Bytes, BytesMut};
use regex::bytes::Captures;

command_set! {
    /// Commands of the UltraRes X.
    pub enum UrxCommand {
        ConnectionStatus => "ConnectionStatus",
        Input => "Input",
        InputMode => "InputMode",
        MenuNavigation => "MenuNavigation",
        MultipleInput => "MultipleInput" ["Input"],
        Power => "Power",
        PresetRecall => "PresetRecall",
        PresetSave => "PresetSave",
    }
}

const INPUTS: &[(&str, &str)] = &[
    ("DisplayPort", "0"),
    ("HDMI 1", "4"),
    ("HDMI 2", "5"),
    ("HDMI 3", "6"),
    ("HDMI 4", "7"),
];

const INPUT_MODES: &[(&str, &str)] = &[("Single", "0"), ("Multiple", "2")];

const MENU_KEYS: &[(&str, &str)] = &[
    ("Menu", "3"),
    ("Up", "5"),
    ("Down", "6"),
    ("Left", "7"),
    ("Right", "8"),
    ("Enter", "4"),
];

const MULTI_SOURCES: &[(&str, &str)] = &[("Input Source", "0"), ("DisplayPort", "1"), ("HDMI", "2")];

const POWER_SET: &[(&str, &str)] = &[("On", "1"), ("Off", "0")];

const POWER_STATES: &[(&str, &str)] = &[
    ("On", "2"),
    ("Off", "0"),
    ("Powering Up", "1"),
    ("Powering Down", "3"),
    ("Error", "4"),
];

const ERROR_COMMANDS: &[(&str, &str)] = &[
    ("Input", "INS"),
    ("Input Mode", "INM"),
    ("Menu Navigation", "KEY"),
    ("Multi Input 1", "MI1"),
    ("Multi Input 2", "MI2"),
    ("Multi Input 3", "MI3"),
    ("Multi Input 4", "MI4"),
    ("Preset Recall", "PSA"),
    ("Preset Save", "PSS"),
    ("Power", "PWR"),
    ("Power", "STA"),
];

const ERROR_CODES: &[(&str, &str)] = &[
    ("Unknown command code", "1"),
    ("Invalid operator", "2"),
    ("Destination parameter", "3"),
    ("Setting not available", "4"),
    ("Setting value not available", "5"),
    ("Setting value not supported", "6"),
    ("String too long", "7"),
    ("Command not supported in standby mode", "8"),
    ("Invalid parameter", "9"),
    ("Error processing command", "10"),
    ("Password not entered", "11"),
];

/// Wire code for a named value.
fn code(table: &[(&'static str, &'static str)], name: &str) -> Option<&'static str> {
    table.iter().find(|(n, _)| *n == name).map(|(_, c)| *c)
}

/// Name for a wire code.
fn name(table: &[(&'static str, &'static str)], code: &[u8]) -> Option<&'static str> {
    table.iter().find(|(_, c)| c.as_bytes() == code).map(|(n, _)| *n)
}

fn group<'c>(caps: &'c Captures<'_>, index: usize) -> &'c [u8] {
    caps.get(index).map_or(&[], |m| m.as_bytes())
}

fn match_input(caps: &Captures<'_>) -> Option<Reply<UrxCommand>> {
    Some(Reply::status(UrxCommand::Input, name(INPUTS, group(caps, 1))?))
}

fn match_input_mode(caps: &Captures<'_>) -> Option<Reply<UrxCommand>> {
    Some(Reply::status(UrxCommand::InputMode, name(INPUT_MODES, group(caps, 1))?))
}

fn match_multiple_input(caps: &Captures<'_>) -> Option<Reply<UrxCommand>> {
    let window = std::str::from_utf8(group(caps, 1)).ok()?;
    Some(Reply::Status {
        command: UrxCommand::MultipleInput,
        value: name(MULTI_SOURCES, group(caps, 2))?.into(),
        qualifier: Qualifier::new().with("Input", window),
    })
}

fn match_power(caps: &Captures<'_>) -> Option<Reply<UrxCommand>> {
    Some(Reply::status(UrxCommand::Power, name(POWER_STATES, group(caps, 1))?))
}

fn match_error(caps: &Captures<'_>) -> Option<Reply<UrxCommand>> {
    let command = name(ERROR_COMMANDS, group(caps, 2))?;
    let error = name(ERROR_CODES, group(caps, 1))?;
    Some(Reply::Error(format!("{command}: {error}.")))
}

/// Driver for the Planar UltraRes X.
#[derive(Debug)]
pub struct PlanarUrx {
    table: MatchTable<UrxCommand>,
}

impl PlanarUrx {
    pub fn new() -> AvResult<Self> {
        let mut table = MatchTable::new(MAX_RECEIVE_BUFFER);
        table.add(r"\(0;INS=([04567])\)\r", match_input)?;
        table.add(r"\(0;INM=([02])\)\r", match_input_mode)?;
        table.add(r"\(0;MI([1-4])=([012])\)\r", match_multiple_input)?;
        table.add(r"\(0;STA=([0-4])\)\r", match_power)?;
        table.add(
            r#"\(([1-9]|1[01]);(INS|INM|KEY|MI[1-4]|PSA|PSS|PWR|STA)=["\w ]+\)\r"#,
            match_error,
        )?;
        Ok(Self { table })
    }
}

fn text(command: UrxCommand, value: &Value) -> AvResult<&str> {
    value
        .as_text()
        .ok_or_else(|| AvError::invalid(command, format!("expected text, got {value}")))
}

fn lookup(command: UrxCommand, table: &[(&'static str, &'static str)], value: &Value) -> AvResult<&'static str> {
    code(table, text(command, value)?)
        .ok_or_else(|| AvError::invalid(command, format!("unknown value '{value}'")))
}

fn window(qualifier: &Qualifier) -> AvResult<i64> {
    qualifier
        .get("Input")
        .and_then(Value::as_int)
        .filter(|n| (1..=4).contains(n))
        .ok_or_else(|| AvError::invalid(UrxCommand::MultipleInput, "Input must be 1-4"))
}

fn preset(command: UrxCommand, value: &Value) -> AvResult<i64> {
    value
        .as_int()
        .filter(|n| (0..=7).contains(n))
        .ok_or_else(|| AvError::invalid(command, "preset must be 0-7"))
}

impl Driver for PlanarUrx {
    type Command = UrxCommand;

    fn model(&self) -> &str {
        "Planar UltraRes X"
    }

    fn encode_set(&mut self, command: UrxCommand, value: &Value, qualifier: &Qualifier) -> AvResult<Bytes> {
        let wire = match command {
            UrxCommand::Input => format!("(INS={})\r", lookup(command, INPUTS, value)?),
            UrxCommand::InputMode => format!("(INM={})\r", lookup(command, INPUT_MODES, value)?),
            UrxCommand::MenuNavigation => format!("(KEY={})\r", lookup(command, MENU_KEYS, value)?),
            UrxCommand::MultipleInput => format!(
                "(MI{}={})\r",
                window(qualifier)?,
                lookup(command, MULTI_SOURCES, value)?
            ),
            UrxCommand::Power => format!("(PWR={})\r", lookup(command, POWER_SET, value)?),
            UrxCommand::PresetRecall => format!("(PSA={})\r", preset(command, value)?),
            UrxCommand::PresetSave => format!("(PSS={})\r", preset(command, value)?),
            UrxCommand::ConnectionStatus => {
                return Err(AvError::invalid(command, "does not support Set"));
            }
        };
        Ok(Bytes::from(wire))
    }

    fn encode_update(&mut self, command: UrxCommand, qualifier: &Qualifier) -> AvResult<Bytes> {
        let wire = match command {
            UrxCommand::Input => "(INS?)\r".to_string(),
            UrxCommand::InputMode => "(INM?)\r".to_string(),
            UrxCommand::MultipleInput => format!("(MI{}?)\r", window(qualifier)?),
            UrxCommand::Power => "(STA?)\r".to_string(),
            _ => return Err(AvError::invalid(command, "does not support Update")),
        };
        Ok(Bytes::from(wire))
    }

    fn scan(&mut self, buffer: &mut BytesMut) -> Vec<Reply<UrxCommand>> {
        self.table.scan(buffer)
    }
}
