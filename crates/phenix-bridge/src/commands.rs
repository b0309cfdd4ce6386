//! Console commands read from stdin by the bridge binary.

use thiserror::Error;

use phenix_protocol::CommandCode;

use crate::events::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send { device_id: DeviceId, text: String },
    Command { device_id: DeviceId, code: CommandCode, data: Vec<u8> },
    Rekey(DeviceId),
    Disconnect(DeviceId),
    List,
    Info(DeviceId),
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("commands start with '/'")]
    NotACommand,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid device id: {0}")]
    InvalidDevice(String),

    #[error("unknown device command: {0}")]
    InvalidCode(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let rest = line.strip_prefix('/').ok_or(ParseError::NotACommand)?;
        let (name, args) = split_word(rest);

        match name {
            "send" => {
                let (id, text) = split_word(args);
                if id.is_empty() || text.is_empty() {
                    return Err(ParseError::Usage("/send <device> <text>"));
                }
                Ok(Self::Send {
                    device_id: parse_device(id)?,
                    text: text.to_string(),
                })
            }
            "cmd" => {
                let (id, rest) = split_word(args);
                let (code, data) = split_word(rest);
                if id.is_empty() || code.is_empty() {
                    return Err(ParseError::Usage("/cmd <device> <status|message|rekey|reset|0xNN> [data]"));
                }
                Ok(Self::Command {
                    device_id: parse_device(id)?,
                    code: parse_code(code)?,
                    data: data.as_bytes().to_vec(),
                })
            }
            "rekey" => Ok(Self::Rekey(single_device(args, "/rekey <device>")?)),
            "disconnect" => Ok(Self::Disconnect(single_device(args, "/disconnect <device>")?)),
            "info" => Ok(Self::Info(single_device(args, "/info <device>")?)),
            "list" => Ok(Self::List),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

fn parse_device(s: &str) -> Result<DeviceId, ParseError> {
    s.parse().map_err(|_| ParseError::InvalidDevice(s.to_string()))
}

fn single_device(args: &str, usage: &'static str) -> Result<DeviceId, ParseError> {
    let (id, rest) = split_word(args);
    if id.is_empty() || !rest.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    parse_device(id)
}

fn parse_code(s: &str) -> Result<CommandCode, ParseError> {
    let code = match s.to_ascii_lowercase().as_str() {
        "status" | "get_status" => CommandCode::GetStatus,
        "message" | "send_message" => CommandCode::SendMessage,
        "rekey" => CommandCode::Rekey,
        "reset" => CommandCode::Reset,
        other => {
            let byte = other
                .strip_prefix("0x")
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| ParseError::InvalidCode(s.to_string()))?;
            CommandCode::from_byte(byte).map_err(|_| ParseError::InvalidCode(s.to_string()))?
        }
    };
    Ok(code)
}
