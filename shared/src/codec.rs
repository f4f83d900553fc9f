//! Property-list codec for command envelopes
//!
//! Every command is rendered as:
//! ```text
//! <plist version="1.0">
//!   <dict>
//!     <key>CommandUUID</key> <string>..</string>
//!     <key>Command</key>
//!     <dict> <key>RequestType</key> <string>..</string> ..variant keys.. </dict>
//!   </dict>
//! </plist>
//! ```
//!
//! Decoding accepts any key order and ignores keys it does not know.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Write;
use thiserror::Error;

use crate::{
    Command, CommandPayload, DeviceLockSecret, ObliterationBehavior, RequestType, SecretError,
};

const PLIST_DOCTYPE: &str =
    r#"plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd""#;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Write error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed plist: {0}")]
    Malformed(String),

    #[error("Missing key: {0}")]
    MissingKey(&'static str),

    #[error("Key {key} must be a {expected}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("CommandUUID is empty")]
    EmptyCommandUuid,

    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("Unknown obliteration behavior: {0}")]
    UnknownObliterationBehavior(String),

    #[error("Invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid PIN: {0}")]
    Secret(#[from] SecretError),
}

/// Render a command into its plist wire document
pub fn encode(command: &Command) -> Result<Bytes, CodecError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b'\t', 1);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::DocType(BytesText::from_escaped(PLIST_DOCTYPE)))?;
    writer.write_event(Event::Start(
        BytesStart::new("plist").with_attributes([("version", "1.0")]),
    ))?;
    writer.write_event(Event::Start(BytesStart::new("dict")))?;

    write_string_entry(&mut writer, "CommandUUID", &command.command_uuid)?;
    write_key(&mut writer, "Command")?;
    writer.write_event(Event::Start(BytesStart::new("dict")))?;
    write_string_entry(&mut writer, "RequestType", command.request_type().as_str())?;

    match &command.payload {
        CommandPayload::InstallProfile { payload } => {
            write_key(&mut writer, "Payload")?;
            write_element(&mut writer, "data", &STANDARD.encode(payload))?;
        }
        CommandPayload::RemoveProfile { identifier } => {
            write_string_entry(&mut writer, "Identifier", identifier)?;
        }
        CommandPayload::DeviceLock { pin } => {
            write_string_entry(&mut writer, "PIN", pin.as_str())?;
        }
        CommandPayload::EraseDevice { pin, obliteration } => {
            write_string_entry(&mut writer, "PIN", pin.as_str())?;
            write_string_entry(&mut writer, "ObliterationBehavior", obliteration.as_str())?;
        }
        CommandPayload::InstallEnterpriseApplication { manifest_url } => {
            write_string_entry(&mut writer, "ManifestURL", manifest_url)?;
        }
        CommandPayload::AccountConfiguration {
            full_name,
            user_name,
            lock_primary_account_info,
        } => {
            write_string_entry(&mut writer, "PrimaryAccountFullName", full_name)?;
            write_string_entry(&mut writer, "PrimaryAccountUserName", user_name)?;
            write_key(&mut writer, "LockPrimaryAccountInfo")?;
            let flag = if *lock_primary_account_info { "true" } else { "false" };
            writer.write_event(Event::Empty(BytesStart::new(flag)))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("dict")))?;
    writer.write_event(Event::End(BytesEnd::new("dict")))?;
    writer.write_event(Event::End(BytesEnd::new("plist")))?;

    Ok(Bytes::from(writer.into_inner()))
}

/// Parse a plist wire document back into a command
pub fn decode(raw: &[u8]) -> Result<Command, CodecError> {
    let root = PlistParser::new(raw).parse_document()?;
    command_from_value(root)
}

fn write_key<W: Write>(writer: &mut Writer<W>, key: &str) -> Result<(), CodecError> {
    write_element(writer, "key", key)
}

fn write_string_entry<W: Write>(
    writer: &mut Writer<W>,
    key: &str,
    value: &str,
) -> Result<(), CodecError> {
    write_key(writer, key)?;
    write_element(writer, "string", value)
}

fn write_element<W: Write>(
    writer: &mut Writer<W>,
    tag: &str,
    text: &str,
) -> Result<(), CodecError> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

/// Subset of plist values that commands use
#[derive(Debug, Clone, PartialEq)]
enum Value {
    String(String),
    Data(Vec<u8>),
    Integer(i64),
    Bool(bool),
    Array(Vec<Value>),
    Dict(Dict),
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Dict(Vec<(String, Value)>);

impl Dict {
    fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn string(&self, key: &'static str) -> Result<&str, CodecError> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(CodecError::WrongType {
                key,
                expected: "string",
            }),
            None => Err(CodecError::MissingKey(key)),
        }
    }

    fn data(&self, key: &'static str) -> Result<&[u8], CodecError> {
        match self.get(key) {
            Some(Value::Data(d)) => Ok(d),
            Some(_) => Err(CodecError::WrongType {
                key,
                expected: "data",
            }),
            None => Err(CodecError::MissingKey(key)),
        }
    }

    fn dict(&self, key: &'static str) -> Result<&Dict, CodecError> {
        match self.get(key) {
            Some(Value::Dict(d)) => Ok(d),
            Some(_) => Err(CodecError::WrongType {
                key,
                expected: "dict",
            }),
            None => Err(CodecError::MissingKey(key)),
        }
    }

    fn get_display(&self, key: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s.clone(),
            other => format!("{:?}", other),
        }
    }

    fn bool_or(&self, key: &'static str, default: bool) -> Result<bool, CodecError> {
        match self.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(CodecError::WrongType {
                key,
                expected: "boolean",
            }),
            None => Ok(default),
        }
    }
}

fn command_from_value(root: Value) -> Result<Command, CodecError> {
    let Value::Dict(root) = root else {
        return Err(CodecError::Malformed("top-level value is not a dict".into()));
    };

    let command_uuid = root.string("CommandUUID")?;
    if command_uuid.trim().is_empty() {
        return Err(CodecError::EmptyCommandUuid);
    }

    let body = root.dict("Command")?;
    let request_type: RequestType = body
        .string("RequestType")?
        .parse()
        .map_err(|_| CodecError::UnknownRequestType(body.get_display("RequestType")))?;

    let payload = match request_type {
        RequestType::InstallProfile => CommandPayload::InstallProfile {
            payload: Bytes::copy_from_slice(body.data("Payload")?),
        },
        RequestType::RemoveProfile => CommandPayload::RemoveProfile {
            identifier: body.string("Identifier")?.to_string(),
        },
        RequestType::DeviceLock => CommandPayload::DeviceLock {
            pin: DeviceLockSecret::try_from(body.string("PIN")?)?,
        },
        RequestType::EraseDevice => {
            let obliteration = match body.get("ObliterationBehavior") {
                None => ObliterationBehavior::Default,
                Some(_) => {
                    let raw = body.string("ObliterationBehavior")?;
                    raw.parse()
                        .map_err(|_| CodecError::UnknownObliterationBehavior(raw.to_string()))?
                }
            };
            CommandPayload::EraseDevice {
                pin: DeviceLockSecret::try_from(body.string("PIN")?)?,
                obliteration,
            }
        }
        RequestType::InstallEnterpriseApplication => CommandPayload::InstallEnterpriseApplication {
            manifest_url: body.string("ManifestURL")?.to_string(),
        },
        RequestType::AccountConfiguration => CommandPayload::AccountConfiguration {
            full_name: body.string("PrimaryAccountFullName")?.to_string(),
            user_name: body.string("PrimaryAccountUserName")?.to_string(),
            lock_primary_account_info: body.bool_or("LockPrimaryAccountInfo", false)?,
        },
    };

    Ok(Command::new(command_uuid, payload))
}

/// Pull parser from XML events to [`Value`]s
struct PlistParser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> PlistParser<'a> {
    fn new(raw: &'a [u8]) -> Self {
        // No trimming: whitespace inside <string> is data
        Self {
            reader: Reader::from_reader(raw),
        }
    }

    /// Next event, skipping prolog and comments
    fn next_raw(&mut self) -> Result<Event<'a>, CodecError> {
        loop {
            match self.reader.read_event()? {
                Event::Decl(_) | Event::DocType(_) | Event::Comment(_) | Event::PI(_) => continue,
                Event::Eof => return Err(CodecError::Malformed("unexpected end of document".into())),
                event => return Ok(event),
            }
        }
    }

    /// Next event that carries structure; indentation between elements is skipped
    fn next_event(&mut self) -> Result<Event<'a>, CodecError> {
        loop {
            match self.next_raw()? {
                Event::Text(t) if t.iter().all(u8::is_ascii_whitespace) => continue,
                event => return Ok(event),
            }
        }
    }

    fn parse_document(mut self) -> Result<Value, CodecError> {
        match self.next_event()? {
            Event::Start(e) if e.name().as_ref() == b"plist" => {}
            other => return Err(unexpected("<plist>", &other)),
        }

        let first = self.next_event()?;
        let value = self.parse_value(first)?;

        match self.next_event()? {
            Event::End(e) if e.name().as_ref() == b"plist" => Ok(value),
            other => Err(unexpected("</plist>", &other)),
        }
    }

    fn parse_value(&mut self, event: Event<'a>) -> Result<Value, CodecError> {
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"dict" => self.parse_dict(),
                b"array" => self.parse_array(),
                b"string" => Ok(Value::String(self.read_text("string")?)),
                b"data" => {
                    let text = self.read_text("data")?;
                    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                    Ok(Value::Data(STANDARD.decode(compact)?))
                }
                b"integer" => {
                    let text = self.read_text("integer")?;
                    text.trim()
                        .parse()
                        .map(Value::Integer)
                        .map_err(|_| CodecError::Malformed(format!("bad integer: {text}")))
                }
                b"true" => {
                    self.read_text("true")?;
                    Ok(Value::Bool(true))
                }
                b"false" => {
                    self.read_text("false")?;
                    Ok(Value::Bool(false))
                }
                other => Err(CodecError::Malformed(format!(
                    "unsupported element <{}>",
                    String::from_utf8_lossy(other)
                ))),
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"true" => Ok(Value::Bool(true)),
                b"false" => Ok(Value::Bool(false)),
                b"string" => Ok(Value::String(String::new())),
                b"data" => Ok(Value::Data(Vec::new())),
                b"dict" => Ok(Value::Dict(Dict::default())),
                b"array" => Ok(Value::Array(Vec::new())),
                other => Err(CodecError::Malformed(format!(
                    "unsupported element <{}/>",
                    String::from_utf8_lossy(other)
                ))),
            },
            other => Err(unexpected("a value", &other)),
        }
    }

    fn parse_dict(&mut self) -> Result<Value, CodecError> {
        let mut entries = Vec::new();
        loop {
            match self.next_event()? {
                Event::End(e) if e.name().as_ref() == b"dict" => break,
                Event::Start(e) if e.name().as_ref() == b"key" => {
                    let key = self.read_text("key")?;
                    let next = self.next_event()?;
                    let value = self.parse_value(next)?;
                    entries.push((key, value));
                }
                other => return Err(unexpected("<key> or </dict>", &other)),
            }
        }
        Ok(Value::Dict(Dict(entries)))
    }

    fn parse_array(&mut self) -> Result<Value, CodecError> {
        let mut items = Vec::new();
        loop {
            match self.next_event()? {
                Event::End(e) if e.name().as_ref() == b"array" => break,
                event => items.push(self.parse_value(event)?),
            }
        }
        Ok(Value::Array(items))
    }

    /// Collect text up to the closing tag; an empty element yields ""
    fn read_text(&mut self, tag: &str) -> Result<String, CodecError> {
        let mut text = String::new();
        loop {
            match self.next_raw()? {
                Event::Text(t) => text.push_str(&t.unescape()?),
                Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c.into_inner())),
                Event::End(e) if e.name().as_ref() == tag.as_bytes() => return Ok(text),
                other => return Err(unexpected(&format!("text or </{tag}>"), &other)),
            }
        }
    }
}

fn unexpected(expected: &str, got: &Event<'_>) -> CodecError {
    CodecError::Malformed(format!("expected {expected}, found {:?}", got))
}
