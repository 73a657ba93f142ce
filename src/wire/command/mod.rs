use std::fmt;
use std::io::Cursor;

use rmpv::Value;

pub const CMD_FIELD: &str = "Cmd";
pub const AGENT_ID_FIELD: &str = "AgentID";
pub const WORKER_ID_FIELD: &str = "WorkerID";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Join,
    Leave,
    Heartbeat,
    Shutdown,
    NewWorker,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Heartbeat => "heartbeat",
            Self::Shutdown => "shutdown",
            Self::NewWorker => "new-worker",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "join" => Some(Self::Join),
            "leave" => Some(Self::Leave),
            "heartbeat" => Some(Self::Heartbeat),
            "shutdown" => Some(Self::Shutdown),
            "new-worker" => Some(Self::NewWorker),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandRecord {
    pub cmd: String,
    pub agent_id: String,
    pub worker_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Join { agent_id: String },
    Leave { agent_id: String },
    Heartbeat { agent_id: String },
    Shutdown { agent_id: String },
    NewWorker { agent_id: String, worker_id: String },
}

#[derive(Debug, PartialEq, Eq)]
pub enum BodyError {
    Encode(String),
    Decode(String),
    TrailingData,
    BodyMustBeMap,
    KeyMustBeString,
    FieldMustBeString { field: String },
}

impl fmt::Display for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(source) => write!(f, "messagepack encode error: {source}"),
            Self::Decode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingData => write!(f, "record body contains trailing MessagePack data"),
            Self::BodyMustBeMap => write!(f, "record body must be a map"),
            Self::KeyMustBeString => write!(f, "record body keys must be UTF-8 strings"),
            Self::FieldMustBeString { field } => {
                write!(f, "record field '{field}' must be a string")
            }
        }
    }
}

impl std::error::Error for BodyError {}

#[derive(Debug, PartialEq, Eq)]
pub enum CommandError {
    UnknownCommand { cmd: String },
    MissingAgentId { cmd: CommandKind },
    MissingWorkerId,
    UnexpectedWorkerId { cmd: CommandKind },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand { cmd } => write!(f, "unknown command '{cmd}'"),
            Self::MissingAgentId { cmd } => {
                write!(f, "'{cmd}' record requires a non-empty AgentID")
            }
            Self::MissingWorkerId => write!(f, "'new-worker' record requires a non-empty WorkerID"),
            Self::UnexpectedWorkerId { cmd } => {
                write!(f, "'{cmd}' record must not carry a WorkerID")
            }
        }
    }
}

impl std::error::Error for CommandError {}

impl CommandRecord {
    pub fn to_body(&self) -> Result<Vec<u8>, BodyError> {
        let value = Value::Map(vec![
            (Value::from(CMD_FIELD), Value::from(self.cmd.as_str())),
            (Value::from(AGENT_ID_FIELD), Value::from(self.agent_id.as_str())),
            (Value::from(WORKER_ID_FIELD), Value::from(self.worker_id.as_str())),
        ]);

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &value)
            .map_err(|source| BodyError::Encode(source.to_string()))?;
        Ok(encoded)
    }

    pub fn from_body(body: &[u8]) -> Result<Self, BodyError> {
        let mut cursor = Cursor::new(body);
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|source| BodyError::Decode(source.to_string()))?;
        if cursor.position() as usize != body.len() {
            return Err(BodyError::TrailingData);
        }

        let Value::Map(entries) = value else {
            return Err(BodyError::BodyMustBeMap);
        };

        let mut record = Self::default();
        for (key, value) in entries {
            let Some(key) = key.as_str() else {
                return Err(BodyError::KeyMustBeString);
            };
            let slot = match key {
                CMD_FIELD => &mut record.cmd,
                AGENT_ID_FIELD => &mut record.agent_id,
                WORKER_ID_FIELD => &mut record.worker_id,
                // Unknown keys are tolerated so newer peers can add fields.
                _ => continue,
            };
            match value {
                Value::Nil => slot.clear(),
                Value::String(text) => {
                    let Some(text) = text.as_str() else {
                        return Err(BodyError::FieldMustBeString {
                            field: key.to_owned(),
                        });
                    };
                    *slot = text.to_owned();
                }
                _ => {
                    return Err(BodyError::FieldMustBeString {
                        field: key.to_owned(),
                    });
                }
            }
        }

        Ok(record)
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Join { .. } => CommandKind::Join,
            Self::Leave { .. } => CommandKind::Leave,
            Self::Heartbeat { .. } => CommandKind::Heartbeat,
            Self::Shutdown { .. } => CommandKind::Shutdown,
            Self::NewWorker { .. } => CommandKind::NewWorker,
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::Join { agent_id }
            | Self::Leave { agent_id }
            | Self::Heartbeat { agent_id }
            | Self::Shutdown { agent_id }
            | Self::NewWorker { agent_id, .. } => agent_id,
        }
    }

    pub fn to_record(&self) -> CommandRecord {
        let worker_id = match self {
            Self::NewWorker { worker_id, .. } => worker_id.clone(),
            _ => String::new(),
        };
        CommandRecord {
            cmd: self.kind().as_str().to_owned(),
            agent_id: self.agent_id().to_owned(),
            worker_id,
        }
    }
}

impl TryFrom<CommandRecord> for Command {
    type Error = CommandError;

    fn try_from(record: CommandRecord) -> Result<Self, Self::Error> {
        let Some(kind) = CommandKind::parse(&record.cmd) else {
            return Err(CommandError::UnknownCommand { cmd: record.cmd });
        };

        if kind == CommandKind::NewWorker {
            if record.worker_id.is_empty() {
                return Err(CommandError::MissingWorkerId);
            }
            return Ok(Self::NewWorker {
                agent_id: record.agent_id,
                worker_id: record.worker_id,
            });
        }

        if record.agent_id.is_empty() {
            return Err(CommandError::MissingAgentId { cmd: kind });
        }
        if !record.worker_id.is_empty() {
            return Err(CommandError::UnexpectedWorkerId { cmd: kind });
        }

        let agent_id = record.agent_id;
        Ok(match kind {
            CommandKind::Join => Self::Join { agent_id },
            CommandKind::Leave => Self::Leave { agent_id },
            CommandKind::Heartbeat => Self::Heartbeat { agent_id },
            CommandKind::Shutdown => Self::Shutdown { agent_id },
            CommandKind::NewWorker => Self::NewWorker {
                agent_id,
                worker_id: record.worker_id,
            },
        })
    }
}
