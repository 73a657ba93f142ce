pub mod codec;
pub mod command;

pub use codec::{CodecError, FrameDecoder, LivenessProbe, MAGIC, encode_command, write_command};
pub use command::{Command, CommandError, CommandKind, CommandRecord};
